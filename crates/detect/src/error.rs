//! Error taxonomy for the detect crate.
//!
//! The heuristic strategy never fails: it is pure pattern matching over a
//! string. Only the LLM-backed strategy has a failure surface, and per the
//! failure semantics in the design, those failures degrade to a no-op
//! rather than propagating — `DetectError` exists for the backend adapters
//! to report *why* a call was skipped, for logging.

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("llm backend request failed: {0}")]
    Backend(String),
    #[error("llm response was not valid JSON: {0}")]
    InvalidResponse(String),
    #[error("llm call cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DetectError>;
