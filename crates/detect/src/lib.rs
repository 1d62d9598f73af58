//! Intent classification strategies.
//!
//! Three strategies share the same output contract (`DetectedIntent`):
//! a synchronous, zero-cost [`heuristic`] pass; an async, batched
//! [`llm`] pass with its own triggers and rate limiting; and a
//! [`parallel`] strategy that runs both and reconciles disagreements.

pub mod error;
pub mod heuristic;
pub mod llm;
pub mod parallel;

pub use error::{DetectError, Result};
pub use heuristic::HeuristicDetector;
pub use llm::{HttpLlmBackend, LlmDetector, LlmDetectorConfig, LlmIntentBackend, StubLlmBackend};
pub use parallel::ParallelStrategy;

use serde::{Deserialize, Serialize};

/// Which classification strategy the pipeline is configured to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Pure pattern matching, no network calls.
    Heuristic,
    /// Batched, context-aware classification via an LLM backend.
    Llm,
    /// Heuristic fires immediately; LLM corrects in the background.
    Parallel,
    /// Trust the ASR provider's own intent signal, when it emits one.
    DeepgramIntent,
}

impl Default for DetectionMode {
    fn default() -> Self {
        DetectionMode::Heuristic
    }
}
