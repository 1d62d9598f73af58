//! Error taxonomy for recording and playback.
//!
//! Per the design's failure semantics, most of these degrade rather than
//! propagate: a disk write failure stops recording but never the
//! pipeline, and an unparsable line is skipped rather than aborting
//! playback. `RecorderError`/`PlayerError` exist for the caller to
//! observe and log *why*.

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("recording I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type RecorderResult<T> = std::result::Result<T, RecorderError>;

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("failed to open recording: {0}")]
    Io(#[from] std::io::Error),
}

pub type PlayerResult<T> = std::result::Result<T, PlayerError>;
