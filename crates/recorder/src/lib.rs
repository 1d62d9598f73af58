//! Session recording and deterministic playback.
//!
//! [`recorder::SessionRecorder`] subscribes to the pipeline's event
//! streams and appends a tagged JSON line per event. [`player::SessionPlayer`]
//! loads that log back and replays only its input events (`AsrEvent`,
//! `UtteranceEndSignal`) into a fresh pipeline, honoring the original
//! inter-event delays.

pub mod error;
pub mod player;
pub mod recorder;

pub use error::{PlayerError, PlayerResult, RecorderError, RecorderResult};
pub use player::{PlaybackControl, ReplayInput, ReplayOutcome, SessionPlayer};
pub use recorder::SessionRecorder;
