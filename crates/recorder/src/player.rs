//! Loads a recorded session and replays its input events into a fresh
//! pipeline, honoring the original inter-event delays.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use utterance_events::{AsrEvent, RecordedEvent, SessionConfig};

use crate::error::PlayerResult;

/// The subset of a recorded line that actually drives a fresh pipeline.
/// Output records (utterance/intent/action) are regenerated, not replayed.
#[derive(Debug, Clone)]
pub enum ReplayInput {
    Asr(AsrEvent),
    UtteranceEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Complete,
    Cancelled,
}

/// Pause/resume/cancel handle shared between the caller and the replay loop.
#[derive(Clone)]
pub struct PlaybackControl {
    paused: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl PlaybackControl {
    pub fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            resume_notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn wait_while_paused(&self) {
        while self.paused.load(Ordering::SeqCst) && !self.cancel.is_cancelled() {
            tokio::select! {
                _ = self.resume_notify.notified() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }
}

impl Default for PlaybackControl {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed recording, ready to be replayed.
pub struct SessionPlayer {
    records: Vec<RecordedEvent>,
    metadata: Option<SessionConfig>,
    skipped_lines: usize,
}

impl SessionPlayer {
    pub fn load(path: impl AsRef<Path>) -> PlayerResult<Self> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        let mut metadata = None;
        let mut skipped_lines = 0;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RecordedEvent>(&line) {
                Ok(RecordedEvent::SessionMetadata { config, .. }) => {
                    metadata = Some(config);
                }
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unparsable recording line");
                    skipped_lines += 1;
                }
            }
        }

        Ok(Self {
            records,
            metadata,
            skipped_lines,
        })
    }

    pub fn metadata(&self) -> Option<&SessionConfig> {
        self.metadata.as_ref()
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn input_record_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_replayable_input()).count()
    }

    /// Replays input records in order, sleeping between them for the
    /// original inter-event delay (from `offset_ms`). `on_input` is called
    /// synchronously for each input; it should hand the event to a fresh
    /// pipeline instance.
    pub async fn replay_into(
        &self,
        control: &PlaybackControl,
        mut on_input: impl FnMut(ReplayInput),
    ) -> ReplayOutcome {
        let mut last_offset = 0u64;

        for record in &self.records {
            if !record.is_replayable_input() {
                continue;
            }
            let offset = record.offset_ms();
            let delay = offset.saturating_sub(last_offset);
            last_offset = offset;

            if delay > 0 {
                tokio::select! {
                    _ = control.cancel.cancelled() => return ReplayOutcome::Cancelled,
                    _ = tokio::time::sleep(StdDuration::from_millis(delay)) => {}
                }
            }

            control.wait_while_paused().await;
            if control.is_cancelled() {
                return ReplayOutcome::Cancelled;
            }

            match record {
                RecordedEvent::AsrEvent { event, .. } => on_input(ReplayInput::Asr(event.clone())),
                RecordedEvent::UtteranceEndSignal { .. } => on_input(ReplayInput::UtteranceEnd),
                _ => unreachable!("is_replayable_input filters to AsrEvent/UtteranceEndSignal"),
            }
        }

        ReplayOutcome::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_session(lines: &[&str]) -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.into_temp_path()
    }

    #[test]
    fn unparsable_lines_are_skipped_not_fatal() {
        let path = write_session(&[
            r#"{"type":"SessionMetadata","offsetMs":0,"version":1,"recordedAtUtc":"2024-01-01T00:00:00Z","config":{}}"#,
            "not json at all",
            r#"{"type":"UtteranceEndSignal","offsetMs":10}"#,
        ]);

        let player = SessionPlayer::load(&path).unwrap();
        assert_eq!(player.skipped_lines(), 1);
        assert_eq!(player.input_record_count(), 1);
    }

    #[test]
    fn missing_metadata_defaults_are_tolerated() {
        let path = write_session(&[r#"{"type":"UtteranceEndSignal","offsetMs":0}"#]);
        let player = SessionPlayer::load(&path).unwrap();
        assert!(player.metadata().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_honors_inter_event_delays_and_skips_output_records() {
        let path = write_session(&[
            r#"{"type":"SessionMetadata","offsetMs":0,"version":1,"recordedAtUtc":"2024-01-01T00:00:00Z","config":{}}"#,
            r#"{"type":"AsrEvent","offsetMs":0,"event":{"text":"hello","isFinal":true,"receivedAt":"2024-01-01T00:00:00Z"}}"#,
            r#"{"type":"ActionEvent","offsetMs":50,"event":{"actionName":"stop","intent":{"type":"Imperative","confidence":0.9,"slots":{},"sourceText":"stop"},"utteranceId":"utt_0001","timestamp":"2024-01-01T00:00:00Z","wasDebounced":false}}"#,
            r#"{"type":"UtteranceEndSignal","offsetMs":100}"#,
        ]);

        let player = SessionPlayer::load(&path).unwrap();
        let control = PlaybackControl::new();
        let mut seen = Vec::new();
        let outcome = player
            .replay_into(&control, |input| {
                seen.push(input);
            })
            .await;

        assert_eq!(outcome, ReplayOutcome::Complete);
        assert_eq!(seen.len(), 2, "ActionEvent should not be replayed as an input");
    }

    #[tokio::test]
    async fn cancellation_stops_replay_immediately() {
        let path = write_session(&[
            r#"{"type":"AsrEvent","offsetMs":0,"event":{"text":"hello","isFinal":true,"receivedAt":"2024-01-01T00:00:00Z"}}"#,
            r#"{"type":"UtteranceEndSignal","offsetMs":60000}"#,
        ]);

        let player = SessionPlayer::load(&path).unwrap();
        let control = PlaybackControl::new();
        control.cancel();

        let mut seen = Vec::new();
        let outcome = player.replay_into(&control, |input| seen.push(input)).await;

        assert_eq!(outcome, ReplayOutcome::Cancelled);
    }
}
