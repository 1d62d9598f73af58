//! Appends a tagged, newline-delimited record per pipeline event, and
//! annotates final intents with their position in the running transcript.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use utterance_events::{
    ActionEvent, AsrEvent, IntentCorrectionEvent, IntentEvent, RecordedEvent, SessionConfig,
    UtteranceEvent,
};

use crate::error::{RecorderError, RecorderResult};

const FORMAT_VERSION: u32 = 1;

struct AsrSegment {
    start: DateTime<Utc>,
    char_start: usize,
    char_end: usize,
}

struct TranscriptIndex {
    text: String,
    segments: Vec<AsrSegment>,
}

impl TranscriptIndex {
    fn new() -> Self {
        Self {
            text: String::new(),
            segments: Vec::new(),
        }
    }

    fn append_final(&mut self, at: DateTime<Utc>, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        let char_start = self.text.chars().count();
        self.text.push_str(text);
        let char_end = self.text.chars().count();
        self.segments.push(AsrSegment {
            start: at,
            char_start,
            char_end,
        });
    }

    /// Locates `needle` within the transcript region covered by segments
    /// whose start falls inside `[utterance_start - tolerance, utterance_start + tolerance]`.
    /// `None` only when no segment falls within that window at all; when the
    /// window is found but `needle` can't be matched verbatim inside it
    /// (e.g. an LLM-resolved, paraphrased source text), falls back to the
    /// bounds of the whole window.
    fn locate(
        &self,
        utterance_start: DateTime<Utc>,
        tolerance: Duration,
        needle: &str,
    ) -> Option<(usize, usize)> {
        if needle.is_empty() {
            return None;
        }
        let window: Vec<&AsrSegment> = self
            .segments
            .iter()
            .filter(|s| (s.start - utterance_start).abs() <= tolerance)
            .collect();
        if window.is_empty() {
            return None;
        }
        let region_start = window.iter().map(|s| s.char_start).min()?;
        let region_end = window.iter().map(|s| s.char_end).max()?;

        let chars: Vec<char> = self.text.chars().collect();
        let region: String = chars[region_start..region_end].iter().collect();
        let lower_region = region.to_lowercase();
        let lower_needle = needle.to_lowercase();
        let found = lower_region.find(&lower_needle).map(|byte_pos| {
            let char_offset = lower_region[..byte_pos].chars().count();
            let match_len = lower_needle.chars().count();
            (region_start + char_offset, region_start + char_offset + match_len)
        });
        Some(found.unwrap_or((region_start, region_end)))
    }
}

/// Subscribes to the pipeline's event streams and persists them as an
/// append-only, crash-safe log.
pub struct SessionRecorder {
    writer: Mutex<BufWriter<File>>,
    session_start: DateTime<Utc>,
    transcript: Mutex<TranscriptIndex>,
    correlation_tolerance: Duration,
}

impl SessionRecorder {
    pub fn create(
        path: impl AsRef<Path>,
        session_start: DateTime<Utc>,
        config: SessionConfig,
        correlation_tolerance_ms: u64,
    ) -> RecorderResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let recorder = Self {
            writer: Mutex::new(BufWriter::new(file)),
            session_start,
            transcript: Mutex::new(TranscriptIndex::new()),
            correlation_tolerance: Duration::milliseconds(correlation_tolerance_ms as i64),
        };
        recorder.append(RecordedEvent::SessionMetadata {
            offset_ms: 0,
            version: FORMAT_VERSION,
            recorded_at_utc: session_start,
            config,
        })?;
        Ok(recorder)
    }

    fn offset_ms(&self, at: DateTime<Utc>) -> u64 {
        (at - self.session_start).num_milliseconds().max(0) as u64
    }

    pub fn record_asr_event(&self, event: AsrEvent) -> RecorderResult<()> {
        let at = event.received_at;
        if event.is_final && !event.is_empty() {
            self.transcript
                .lock()
                .expect("transcript mutex poisoned")
                .append_final(at, event.text.trim());
        }
        self.append(RecordedEvent::AsrEvent {
            offset_ms: self.offset_ms(at),
            event,
        })
    }

    pub fn record_utterance_end_signal(&self, at: DateTime<Utc>) -> RecorderResult<()> {
        self.append(RecordedEvent::UtteranceEndSignal {
            offset_ms: self.offset_ms(at),
        })
    }

    pub fn record_utterance_event(&self, event: UtteranceEvent) -> RecorderResult<()> {
        let offset_ms = self.offset_ms(event.timestamp);
        self.append(RecordedEvent::UtteranceEvent { offset_ms, event })
    }

    /// Records an intent event, annotating final (non-candidate) intents
    /// with their position in the running transcript when it can be
    /// located within the correlation tolerance.
    pub fn record_intent_event(
        &self,
        mut event: IntentEvent,
        utterance_start: DateTime<Utc>,
    ) -> RecorderResult<()> {
        if !event.is_candidate {
            let transcript = self.transcript.lock().expect("transcript mutex poisoned");
            let located = transcript
                .locate(utterance_start, self.correlation_tolerance, &event.intent.source_text)
                .or_else(|| {
                    event
                        .intent
                        .original_text
                        .as_deref()
                        .and_then(|original| transcript.locate(utterance_start, self.correlation_tolerance, original))
                });
            if let Some((start, end)) = located {
                event.transcript_char_start = Some(start);
                event.transcript_char_end = Some(end);
            }
        }
        let offset_ms = self.offset_ms(event.timestamp);
        self.append(RecordedEvent::IntentEvent { offset_ms, event })
    }

    pub fn record_intent_correction_event(&self, event: IntentCorrectionEvent) -> RecorderResult<()> {
        let offset_ms = self.offset_ms(event.timestamp);
        self.append(RecordedEvent::IntentCorrectionEvent { offset_ms, event })
    }

    pub fn record_action_event(&self, event: ActionEvent) -> RecorderResult<()> {
        let offset_ms = self.offset_ms(event.timestamp);
        self.append(RecordedEvent::ActionEvent { offset_ms, event })
    }

    fn append(&self, record: RecordedEvent) -> RecorderResult<()> {
        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock().expect("writer mutex poisoned");
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush().map_err(RecorderError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utterance_events::{AsrWord, DetectedIntent, IntentSlots, IntentType};

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    fn asr_final(text: &str, at: DateTime<Utc>) -> AsrEvent {
        AsrEvent {
            text: text.to_string(),
            is_final: true,
            speaker_id: None,
            words: None::<Vec<AsrWord>>,
            is_utterance_end: false,
            received_at: at,
        }
    }

    fn intent(source_text: &str) -> DetectedIntent {
        DetectedIntent {
            kind: IntentType::Question,
            subtype: None,
            confidence: 0.8,
            slots: IntentSlots::default(),
            source_text: source_text.to_string(),
            original_text: None,
            utterance_id: Some("utt_0001".to_string()),
        }
    }

    #[test]
    fn metadata_is_always_the_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        SessionRecorder::create(&path, ts(0), SessionConfig::default(), 2000).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let first_line = contents.lines().next().unwrap();
        assert!(first_line.contains("\"SessionMetadata\""));
    }

    #[test]
    fn offsets_are_computed_relative_to_session_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let recorder = SessionRecorder::create(&path, ts(0), SessionConfig::default(), 2000).unwrap();

        recorder.record_asr_event(asr_final("hello world", ts(500))).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let second_line = contents.lines().nth(1).unwrap();
        let parsed: RecordedEvent = serde_json::from_str(second_line).unwrap();
        assert_eq!(parsed.offset_ms(), 500);
    }

    #[test]
    fn intent_gets_annotated_with_transcript_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let recorder = SessionRecorder::create(&path, ts(0), SessionConfig::default(), 2000).unwrap();

        recorder
            .record_asr_event(asr_final("what is a lock statement", ts(1000)))
            .unwrap();

        let intent_event = IntentEvent {
            utterance_id: "utt_0001".to_string(),
            is_candidate: false,
            intent: intent("lock statement"),
            timestamp: ts(1200),
            transcript_char_start: None,
            transcript_char_end: None,
        };
        recorder.record_intent_event(intent_event, ts(1000)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let last_line = contents.lines().last().unwrap();
        let parsed: RecordedEvent = serde_json::from_str(last_line).unwrap();
        if let RecordedEvent::IntentEvent { event, .. } = parsed {
            assert_eq!(event.transcript_char_start, Some(10));
            assert_eq!(event.transcript_char_end, Some(24));
        } else {
            panic!("expected IntentEvent");
        }
    }

    #[test]
    fn unmatched_text_falls_back_to_the_whole_window_when_one_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let recorder = SessionRecorder::create(&path, ts(0), SessionConfig::default(), 2000).unwrap();

        recorder
            .record_asr_event(asr_final("what is a lock statement", ts(1000)))
            .unwrap();

        // An LLM-resolved source_text that paraphrases the transcript and
        // never appears verbatim in it.
        let intent_event = IntentEvent {
            utterance_id: "utt_0001".to_string(),
            is_candidate: false,
            intent: intent("explain mutual exclusion locks"),
            timestamp: ts(1200),
            transcript_char_start: None,
            transcript_char_end: None,
        };
        recorder.record_intent_event(intent_event, ts(1000)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let last_line = contents.lines().last().unwrap();
        let parsed: RecordedEvent = serde_json::from_str(last_line).unwrap();
        if let RecordedEvent::IntentEvent { event, .. } = parsed {
            assert_eq!(event.transcript_char_start, Some(0));
            assert_eq!(event.transcript_char_end, Some("what is a lock statement".len()));
        } else {
            panic!("expected IntentEvent");
        }
    }

    #[test]
    fn annotation_is_skipped_outside_the_tolerance_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let recorder = SessionRecorder::create(&path, ts(0), SessionConfig::default(), 500).unwrap();

        recorder
            .record_asr_event(asr_final("what is a lock statement", ts(0)))
            .unwrap();

        let intent_event = IntentEvent {
            utterance_id: "utt_0001".to_string(),
            is_candidate: false,
            intent: intent("lock statement"),
            timestamp: ts(5000),
            transcript_char_start: None,
            transcript_char_end: None,
        };
        recorder.record_intent_event(intent_event, ts(5000)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let last_line = contents.lines().last().unwrap();
        let parsed: RecordedEvent = serde_json::from_str(last_line).unwrap();
        if let RecordedEvent::IntentEvent { event, .. } = parsed {
            assert_eq!(event.transcript_char_start, None);
        } else {
            panic!("expected IntentEvent");
        }
    }
}
