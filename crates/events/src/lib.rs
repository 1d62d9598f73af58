//! Shared event and data contracts for the utterance-intent pipeline.
//!
//! These types flow between the `utterance-builder`, `utterance-detect`,
//! `utterance-action`, `utterance-pipeline` and `utterance-recorder` crates.
//! Using shared DTOs here prevents field-name drift between producers and
//! consumers, and gives the recorder a single tagged union to serialize.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single ASR-reported word with timing and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsrWord {
    pub word: String,
    pub start_s: f64,
    pub end_s: f64,
    pub confidence: f32,
    #[serde(default)]
    pub speaker: Option<String>,
}

/// Normalized ASR input event.
///
/// Sequences of `is_final = false` events are successive hypotheses for the
/// same in-flight segment; `is_final = true` commits text that can never be
/// retracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsrEvent {
    pub text: String,
    pub is_final: bool,
    #[serde(default)]
    pub speaker_id: Option<String>,
    #[serde(default)]
    pub words: Option<Vec<AsrWord>>,
    /// Provider-emitted boundary signal (e.g. Deepgram's `speech_final`).
    #[serde(default)]
    pub is_utterance_end: bool,
    pub received_at: DateTime<Utc>,
}

impl AsrEvent {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Why an utterance was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CloseReason {
    DeepgramSignal,
    TerminalPunctuation,
    SilenceGap,
    MaxDuration,
    MaxLength,
    Manual,
}

/// Utterance lifecycle phase carried by `UtteranceEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum UtteranceEventType {
    Open,
    Update,
    Final,
}

/// Emitted on every utterance lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtteranceEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: UtteranceEventType,
    pub start_time: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub stable_text: String,
    pub raw_text: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
    #[serde(default)]
    pub speaker_id: Option<String>,
    #[serde(default)]
    pub committed_asr_timestamps: Vec<DateTime<Utc>>,
}

/// Top-level classification of an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum IntentType {
    Question,
    Imperative,
    Statement,
    Other,
}

/// Fine-grained classification, meaningful only alongside a matching
/// `IntentType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum IntentSubtype {
    // Question subtypes
    Definition,
    HowTo,
    Compare,
    Troubleshoot,
    // Imperative subtypes
    Stop,
    Repeat,
    Continue,
    StartOver,
    Generate,
}

/// Slots extracted alongside a classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentSlots {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub reference: Option<String>,
}

/// A single classification produced by a detection strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedIntent {
    #[serde(rename = "type")]
    pub kind: IntentType,
    #[serde(default)]
    pub subtype: Option<IntentSubtype>,
    pub confidence: f32,
    #[serde(default)]
    pub slots: IntentSlots,
    /// The text the detector actually classified (may be an LLM-resolved,
    /// self-contained reformulation).
    pub source_text: String,
    /// Verbatim excerpt from the transcript, when it differs from
    /// `source_text`.
    #[serde(default)]
    pub original_text: Option<String>,
    #[serde(default)]
    pub utterance_id: Option<String>,
}

/// Wraps a `DetectedIntent` with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentEvent {
    pub utterance_id: String,
    pub is_candidate: bool,
    pub intent: DetectedIntent,
    pub timestamp: DateTime<Utc>,
    /// Absolute char offsets into the recorder's running transcript,
    /// annotated at recording time. When the matching time window is
    /// found but the source text can't be located verbatim inside it
    /// (e.g. an LLM-resolved, paraphrased `source_text`), these fall back
    /// to the bounds of the whole window. `None` only when no ASR text
    /// fell within the tolerance window at all.
    #[serde(default)]
    pub transcript_char_start: Option<usize>,
    #[serde(default)]
    pub transcript_char_end: Option<usize>,
}

/// How a later classification relates to an earlier one for the same
/// utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CorrectionKind {
    Confirmed,
    TypeChanged,
    Added,
    Removed,
}

/// Emitted when a slower strategy (LLM) revises an earlier one
/// (heuristic) for the same utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentCorrectionEvent {
    pub utterance_id: String,
    pub kind: CorrectionKind,
    #[serde(default)]
    pub previous: Option<DetectedIntent>,
    pub current: DetectedIntent,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when the action router fires, or suppresses, an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    pub action_name: String,
    pub intent: DetectedIntent,
    pub utterance_id: String,
    pub timestamp: DateTime<Utc>,
    pub was_debounced: bool,
}

/// Recording-time configuration snapshot, stored in `SessionMetadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub detection_mode: Option<String>,
    #[serde(default)]
    pub asr_model: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub diarize: bool,
    #[serde(default)]
    pub audio_source: Option<String>,
}

/// The recording file format: one tagged record per line, ordered by
/// non-decreasing `offset_ms`. `SessionMetadata` is always first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RecordedEvent {
    SessionMetadata {
        #[serde(rename = "offsetMs")]
        offset_ms: u64,
        version: u32,
        #[serde(rename = "recordedAtUtc")]
        recorded_at_utc: DateTime<Utc>,
        config: SessionConfig,
    },
    AsrEvent {
        #[serde(rename = "offsetMs")]
        offset_ms: u64,
        event: AsrEvent,
    },
    UtteranceEndSignal {
        #[serde(rename = "offsetMs")]
        offset_ms: u64,
    },
    UtteranceEvent {
        #[serde(rename = "offsetMs")]
        offset_ms: u64,
        event: UtteranceEvent,
    },
    IntentEvent {
        #[serde(rename = "offsetMs")]
        offset_ms: u64,
        event: IntentEvent,
    },
    IntentCorrectionEvent {
        #[serde(rename = "offsetMs")]
        offset_ms: u64,
        event: IntentCorrectionEvent,
    },
    ActionEvent {
        #[serde(rename = "offsetMs")]
        offset_ms: u64,
        event: ActionEvent,
    },
}

impl RecordedEvent {
    pub fn offset_ms(&self) -> u64 {
        match self {
            RecordedEvent::SessionMetadata { offset_ms, .. }
            | RecordedEvent::AsrEvent { offset_ms, .. }
            | RecordedEvent::UtteranceEndSignal { offset_ms }
            | RecordedEvent::UtteranceEvent { offset_ms, .. }
            | RecordedEvent::IntentEvent { offset_ms, .. }
            | RecordedEvent::IntentCorrectionEvent { offset_ms, .. }
            | RecordedEvent::ActionEvent { offset_ms, .. } => *offset_ms,
        }
    }

    /// Whether this record should be fed back into a pipeline during replay.
    /// Output records (utterance/intent/action) are regenerated, not replayed.
    pub fn is_replayable_input(&self) -> bool {
        matches!(
            self,
            RecordedEvent::AsrEvent { .. } | RecordedEvent::UtteranceEndSignal { .. }
        )
    }
}

/// Event topic names, to prevent typos at subscription call sites.
pub mod event_names {
    pub const ASR_PARTIAL: &str = "asr_partial";
    pub const ASR_FINAL: &str = "asr_final";
    pub const UTTERANCE_OPEN: &str = "utterance_open";
    pub const UTTERANCE_UPDATE: &str = "utterance_update";
    pub const UTTERANCE_FINAL: &str = "utterance_final";
    pub const INTENT_CANDIDATE: &str = "intent_candidate";
    pub const INTENT_FINAL: &str = "intent_final";
    pub const INTENT_CORRECTED: &str = "intent_corrected";
    pub const ACTION_TRIGGERED: &str = "action_triggered";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asr_event_round_trips() {
        let json = r#"{"text":"hello world","isFinal":true,"receivedAt":"2024-01-01T00:00:00Z"}"#;
        let event: AsrEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.text, "hello world");
        assert!(event.is_final);
        assert_eq!(event.words, None);
    }

    #[test]
    fn asr_event_serializes_fields_as_camel_case() {
        let event = asr_event_fixture();
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("isFinal").is_some());
        assert!(value.get("receivedAt").is_some());
        assert!(value.get("is_final").is_none());
    }

    fn asr_event_fixture() -> AsrEvent {
        AsrEvent {
            text: "hello world".into(),
            is_final: true,
            speaker_id: None,
            words: None,
            is_utterance_end: false,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn recorded_event_discriminates_on_type() {
        let json = r#"{"type":"UtteranceEndSignal","offsetMs":42}"#;
        let event: RecordedEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.offset_ms(), 42);
        assert!(event.is_replayable_input());
    }

    #[test]
    fn output_events_are_not_replayable_inputs() {
        let action = RecordedEvent::ActionEvent {
            offset_ms: 10,
            event: ActionEvent {
                action_name: "Stop".into(),
                intent: DetectedIntent {
                    kind: IntentType::Imperative,
                    subtype: Some(IntentSubtype::Stop),
                    confidence: 0.95,
                    slots: IntentSlots::default(),
                    source_text: "stop".into(),
                    original_text: None,
                    utterance_id: Some("utt_0001".into()),
                },
                utterance_id: "utt_0001".into(),
                timestamp: Utc::now(),
                was_debounced: false,
            },
        };
        assert!(!action.is_replayable_input());
    }
}
