//! Utterance segmentation: turns a stream of ASR events into a sequence of
//! `Open` / `Update` / `Final` lifecycle events for one utterance at a time.
//!
//! Owns a single optional [`UtteranceState`] and drives it through an
//! `Idle -> Active -> Idle` state machine. Close conditions are evaluated in
//! a fixed priority order so that the tie-breaks in the close-reason table
//! are reproducible regardless of which check happens to fire first.

use chrono::{DateTime, Duration, Utc};
use utterance_events::{AsrEvent, CloseReason, UtteranceEvent, UtteranceEventType};
use utterance_stabilizer::{Stabilizer, StabilizerConfig};

#[derive(Debug, Clone)]
pub struct UtteranceBuilderConfig {
    pub silence_gap_threshold: Duration,
    pub punctuation_pause_threshold: Duration,
    pub max_utterance_duration: Duration,
    pub max_utterance_length: usize,
    pub stabilizer: StabilizerConfig,
}

impl Default for UtteranceBuilderConfig {
    fn default() -> Self {
        Self {
            silence_gap_threshold: Duration::milliseconds(750),
            punctuation_pause_threshold: Duration::milliseconds(300),
            max_utterance_duration: Duration::seconds(12),
            max_utterance_length: 500,
            stabilizer: StabilizerConfig::default(),
        }
    }
}

struct ActiveUtterance {
    id: String,
    start_time: DateTime<Utc>,
    last_activity_time: DateTime<Utc>,
    committed_text: String,
    raw_text: String,
    terminal_punctuation_time: Option<DateTime<Utc>>,
    speaker_id: Option<String>,
    committed_asr_timestamps: Vec<DateTime<Utc>>,
    stabilizer: Stabilizer,
}

pub struct UtteranceBuilder {
    config: UtteranceBuilderConfig,
    state: Option<ActiveUtterance>,
    next_id: u32,
}

impl UtteranceBuilder {
    pub fn new(config: UtteranceBuilderConfig) -> Self {
        Self {
            config,
            state: None,
            next_id: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.id.as_str())
    }

    /// Process one ASR event, returning the lifecycle events it produced (in
    /// order). A brand-new utterance yields `Open` immediately followed by
    /// `Update` for the same event; a closing event yields `Final` only.
    pub fn process_asr_event(&mut self, event: &AsrEvent, now: DateTime<Utc>) -> Vec<UtteranceEvent> {
        let mut emitted = Vec::new();

        if event.is_empty() && !event.is_utterance_end {
            return emitted;
        }

        if self.state.is_none() {
            if event.is_empty() {
                // is_utterance_end with nothing active: nothing to close.
                return emitted;
            }
            self.open(now, event.speaker_id.clone());
            emitted.push(self.build_event(UtteranceEventType::Open, now));
        }

        self.apply_event(event, now);

        if event.is_utterance_end {
            emitted.push(self.close(CloseReason::DeepgramSignal, now));
            return emitted;
        }

        emitted.push(self.build_event(UtteranceEventType::Update, now));

        if let Some(reason) = self.next_close_reason(now) {
            emitted.push(self.close(reason, now));
        }

        emitted
    }

    /// External boundary signal (distinct from `AsrEvent::is_utterance_end`,
    /// e.g. a caller-driven hint that is not itself an ASR event).
    pub fn signal_utterance_end(&mut self, now: DateTime<Utc>) -> Option<UtteranceEvent> {
        self.state.is_some().then(|| self.close(CloseReason::DeepgramSignal, now))
    }

    pub fn force_close(&mut self, now: DateTime<Utc>) -> Option<UtteranceEvent> {
        self.state.is_some().then(|| self.close(CloseReason::Manual, now))
    }

    /// Periodic tick: evaluate the time-based close conditions even when no
    /// new ASR event has arrived.
    pub fn check_timeouts(&mut self, now: DateTime<Utc>) -> Option<UtteranceEvent> {
        if self.state.is_none() {
            return None;
        }
        self.next_close_reason(now).map(|reason| self.close(reason, now))
    }

    fn open(&mut self, now: DateTime<Utc>, speaker_id: Option<String>) {
        self.next_id += 1;
        tracing::debug!(id = self.next_id, "utterance: opening");
        self.state = Some(ActiveUtterance {
            id: format!("utt_{:04}", self.next_id),
            start_time: now,
            last_activity_time: now,
            committed_text: String::new(),
            raw_text: String::new(),
            terminal_punctuation_time: None,
            speaker_id,
            committed_asr_timestamps: Vec::new(),
            stabilizer: Stabilizer::new(self.config.stabilizer.clone()),
        });
    }

    fn apply_event(&mut self, event: &AsrEvent, now: DateTime<Utc>) {
        let state = self.state.as_mut().expect("active utterance");
        state.last_activity_time = now;
        if event.speaker_id.is_some() {
            state.speaker_id = event.speaker_id.clone();
        }

        if event.is_final {
            let segment = event.text.trim();
            if !segment.is_empty() {
                if state.committed_text.is_empty() {
                    state.committed_text = segment.to_string();
                } else {
                    state.committed_text = format!("{} {}", state.committed_text, segment);
                }
                state.committed_asr_timestamps.push(event.received_at);
            }
            state.raw_text = state.committed_text.clone();
            let stable = state.committed_text.clone();
            state.stabilizer.commit_final(&stable);
        } else {
            let hypothesis = event.text.trim();
            state.raw_text = if state.committed_text.is_empty() {
                hypothesis.to_string()
            } else {
                format!("{} {}", state.committed_text, hypothesis)
            };
            state
                .stabilizer
                .push_hypothesis(&state.raw_text.clone(), event.words.as_deref());
        }

        let trimmed = state.raw_text.trim_end();
        let ends_with_terminal = trimmed.ends_with(['.', '?', '!']);
        match (ends_with_terminal, state.terminal_punctuation_time) {
            (true, None) => state.terminal_punctuation_time = Some(now),
            (false, Some(_)) => state.terminal_punctuation_time = None,
            _ => {}
        }
    }

    fn next_close_reason(&self, now: DateTime<Utc>) -> Option<CloseReason> {
        let state = self.state.as_ref()?;

        if let Some(latched_at) = state.terminal_punctuation_time {
            if now - latched_at >= self.config.punctuation_pause_threshold {
                return Some(CloseReason::TerminalPunctuation);
            }
        }
        if now - state.last_activity_time >= self.config.silence_gap_threshold {
            return Some(CloseReason::SilenceGap);
        }
        if now - state.start_time >= self.config.max_utterance_duration {
            return Some(CloseReason::MaxDuration);
        }
        if state.raw_text.len() >= self.config.max_utterance_length {
            return Some(CloseReason::MaxLength);
        }
        None
    }

    fn build_event(&self, kind: UtteranceEventType, now: DateTime<Utc>) -> UtteranceEvent {
        let state = self.state.as_ref().expect("active utterance");
        UtteranceEvent {
            id: state.id.clone(),
            kind,
            start_time: state.start_time,
            timestamp: now,
            stable_text: state.stabilizer.stable_text().to_string(),
            raw_text: state.raw_text.clone(),
            duration_ms: (now - state.start_time).num_milliseconds().max(0) as u64,
            close_reason: None,
            speaker_id: state.speaker_id.clone(),
            committed_asr_timestamps: Vec::new(),
        }
    }

    fn close(&mut self, reason: CloseReason, now: DateTime<Utc>) -> UtteranceEvent {
        let mut event = self.build_event(UtteranceEventType::Final, now);
        event.close_reason = Some(reason);
        let state = self.state.as_ref().expect("active utterance");
        event.committed_asr_timestamps = state.committed_asr_timestamps.clone();
        if event.stable_text.is_empty() {
            event.stable_text = event.raw_text.clone();
        }
        tracing::debug!(id = %event.id, ?reason, "utterance: closing");
        self.state = None;
        event
    }
}
