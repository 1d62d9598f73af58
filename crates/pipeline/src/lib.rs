//! Orchestrates the stabilizer, utterance builder, intent detector, and
//! action router into the nine event streams external subscribers attach
//! to: `asr_{partial,final}`, `utterance_{open,update,final}`,
//! `intent_{candidate,final,corrected}`, and `action_triggered`.
//!
//! An event entering [`Pipeline::process_asr_event`] flows through the
//! builder synchronously before any publication happens, so component
//! state is never touched concurrently — the only concurrency is in the
//! LLM detector strategies (guarded by an async mutex, since a call can
//! be in flight when a new utterance closes) and the action router
//! (guarded internally, since it can be fed from both the synchronous
//! heuristic path and the asynchronous LLM path).

pub mod config;
pub mod error;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant as StdInstant;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use utterance_action::{ActionHandler, ActionRouter, ActionRouterConfig};
use utterance_builder::{UtteranceBuilder, UtteranceBuilderConfig};
use utterance_bus::EventChannel;
use utterance_detect::{
    DetectionMode, HeuristicDetector, LlmDetector, LlmDetectorConfig, LlmIntentBackend,
    ParallelStrategy,
};
use utterance_events::{
    ActionEvent, AsrEvent, DetectedIntent, IntentCorrectionEvent, IntentEvent, IntentSubtype,
    UtteranceEvent, UtteranceEventType,
};
use utterance_recorder::SessionRecorder;
use utterance_stabilizer::StabilizerConfig;

/// Recording I/O failures never interrupt the pipeline; they are logged so
/// an operator knows the session file stopped receiving new lines.
fn log_record_result<E: std::fmt::Display>(result: std::result::Result<(), E>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to append to recording, pipeline continues");
    }
}

enum DetectorStrategy<B: LlmIntentBackend> {
    Heuristic(HeuristicDetector),
    Llm(AsyncMutex<LlmDetector<B>>),
    Parallel(AsyncMutex<ParallelStrategy<B>>),
    /// No provider-native intent signal exists on `AsrEvent` today, so this
    /// mode falls back to the heuristic detector rather than silently
    /// producing nothing.
    DeepgramIntent(HeuristicDetector),
}

/// The nine named event streams a subscriber (the recorder, a UI, a test
/// harness) can attach to. Each is an unbounded single-reader fanout, so a
/// slow subscriber never stalls the pipeline.
pub struct PipelineStreams {
    pub asr_partial: Arc<EventChannel<AsrEvent>>,
    pub asr_final: Arc<EventChannel<AsrEvent>>,
    pub utterance_open: Arc<EventChannel<UtteranceEvent>>,
    pub utterance_update: Arc<EventChannel<UtteranceEvent>>,
    pub utterance_final: Arc<EventChannel<UtteranceEvent>>,
    pub intent_candidate: Arc<EventChannel<IntentEvent>>,
    pub intent_final: Arc<EventChannel<IntentEvent>>,
    pub intent_corrected: Arc<EventChannel<IntentCorrectionEvent>>,
    pub action_triggered: Arc<EventChannel<ActionEvent>>,
}

impl Default for PipelineStreams {
    fn default() -> Self {
        Self {
            asr_partial: Arc::new(EventChannel::new()),
            asr_final: Arc::new(EventChannel::new()),
            utterance_open: Arc::new(EventChannel::new()),
            utterance_update: Arc::new(EventChannel::new()),
            utterance_final: Arc::new(EventChannel::new()),
            intent_candidate: Arc::new(EventChannel::new()),
            intent_final: Arc::new(EventChannel::new()),
            intent_corrected: Arc::new(EventChannel::new()),
            action_triggered: Arc::new(EventChannel::new()),
        }
    }
}

/// Owns and wires the four core components. `B` is the LLM backend type;
/// it is unused when `detection_mode` is `Heuristic` or `DeepgramIntent`,
/// but the pipeline stays generic over it so callers can supply a
/// `StubLlmBackend` in tests and an `HttpLlmBackend` in production without
/// two different orchestrator types.
pub struct Pipeline<B: LlmIntentBackend> {
    builder: StdMutex<UtteranceBuilder>,
    detector: DetectorStrategy<B>,
    router: Arc<ActionRouter>,
    cancel: CancellationToken,
    pub streams: PipelineStreams,
    /// Set via [`Pipeline::attach_recorder`]. Every recording call happens
    /// on the same synchronous path as the matching stream publication, so
    /// the session file's record order always matches non-decreasing
    /// `offset_ms` — fanning recording out to independent per-stream
    /// subscriber tasks instead would let the OS scheduler interleave
    /// writes out of logical order.
    recorder: StdMutex<Option<Arc<SessionRecorder>>>,
    utterance_starts: StdMutex<HashMap<String, DateTime<Utc>>>,
}

impl<B: LlmIntentBackend> Pipeline<B> {
    pub fn new(config: &PipelineConfig, backend: B) -> Self {
        let builder_config = UtteranceBuilderConfig {
            silence_gap_threshold: Duration::milliseconds(config.utterance.silence_gap_threshold_ms as i64),
            punctuation_pause_threshold: Duration::milliseconds(
                config.utterance.punctuation_pause_threshold_ms as i64,
            ),
            max_utterance_duration: Duration::milliseconds(config.utterance.max_utterance_duration_ms as i64),
            max_utterance_length: config.utterance.max_utterance_length,
            stabilizer: StabilizerConfig {
                window_size: config.stabilizer.stabilizer_window_size,
                min_confidence: config.stabilizer.min_word_confidence,
                require_repetition_for_low_confidence: config.stabilizer.require_repetition_for_low_confidence,
            },
        };

        let llm_config = LlmDetectorConfig {
            confidence_threshold: config.llm.confidence_threshold,
            rate_limit_ms: config.llm.rate_limit_ms,
            buffer_max_chars: config.llm.buffer_max_chars,
            trigger_on_question_mark: config.llm.trigger_on_question_mark,
            trigger_on_pause: config.llm.trigger_on_pause,
            trigger_timeout_ms: config.llm.trigger_timeout_ms,
            deduplication_window_ms: config.llm.deduplication_window_ms,
            context_window_chars: config.llm.context_window_chars,
            enable_preprocessing: config.llm.enable_preprocessing,
        };

        let detector = match config.detection_mode {
            DetectionMode::Heuristic => DetectorStrategy::Heuristic(HeuristicDetector::new()),
            DetectionMode::DeepgramIntent => DetectorStrategy::DeepgramIntent(HeuristicDetector::new()),
            DetectionMode::Llm => {
                DetectorStrategy::Llm(AsyncMutex::new(LlmDetector::new(llm_config, backend)))
            }
            DetectionMode::Parallel => DetectorStrategy::Parallel(AsyncMutex::new(ParallelStrategy::new(
                HeuristicDetector::new(),
                LlmDetector::new(llm_config, backend),
            ))),
        };

        let router_config = ActionRouterConfig {
            conflict_window: Duration::milliseconds(config.action.conflict_window_ms as i64),
            cooldowns: config.action.cooldowns(),
        };

        Self {
            builder: StdMutex::new(UtteranceBuilder::new(builder_config)),
            detector,
            router: Arc::new(ActionRouter::new(router_config)),
            cancel: CancellationToken::new(),
            streams: PipelineStreams::default(),
            recorder: StdMutex::new(None),
            utterance_starts: StdMutex::new(HashMap::new()),
        }
    }

    pub fn register_action_handler(&self, subtype: IntentSubtype, handler: ActionHandler) {
        self.router.register_action_handler(subtype, handler);
    }

    /// Starts persisting every subsequent event to `recorder`. Takes effect
    /// immediately; events published before this call are not retroactively
    /// recorded.
    pub fn attach_recorder(&self, recorder: Arc<SessionRecorder>) {
        *self.recorder.lock().expect("recorder mutex poisoned") = Some(recorder);
    }

    fn with_recorder(&self, f: impl FnOnce(&SessionRecorder)) {
        if let Some(rec) = self.recorder.lock().expect("recorder mutex poisoned").as_ref() {
            f(rec);
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels any in-flight LLM calls and player delays rooted at this
    /// pipeline's token.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Process one ASR event. Ignores empty text that isn't also an
    /// end-of-utterance signal, per the external contract.
    pub async fn process_asr_event(&self, event: AsrEvent, now: DateTime<Utc>) {
        if event.is_empty() && !event.is_utterance_end {
            return;
        }
        if event.is_final {
            self.streams.asr_final.publish(event.clone());
        } else {
            self.streams.asr_partial.publish(event.clone());
        }
        self.with_recorder(|rec| log_record_result(rec.record_asr_event(event.clone())));

        let emitted = {
            let mut builder = self.builder.lock().expect("builder mutex poisoned");
            builder.process_asr_event(&event, now)
        };
        self.handle_utterance_events(emitted, now).await;
    }

    pub async fn signal_utterance_end(&self, now: DateTime<Utc>) {
        self.with_recorder(|rec| log_record_result(rec.record_utterance_end_signal(now)));
        let emitted = {
            let mut builder = self.builder.lock().expect("builder mutex poisoned");
            builder.signal_utterance_end(now)
        };
        self.handle_utterance_events(emitted.into_iter().collect(), now).await;
    }

    pub async fn force_close(&self, now: DateTime<Utc>) {
        let emitted = {
            let mut builder = self.builder.lock().expect("builder mutex poisoned");
            builder.force_close(now)
        };
        self.handle_utterance_events(emitted.into_iter().collect(), now).await;
    }

    /// Periodic tick (≤100 ms, per the scheduling model): evaluates the
    /// builder's time-based close conditions even with no new ASR event.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) {
        let emitted = {
            let mut builder = self.builder.lock().expect("builder mutex poisoned");
            builder.check_timeouts(now)
        };
        self.handle_utterance_events(emitted.into_iter().collect(), now).await;
    }

    /// Periodic tick: fires the router's pending conflict-window action,
    /// if its window has elapsed.
    pub fn check_conflict_window(&self, now: DateTime<Utc>) {
        if let Some(action) = self.router.check_conflict_window(now) {
            self.streams.action_triggered.publish(action.clone());
            self.with_recorder(|rec| log_record_result(rec.record_action_event(action)));
        }
    }

    /// Periodic tick: evaluates the LLM detector's pause and inactivity
    /// triggers, which are not tied to any specific utterance event.
    pub async fn check_llm_triggers(&self, now: DateTime<Utc>, instant_now: StdInstant) {
        match &self.detector {
            DetectorStrategy::Llm(llm) => {
                let ready = {
                    let guard = llm.lock().await;
                    guard.pause_trigger_ready() || guard.inactivity_trigger_fired(instant_now)
                };
                if ready {
                    let outcomes = {
                        let mut guard = llm.lock().await;
                        guard.classify(true, self.cancel.clone()).await
                    };
                    self.publish_llm_outcomes(outcomes, now);
                }
            }
            DetectorStrategy::Parallel(parallel) => {
                let ready = {
                    let guard = parallel.lock().await;
                    guard.llm_pause_trigger_ready() || guard.llm_inactivity_trigger_fired(instant_now)
                };
                if ready {
                    let corrections = {
                        let mut guard = parallel.lock().await;
                        guard.reconcile(true, self.cancel.clone()).await
                    };
                    self.publish_corrections(corrections, now);
                }
            }
            DetectorStrategy::Heuristic(_) | DetectorStrategy::DeepgramIntent(_) => {}
        }
    }

    async fn handle_utterance_events(&self, events: Vec<UtteranceEvent>, now: DateTime<Utc>) {
        for event in events {
            self.with_recorder(|rec| log_record_result(rec.record_utterance_event(event.clone())));
            match event.kind {
                UtteranceEventType::Open => {
                    self.utterance_starts
                        .lock()
                        .expect("utterance starts mutex poisoned")
                        .insert(event.id.clone(), event.start_time);
                    self.streams.utterance_open.publish(event);
                }
                UtteranceEventType::Update => {
                    self.streams.utterance_update.publish(event.clone());
                    self.publish_candidate(&event);
                }
                UtteranceEventType::Final => {
                    self.streams.utterance_final.publish(event.clone());
                    self.publish_final(&event, now).await;
                    self.utterance_starts
                        .lock()
                        .expect("utterance starts mutex poisoned")
                        .remove(&event.id);
                }
            }
        }
    }

    fn utterance_start(&self, utterance_id: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.utterance_starts
            .lock()
            .expect("utterance starts mutex poisoned")
            .get(utterance_id)
            .copied()
            .unwrap_or(fallback)
    }

    fn display_text(event: &UtteranceEvent) -> &str {
        if event.stable_text.is_empty() {
            &event.raw_text
        } else {
            &event.stable_text
        }
    }

    fn publish_candidate(&self, event: &UtteranceEvent) {
        let text = Self::display_text(event);
        if text.trim().is_empty() {
            return;
        }
        let heuristic = match &self.detector {
            DetectorStrategy::Heuristic(h) | DetectorStrategy::DeepgramIntent(h) => Some(h),
            DetectorStrategy::Llm(_) | DetectorStrategy::Parallel(_) => None,
        };
        let Some(heuristic) = heuristic else {
            return;
        };
        if let Some(mut intent) = heuristic.detect_candidate(text) {
            intent.utterance_id = Some(event.id.clone());
            let candidate = IntentEvent {
                utterance_id: event.id.clone(),
                is_candidate: true,
                intent,
                timestamp: event.timestamp,
                transcript_char_start: None,
                transcript_char_end: None,
            };
            self.streams.intent_candidate.publish(candidate.clone());
            let start = self.utterance_start(&event.id, event.timestamp);
            self.with_recorder(|rec| log_record_result(rec.record_intent_event(candidate.clone(), start)));
        }
    }

    async fn publish_final(&self, event: &UtteranceEvent, now: DateTime<Utc>) {
        let text = Self::display_text(event).to_string();
        if text.trim().is_empty() {
            return;
        }

        match &self.detector {
            DetectorStrategy::Heuristic(h) | DetectorStrategy::DeepgramIntent(h) => {
                let mut intent = h.detect_final(&text);
                intent.utterance_id = Some(event.id.clone());
                let final_event = IntentEvent {
                    utterance_id: event.id.clone(),
                    is_candidate: false,
                    intent: intent.clone(),
                    timestamp: now,
                    transcript_char_start: None,
                    transcript_char_end: None,
                };
                self.streams.intent_final.publish(final_event.clone());
                let start = self.utterance_start(&event.id, event.start_time);
                self.with_recorder(|rec| log_record_result(rec.record_intent_event(final_event.clone(), start)));
                self.route_and_publish(intent, now);
            }
            DetectorStrategy::Llm(llm) => {
                let force = {
                    let mut guard = llm.lock().await;
                    guard.enqueue(&event.id, &text)
                };
                if force {
                    let outcomes = {
                        let mut guard = llm.lock().await;
                        guard.classify(true, self.cancel.clone()).await
                    };
                    self.publish_llm_outcomes(outcomes, now);
                }
            }
            DetectorStrategy::Parallel(parallel) => {
                let (heuristic_event, force) = {
                    let mut guard = parallel.lock().await;
                    let heuristic_event = guard.classify_now(&event.id, &text);
                    let force = guard.enqueue_llm(&event.id, &text);
                    (heuristic_event, force)
                };
                self.streams.intent_final.publish(heuristic_event.clone());
                let start = self.utterance_start(&event.id, event.start_time);
                self.with_recorder(|rec| log_record_result(rec.record_intent_event(heuristic_event.clone(), start)));
                self.route_and_publish(heuristic_event.intent, now);

                if force {
                    let corrections = {
                        let mut guard = parallel.lock().await;
                        guard.reconcile(true, self.cancel.clone()).await
                    };
                    self.publish_corrections(corrections, now);
                }
            }
        }
    }

    fn publish_llm_outcomes(&self, outcomes: Vec<IntentEvent>, now: DateTime<Utc>) {
        for outcome in outcomes {
            self.streams.intent_final.publish(outcome.clone());
            let start = self.utterance_start(&outcome.utterance_id, outcome.timestamp);
            self.with_recorder(|rec| log_record_result(rec.record_intent_event(outcome.clone(), start)));
            self.route_and_publish(outcome.intent, now);
        }
    }

    fn publish_corrections(&self, corrections: Vec<IntentCorrectionEvent>, now: DateTime<Utc>) {
        for correction in corrections {
            self.streams.intent_corrected.publish(correction.clone());
            self.with_recorder(|rec| log_record_result(rec.record_intent_correction_event(correction.clone())));
            self.route_and_publish(correction.current, now);
        }
    }

    fn route_and_publish(&self, intent: DetectedIntent, now: DateTime<Utc>) {
        if let Some(action) = self.router.process_final_intent(intent, now) {
            self.streams.action_triggered.publish(action.clone());
            self.with_recorder(|rec| log_record_result(rec.record_action_event(action)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utterance_detect::StubLlmBackend;
    use utterance_events::AsrWord;

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    fn asr(text: &str, is_final: bool, at: DateTime<Utc>) -> AsrEvent {
        AsrEvent {
            text: text.to_string(),
            is_final,
            speaker_id: None,
            words: None::<Vec<AsrWord>>,
            is_utterance_end: false,
            received_at: at,
        }
    }

    fn heuristic_pipeline() -> Pipeline<StubLlmBackend> {
        Pipeline::new(&PipelineConfig::default(), StubLlmBackend::new(Vec::new()))
    }

    #[tokio::test]
    async fn heuristic_mode_emits_open_update_final_and_intent() {
        let pipeline = heuristic_pipeline();
        let mut utterance_final = pipeline.streams.utterance_final.subscribe();
        let mut intent_final = pipeline.streams.intent_final.subscribe();

        pipeline.process_asr_event(asr("stop", true, ts(0)), ts(0)).await;
        pipeline.signal_utterance_end(ts(0)).await;

        let final_event = utterance_final.recv().await.unwrap();
        assert_eq!(final_event.kind, UtteranceEventType::Final);

        let intent_event = intent_final.recv().await.unwrap();
        assert_eq!(intent_event.intent.subtype, Some(IntentSubtype::Stop));
    }

    #[tokio::test]
    async fn final_imperative_intent_reaches_the_router_and_fires_after_conflict_window() {
        let pipeline = heuristic_pipeline();
        let mut action_triggered = pipeline.streams.action_triggered.subscribe();

        pipeline.process_asr_event(asr("stop", true, ts(0)), ts(0)).await;
        pipeline.signal_utterance_end(ts(0)).await;

        assert!(action_triggered.try_recv().is_err(), "stop should queue, not fire immediately");

        pipeline.check_conflict_window(ts(2000));
        let action = action_triggered.recv().await.unwrap();
        assert_eq!(action.action_name, "stop");
    }

    #[tokio::test]
    async fn attached_recorder_sees_strictly_ordered_offsets() {
        use utterance_events::SessionConfig;
        use utterance_recorder::SessionRecorder;

        let pipeline = heuristic_pipeline();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let recorder = Arc::new(
            SessionRecorder::create(&path, ts(0), SessionConfig::default(), 2000).unwrap(),
        );
        pipeline.attach_recorder(recorder);

        pipeline.process_asr_event(asr("stop", true, ts(0)), ts(0)).await;
        pipeline.signal_utterance_end(ts(0)).await;
        pipeline.check_conflict_window(ts(2000));

        let contents = std::fs::read_to_string(&path).unwrap();
        let offsets: Vec<u64> = contents
            .lines()
            .map(|line| {
                let record: utterance_events::RecordedEvent = serde_json::from_str(line).unwrap();
                record.offset_ms()
            })
            .collect();
        assert!(offsets.len() >= 4, "expected metadata, asr, utterance, and intent records");
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]), "offsets must be non-decreasing: {offsets:?}");
    }

    #[tokio::test]
    async fn empty_asr_event_without_end_signal_is_ignored() {
        let pipeline = heuristic_pipeline();
        let mut utterance_open = pipeline.streams.utterance_open.subscribe();

        pipeline.process_asr_event(asr("", false, ts(0)), ts(0)).await;

        assert!(utterance_open.try_recv().is_err());
    }
}
