//! Parallel strategy: the heuristic fires synchronously on every final
//! utterance so downstream consumers never wait on a network call, while
//! the LLM strategy runs in the background and may later correct it.

use tokio_util::sync::CancellationToken;
use utterance_events::{
    CorrectionKind, DetectedIntent, IntentCorrectionEvent, IntentEvent,
};

use crate::heuristic::HeuristicDetector;
use crate::llm::{LlmDetector, LlmIntentBackend};

/// Tracks the heuristic's final call for an utterance so a later LLM result
/// can be compared against it and turned into a correction.
pub struct ParallelStrategy<B: LlmIntentBackend> {
    heuristic: HeuristicDetector,
    llm: LlmDetector<B>,
    heuristic_results: std::collections::HashMap<String, DetectedIntent>,
}

impl<B: LlmIntentBackend> ParallelStrategy<B> {
    pub fn new(heuristic: HeuristicDetector, llm: LlmDetector<B>) -> Self {
        Self {
            heuristic,
            llm,
            heuristic_results: std::collections::HashMap::new(),
        }
    }

    /// Synchronous heuristic pass. Always succeeds and should be published
    /// immediately as the candidate/final intent for `utterance_id`.
    pub fn classify_now(&mut self, utterance_id: &str, text: &str) -> IntentEvent {
        let mut intent = self.heuristic.detect_final(text);
        intent.utterance_id = Some(utterance_id.to_string());
        self.heuristic_results
            .insert(utterance_id.to_string(), intent.clone());
        IntentEvent {
            utterance_id: utterance_id.to_string(),
            is_candidate: false,
            intent,
            timestamp: chrono::Utc::now(),
            transcript_char_start: None,
            transcript_char_end: None,
        }
    }

    /// Buffer this utterance's text for the background LLM pass, returning
    /// whether it should trigger an immediate classification attempt.
    pub fn enqueue_llm(&mut self, utterance_id: &str, text: &str) -> bool {
        self.llm.enqueue(utterance_id, text)
    }

    pub fn llm_pause_trigger_ready(&self) -> bool {
        self.llm.pause_trigger_ready()
    }

    pub fn llm_inactivity_trigger_fired(&self, now: std::time::Instant) -> bool {
        self.llm.inactivity_trigger_fired(now)
    }

    /// Run the LLM pass and diff its output against the stored heuristic
    /// result for the same utterance, producing corrections.
    pub async fn reconcile(
        &mut self,
        force: bool,
        cancel: CancellationToken,
    ) -> Vec<IntentCorrectionEvent> {
        let llm_results = self.llm.classify(force, cancel).await;
        let mut corrections = Vec::new();

        for llm_event in llm_results {
            let previous = self.heuristic_results.get(&llm_event.utterance_id).cloned();
            let kind = match &previous {
                None => CorrectionKind::Added,
                Some(prior) if prior.kind == llm_event.intent.kind && prior.subtype == llm_event.intent.subtype => {
                    CorrectionKind::Confirmed
                }
                Some(_) => CorrectionKind::TypeChanged,
            };

            if kind != CorrectionKind::Confirmed {
                corrections.push(IntentCorrectionEvent {
                    utterance_id: llm_event.utterance_id.clone(),
                    kind,
                    previous,
                    current: llm_event.intent.clone(),
                    timestamp: llm_event.timestamp,
                });
            }

            self.heuristic_results
                .insert(llm_event.utterance_id.clone(), llm_event.intent);
        }

        corrections
    }
}
