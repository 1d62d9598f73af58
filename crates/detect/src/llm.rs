//! LLM-backed classification with a sliding context window.
//!
//! Unlike the heuristic strategy, this one batches text across a short
//! buffer and fires only on explicit triggers (question mark, pause,
//! buffer overflow, inactivity timeout), rate-limited against the backend.
//! Deduplication guards against the LLM re-emitting near-identical intents
//! for paraphrased follow-up utterances.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use utterance_events::{DetectedIntent, IntentEvent};

use crate::error::{DetectError, Result};

const MAX_TRACKED_FINGERPRINTS: usize = 50;

const FILLER_WORDS: &[&str] = &["um", "uh", "er", "ah", "hmm", "mm", "mhm", "erm"];

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "to", "of", "in", "on", "and", "but", "or",
    "that", "this", "it", "for", "with", "as", "at", "be", "by", "from", "so", "do", "does",
];

const DOMAIN_CORRECTIONS: &[(&str, &str)] = &[
    ("configure await", "ConfigureAwait"),
    ("span tea", "Span<T>"),
    ("sea sharp", "C#"),
];

/// Narrow interface to whatever LLM backend is configured. Implementations
/// must never panic on bad input and must honor `cancel`.
#[async_trait]
pub trait LlmIntentBackend: Send + Sync {
    async fn detect_intents(
        &self,
        text: &str,
        previous_context: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<DetectedIntent>>;
}

#[derive(Debug, Clone)]
pub struct LlmDetectorConfig {
    pub confidence_threshold: f32,
    pub rate_limit_ms: u64,
    pub buffer_max_chars: usize,
    pub trigger_on_question_mark: bool,
    pub trigger_on_pause: bool,
    pub trigger_timeout_ms: u64,
    pub deduplication_window_ms: u64,
    pub context_window_chars: usize,
    pub enable_preprocessing: bool,
}

impl Default for LlmDetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            rate_limit_ms: 2000,
            buffer_max_chars: 800,
            trigger_on_question_mark: true,
            trigger_on_pause: true,
            trigger_timeout_ms: 3000,
            deduplication_window_ms: 30_000,
            context_window_chars: 1500,
            enable_preprocessing: true,
        }
    }
}

struct Pending {
    utterance_id: String,
    text: String,
}

pub struct LlmDetector<B: LlmIntentBackend> {
    config: LlmDetectorConfig,
    backend: B,
    unprocessed: Vec<Pending>,
    context_window: VecDeque<Pending>,
    last_call_at: Option<Instant>,
    last_enqueued_at: Option<Instant>,
    seen_fingerprints: VecDeque<(String, Instant)>,
}

impl<B: LlmIntentBackend> LlmDetector<B> {
    pub fn new(config: LlmDetectorConfig, backend: B) -> Self {
        Self {
            config,
            backend,
            unprocessed: Vec::new(),
            context_window: VecDeque::new(),
            last_call_at: None,
            last_enqueued_at: None,
            seen_fingerprints: VecDeque::new(),
        }
    }

    /// Buffer a finalized utterance. Returns `true` if this enqueue should
    /// force an immediate classification attempt (question mark, or the
    /// buffer just exceeded its char cap).
    pub fn enqueue(&mut self, utterance_id: &str, text: &str) -> bool {
        let text = if self.config.enable_preprocessing {
            preprocess(text)
        } else {
            text.to_string()
        };
        let question_trigger = self.config.trigger_on_question_mark && text.contains('?');
        self.unprocessed.push(Pending {
            utterance_id: utterance_id.to_string(),
            text,
        });
        self.last_enqueued_at = Some(Instant::now());
        let overflow_trigger = self.buffered_chars() > self.config.buffer_max_chars;
        question_trigger || overflow_trigger
    }

    pub fn buffered_chars(&self) -> usize {
        self.unprocessed.iter().map(|p| p.text.len()).sum()
    }

    pub fn has_pending(&self) -> bool {
        !self.unprocessed.is_empty()
    }

    /// A caller-driven pause signal (e.g. from the router's debounce loop).
    pub fn pause_trigger_ready(&self) -> bool {
        self.config.trigger_on_pause && self.has_pending()
    }

    pub fn inactivity_trigger_fired(&self, now: Instant) -> bool {
        self.has_pending()
            && self
                .last_enqueued_at
                .map(|t| now.duration_since(t) >= Duration::from_millis(self.config.trigger_timeout_ms))
                .unwrap_or(false)
    }

    fn rate_limited(&self) -> bool {
        self.last_call_at
            .map(|t| t.elapsed() < Duration::from_millis(self.config.rate_limit_ms))
            .unwrap_or(false)
    }

    /// Attempt classification of the buffered utterances. `force` bypasses
    /// the rate limit (used by the buffer-overflow trigger). Returns the
    /// non-duplicate, above-threshold intents, and always drains the
    /// buffer into the context window on a successful call.
    pub async fn classify(&mut self, force: bool, cancel: CancellationToken) -> Vec<IntentEvent> {
        if self.unprocessed.is_empty() {
            return Vec::new();
        }
        if !force && self.rate_limited() {
            return Vec::new();
        }

        self.last_call_at = Some(Instant::now());
        let context = self.build_context();
        let batch: String = self
            .unprocessed
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let default_utterance_id = self
            .unprocessed
            .last()
            .map(|p| p.utterance_id.clone())
            .unwrap_or_default();

        let results = match self.backend.detect_intents(&batch, &context, cancel).await {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(error = %err, "llm detector: backend call failed, leaving buffer intact");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for intent in results {
            if intent.confidence < self.config.confidence_threshold {
                continue;
            }
            let fp = fingerprint(&intent.source_text);
            if fp.is_empty() || self.is_duplicate(&fp) {
                continue;
            }
            self.remember_fingerprint(fp);
            let utterance_id = intent
                .utterance_id
                .clone()
                .unwrap_or_else(|| default_utterance_id.clone());
            outcomes.push(IntentEvent {
                utterance_id,
                is_candidate: false,
                intent,
                timestamp: Utc::now(),
                transcript_char_start: None,
                transcript_char_end: None,
            });
        }

        self.move_unprocessed_to_context();
        outcomes
    }

    fn is_duplicate(&self, fingerprint: &str) -> bool {
        let now = Instant::now();
        let candidate_tokens: Vec<&str> = fingerprint.split(' ').collect();
        self.seen_fingerprints.iter().any(|(seen, at)| {
            if now.duration_since(*at) > Duration::from_millis(self.config.deduplication_window_ms) {
                return false;
            }
            let seen_tokens: Vec<&str> = seen.split(' ').collect();
            jaccard_similarity(&candidate_tokens, &seen_tokens) >= 0.7
        })
    }

    fn remember_fingerprint(&mut self, fingerprint: String) {
        self.seen_fingerprints.push_back((fingerprint, Instant::now()));
        while self.seen_fingerprints.len() > MAX_TRACKED_FINGERPRINTS {
            self.seen_fingerprints.pop_front();
        }
    }

    fn build_context(&self) -> String {
        self.context_window
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn move_unprocessed_to_context(&mut self) {
        for pending in self.unprocessed.drain(..) {
            self.context_window.push_back(pending);
        }
        let mut total: usize = self.context_window.iter().map(|p| p.text.len()).sum();
        while total > self.config.context_window_chars {
            if let Some(evicted) = self.context_window.pop_front() {
                total -= evicted.text.len();
            } else {
                break;
            }
        }
    }
}

fn jaccard_similarity(a: &[&str], b: &[&str]) -> f32 {
    use std::collections::HashSet;
    let a: HashSet<&str> = a.iter().copied().filter(|s| !s.is_empty()).collect();
    let b: HashSet<&str> = b.iter().copied().filter(|s| !s.is_empty()).collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// Lower-case, punctuation-stripped, stop-word-filtered, sorted token join.
/// Used to detect near-duplicate LLM outputs across paraphrased utterances.
pub fn fingerprint(text: &str) -> String {
    let mut tokens: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
        .map(|w| w.to_string())
        .collect();
    tokens.sort();
    tokens.join(" ")
}

/// Strip filler words, collapse stutter repeats, and apply a small
/// domain-term correction table before sending text to the backend.
pub fn preprocess(text: &str) -> String {
    let mut words: Vec<&str> = text.split_whitespace().collect();

    words.retain(|w| {
        let cleaned = w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
        !FILLER_WORDS.contains(&cleaned.as_str())
    });

    let mut collapsed: Vec<&str> = Vec::with_capacity(words.len());
    for word in words {
        let repeat_count = collapsed
            .iter()
            .rev()
            .take_while(|w| w.eq_ignore_ascii_case(word))
            .count();
        if repeat_count < 2 {
            collapsed.push(word);
        }
    }

    let mut result = collapsed.join(" ");
    let mut corrections: Vec<&(&str, &str)> = DOMAIN_CORRECTIONS.iter().collect();
    corrections.sort_by_key(|(from, _)| std::cmp::Reverse(from.len()));
    for (from, to) in corrections {
        let lower_result = result.to_lowercase();
        if let Some(pos) = lower_result.find(from) {
            result.replace_range(pos..pos + from.len(), to);
        }
    }
    result
}

/// Scripted backend for deterministic tests: returns one queued response
/// per call, in order, regardless of the request content.
pub struct StubLlmBackend {
    responses: std::sync::Mutex<VecDeque<Vec<DetectedIntent>>>,
}

impl StubLlmBackend {
    pub fn new(responses: Vec<Vec<DetectedIntent>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl LlmIntentBackend for StubLlmBackend {
    async fn detect_intents(
        &self,
        _text: &str,
        _previous_context: &str,
        _cancel: CancellationToken,
    ) -> Result<Vec<DetectedIntent>> {
        Ok(self
            .responses
            .lock()
            .expect("stub backend poisoned")
            .pop_front()
            .unwrap_or_default())
    }
}

/// HTTP adapter against an OpenAI-compatible chat-completions endpoint.
pub struct HttpLlmBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLlmBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key,
        }
    }

    const SYSTEM_PROMPT: &'static str = "You classify spoken utterances into intents \
        (Question, Imperative, Statement, Other) with an optional subtype and slots. \
        Resolve pronouns against the previous context so `source_text` is self-contained. \
        Respond with a JSON object: {\"intents\": [...]}.";

    /// Sends `request`, retrying exactly once on a connection-level or
    /// timeout failure. A non-2xx status or a malformed body is not a
    /// transport failure and is surfaced to the caller untouched.
    async fn send_with_retry(request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let retry_request = request.try_clone();
        match request.send().await {
            Ok(response) => Ok(response),
            Err(err) if err.is_connect() || err.is_timeout() => {
                tracing::warn!(error = %err, "llm backend: transport failure, retrying once");
                let retry_request = retry_request
                    .ok_or_else(|| DetectError::Backend(err.to_string()))?;
                retry_request
                    .send()
                    .await
                    .map_err(|e| DetectError::Backend(e.to_string()))
            }
            Err(err) => Err(DetectError::Backend(err.to_string())),
        }
    }
}

#[async_trait]
impl LlmIntentBackend for HttpLlmBackend {
    async fn detect_intents(
        &self,
        text: &str,
        previous_context: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<DetectedIntent>> {
        let user_content = format!(
            "Previous context:\n{previous_context}\n\nCurrent transcript:\n{text}"
        );
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": Self::SYSTEM_PROMPT},
                {"role": "user", "content": user_content},
            ],
            "response_format": {"type": "json_object"},
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body)
            .timeout(Duration::from_secs(10));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DetectError::Cancelled),
            result = Self::send_with_retry(request) => result?,
        };

        if !response.status().is_success() {
            return Err(DetectError::Backend(format!("status {}", response.status())));
        }

        let payload: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| DetectError::InvalidResponse(e.to_string()))?;

        let content = payload
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("{}");

        let parsed: IntentsPayload =
            serde_json::from_str(content).map_err(|e| DetectError::InvalidResponse(e.to_string()))?;

        Ok(parsed.intents)
    }
}

#[derive(serde::Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(serde::Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(serde::Deserialize)]
struct IntentsPayload {
    intents: Vec<DetectedIntent>,
}
