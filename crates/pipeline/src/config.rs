//! Layered configuration: built-in defaults, overridden by an optional
//! TOML file, overridden by `UTTERANCE_*` environment variables.

use std::collections::HashMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use utterance_detect::DetectionMode;
use utterance_events::IntentSubtype;

fn default_stabilizer_window_size() -> usize {
    3
}
fn default_min_word_confidence() -> f32 {
    0.6
}
fn default_true() -> bool {
    true
}
fn default_silence_gap_ms() -> u64 {
    750
}
fn default_punctuation_pause_ms() -> u64 {
    300
}
fn default_max_utterance_duration_ms() -> u64 {
    12_000
}
fn default_max_utterance_length() -> usize {
    500
}
fn default_conflict_window_ms() -> u64 {
    1500
}
fn default_cooldowns_ms() -> HashMap<String, u64> {
    let mut m = HashMap::new();
    m.insert("Stop".to_string(), 0);
    m.insert("Repeat".to_string(), 1500);
    m.insert("Continue".to_string(), 1500);
    m.insert("StartOver".to_string(), 1500);
    m.insert("Generate".to_string(), 5000);
    m
}
fn default_detection_mode() -> DetectionMode {
    DetectionMode::Heuristic
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_confidence_threshold() -> f32 {
    0.7
}
fn default_llm_rate_limit_ms() -> u64 {
    2000
}
fn default_llm_buffer_max_chars() -> usize {
    800
}
fn default_llm_trigger_timeout_ms() -> u64 {
    3000
}
fn default_llm_dedup_window_ms() -> u64 {
    30_000
}
fn default_llm_context_window_chars() -> usize {
    1500
}
fn default_recorder_correlation_tolerance_ms() -> u64 {
    2000
}
fn default_tick_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerSettings {
    pub stabilizer_window_size: usize,
    pub min_word_confidence: f32,
    pub require_repetition_for_low_confidence: bool,
}

impl Default for StabilizerSettings {
    fn default() -> Self {
        Self {
            stabilizer_window_size: default_stabilizer_window_size(),
            min_word_confidence: default_min_word_confidence(),
            require_repetition_for_low_confidence: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UtteranceSettings {
    pub silence_gap_threshold_ms: u64,
    pub punctuation_pause_threshold_ms: u64,
    pub max_utterance_duration_ms: u64,
    pub max_utterance_length: usize,
}

impl Default for UtteranceSettings {
    fn default() -> Self {
        Self {
            silence_gap_threshold_ms: default_silence_gap_ms(),
            punctuation_pause_threshold_ms: default_punctuation_pause_ms(),
            max_utterance_duration_ms: default_max_utterance_duration_ms(),
            max_utterance_length: default_max_utterance_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionSettings {
    pub conflict_window_ms: u64,
    pub cooldowns_ms: HashMap<String, u64>,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            conflict_window_ms: default_conflict_window_ms(),
            cooldowns_ms: default_cooldowns_ms(),
        }
    }
}

impl ActionSettings {
    pub fn cooldowns(&self) -> HashMap<IntentSubtype, Duration> {
        self.cooldowns_ms
            .iter()
            .filter_map(|(name, ms)| subtype_from_name(name).map(|s| (s, Duration::milliseconds(*ms as i64))))
            .collect()
    }
}

fn subtype_from_name(name: &str) -> Option<IntentSubtype> {
    match name {
        "Stop" => Some(IntentSubtype::Stop),
        "Repeat" => Some(IntentSubtype::Repeat),
        "Continue" => Some(IntentSubtype::Continue),
        "StartOver" => Some(IntentSubtype::StartOver),
        "Generate" => Some(IntentSubtype::Generate),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
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

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            confidence_threshold: default_llm_confidence_threshold(),
            rate_limit_ms: default_llm_rate_limit_ms(),
            buffer_max_chars: default_llm_buffer_max_chars(),
            trigger_on_question_mark: default_true(),
            trigger_on_pause: default_true(),
            trigger_timeout_ms: default_llm_trigger_timeout_ms(),
            deduplication_window_ms: default_llm_dedup_window_ms(),
            context_window_chars: default_llm_context_window_chars(),
            enable_preprocessing: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub output_dir: String,
    pub file_name_pattern: String,
    pub auto_start: bool,
    pub recorder_correlation_tolerance_ms: u64,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            output_dir: ".".to_string(),
            file_name_pattern: "session-{timestamp}-{pid}.jsonl".to_string(),
            auto_start: false,
            recorder_correlation_tolerance_ms: default_recorder_correlation_tolerance_ms(),
        }
    }
}

/// Every tunable named in the external interfaces' configuration surface,
/// loadable from defaults, a TOML file, or `UTTERANCE_*` environment
/// variables (in that ascending order of precedence).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection_mode: DetectionMode,
    pub stabilizer: StabilizerSettings,
    pub utterance: UtteranceSettings,
    pub action: ActionSettings,
    pub llm: LlmSettings,
    pub recording: RecordingSettings,
    pub tick_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_mode: default_detection_mode(),
            stabilizer: StabilizerSettings::default(),
            utterance: UtteranceSettings::default(),
            action: ActionSettings::default(),
            llm: LlmSettings::default(),
            recording: RecordingSettings::default(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Applies `UTTERANCE_*` environment variable overrides on top of an
    /// already-loaded config. Unknown or unparsable variables are ignored
    /// with a warning; this never fails.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("UTTERANCE_DETECTION_MODE") {
            match v.to_lowercase().as_str() {
                "heuristic" => self.detection_mode = DetectionMode::Heuristic,
                "llm" => self.detection_mode = DetectionMode::Llm,
                "parallel" => self.detection_mode = DetectionMode::Parallel,
                "deepgram_intent" | "deepgramintent" => self.detection_mode = DetectionMode::DeepgramIntent,
                other => tracing::warn!(value = other, "unrecognized UTTERANCE_DETECTION_MODE, ignoring"),
            }
        }
        if let Some(v) = parse_env_u64("UTTERANCE_SILENCE_GAP_THRESHOLD_MS") {
            self.utterance.silence_gap_threshold_ms = v;
        }
        if let Some(v) = parse_env_u64("UTTERANCE_MAX_UTTERANCE_DURATION_MS") {
            self.utterance.max_utterance_duration_ms = v;
        }
        if let Some(v) = parse_env_u64("UTTERANCE_CONFLICT_WINDOW_MS") {
            self.action.conflict_window_ms = v;
        }
        if let Ok(v) = std::env::var("UTTERANCE_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("UTTERANCE_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = parse_env_u64("UTTERANCE_LLM_RATE_LIMIT_MS") {
            self.llm.rate_limit_ms = v;
        }
        if let Ok(v) = std::env::var("UTTERANCE_RECORDING_OUTPUT_DIR") {
            self.recording.output_dir = v;
        }
        self
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, raw, "expected an integer, ignoring override");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.utterance.silence_gap_threshold_ms, 750);
        assert_eq!(config.action.conflict_window_ms, 1500);
        assert_eq!(config.llm.confidence_threshold, 0.7);
        assert_eq!(config.detection_mode, DetectionMode::Heuristic);
    }

    #[test]
    fn toml_overrides_only_the_specified_fields() {
        let toml_str = r#"
            detection_mode = "parallel"

            [utterance]
            max_utterance_length = 250
        "#;
        let config = PipelineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.detection_mode, DetectionMode::Parallel);
        assert_eq!(config.utterance.max_utterance_length, 250);
        assert_eq!(config.utterance.silence_gap_threshold_ms, 750, "untouched fields keep their default");
    }

    #[test]
    fn env_override_wins_over_toml_and_defaults() {
        std::env::set_var("UTTERANCE_CONFLICT_WINDOW_MS", "2500");
        let config = PipelineConfig::default().apply_env_overrides();
        std::env::remove_var("UTTERANCE_CONFLICT_WINDOW_MS");
        assert_eq!(config.action.conflict_window_ms, 2500);
    }

    #[test]
    fn cooldowns_map_resolves_to_intent_subtypes() {
        let config = PipelineConfig::default();
        let cooldowns = config.action.cooldowns();
        assert_eq!(cooldowns.get(&IntentSubtype::Generate), Some(&Duration::milliseconds(5000)));
    }
}
