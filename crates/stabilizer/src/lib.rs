//! Turns a stream of revised interim hypotheses into monotonically growing
//! "stable text" for a single in-flight utterance.
//!
//! The approach is a bounded window of recent hypothesis strings, a
//! character-level longest-common-prefix across the window, a trim back to
//! the last whole word, and an optional per-word confidence gate. Published
//! text is never allowed to shrink within an utterance; see
//! [`Stabilizer::push_hypothesis`].

use std::collections::{HashMap, VecDeque};

use utterance_events::AsrWord;

/// Default number of recent hypotheses kept in the LCP window.
pub const DEFAULT_WINDOW_SIZE: usize = 3;

#[derive(Debug, Clone)]
pub struct StabilizerConfig {
    pub window_size: usize,
    pub min_confidence: f32,
    pub require_repetition_for_low_confidence: bool,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            min_confidence: 0.6,
            require_repetition_for_low_confidence: true,
        }
    }
}

/// Tracks the best-seen confidence and repetition count for a normalized
/// word across the current hypothesis window.
#[derive(Debug, Clone, Copy, Default)]
struct WordConfidence {
    best: f32,
    seen: u32,
}

pub struct Stabilizer {
    config: StabilizerConfig,
    window: VecDeque<String>,
    confidence: HashMap<String, WordConfidence>,
    published: String,
}

impl Stabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            confidence: HashMap::new(),
            published: String::new(),
        }
    }

    /// The most recently published stable text for the current utterance.
    pub fn stable_text(&self) -> &str {
        &self.published
    }

    /// Feed a new interim hypothesis. Returns `Some(text)` when the
    /// published stable text changed (i.e. was extended), `None` otherwise.
    /// Never emits a candidate that does not extend the previous one.
    pub fn push_hypothesis(&mut self, text: &str, words: Option<&[AsrWord]>) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }

        if let Some(words) = words {
            self.observe_confidences(words);
        }

        self.window.push_back(text.to_string());
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }

        if self.window.len() < 2 {
            return None;
        }

        let prefix = longest_common_prefix(self.window.iter());
        let newest = self.window.back().expect("window non-empty");
        let trimmed = trim_to_word_boundary(&prefix, newest);
        let gated = self.apply_confidence_gate(&trimmed);

        if gated.len() > self.published.len() && gated.starts_with(&self.published) {
            tracing::debug!(
                previous = %self.published,
                next = %gated,
                "stabilizer: extending stable text"
            );
            self.published = gated.clone();
            Some(gated)
        } else {
            None
        }
    }

    /// Adopt a finalized segment as authoritative stable text, discarding
    /// the hypothesis window. Divergence between the window and the final
    /// segment is resolved in favor of the final segment.
    pub fn commit_final(&mut self, text: &str) -> String {
        self.window.clear();
        self.confidence.clear();
        self.published = text.trim().to_string();
        self.published.clone()
    }

    /// Reset all state for the next utterance.
    pub fn reset(&mut self) {
        self.window.clear();
        self.confidence.clear();
        self.published.clear();
    }

    fn observe_confidences(&mut self, words: &[AsrWord]) {
        for word in words {
            let key = normalize_word(&word.word);
            if key.is_empty() {
                continue;
            }
            let entry = self.confidence.entry(key).or_default();
            entry.best = entry.best.max(word.confidence);
            entry.seen += 1;
        }
    }

    fn apply_confidence_gate(&self, candidate: &str) -> String {
        if self.config.min_confidence <= 0.0 || self.confidence.is_empty() {
            return candidate.to_string();
        }

        let mut kept: Vec<&str> = Vec::new();
        for word in candidate.split_whitespace() {
            let key = normalize_word(word);
            match self.confidence.get(&key) {
                Some(info) if info.best < self.config.min_confidence => {
                    let repeated_enough =
                        self.config.require_repetition_for_low_confidence && info.seen >= 2;
                    if repeated_enough {
                        kept.push(word);
                    } else {
                        break;
                    }
                }
                _ => kept.push(word),
            }
        }
        kept.join(" ")
    }
}

fn normalize_word(word: &str) -> String {
    word.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Character-level longest common prefix across all strings, safe on UTF-8
/// boundaries (compares by `char`, not byte).
fn longest_common_prefix<'a>(mut strings: impl Iterator<Item = &'a String>) -> String {
    let first = match strings.next() {
        Some(s) => s,
        None => return String::new(),
    };
    let mut prefix_len = first.chars().count();

    for s in strings {
        let common = first
            .chars()
            .zip(s.chars())
            .take_while(|(a, b)| a == b)
            .count();
        prefix_len = prefix_len.min(common);
        if prefix_len == 0 {
            break;
        }
    }

    first.chars().take(prefix_len).collect()
}

/// Trim `prefix` back to the last whole word boundary, unless the character
/// immediately following it in `newest` is itself a separator (meaning the
/// prefix already ends on a boundary and a partial word is not being cut).
fn trim_to_word_boundary(prefix: &str, newest: &str) -> String {
    if prefix.is_empty() {
        return String::new();
    }

    let next_is_boundary = newest[prefix.len()..]
        .chars()
        .next()
        .map(|c| c.is_whitespace())
        .unwrap_or(true);

    if next_is_boundary {
        return prefix.to_string();
    }

    match prefix.rfind(char::is_whitespace) {
        Some(idx) => prefix[..idx].trim_end().to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stabilizer() -> Stabilizer {
        Stabilizer::new(StabilizerConfig {
            window_size: 3,
            min_confidence: 0.0,
            require_repetition_for_low_confidence: true,
        })
    }

    #[test]
    fn single_hypothesis_publishes_nothing() {
        let mut s = stabilizer();
        assert_eq!(s.push_hypothesis("What is a", None), None);
        assert_eq!(s.stable_text(), "");
    }

    #[test]
    fn second_hypothesis_publishes_common_prefix() {
        let mut s = stabilizer();
        s.push_hypothesis("What is a", None);
        let published = s.push_hypothesis("What is a lock", None);
        assert_eq!(published.as_deref(), Some("What is a"));
    }

    #[test]
    fn monotonic_stabilization_across_three_hypotheses() {
        let mut s = stabilizer();
        assert_eq!(s.push_hypothesis("What is a", None), None);
        assert_eq!(s.push_hypothesis("What is a lock", None).as_deref(), Some("What is a"));
        assert_eq!(
            s.push_hypothesis("What is a lock statement", None).as_deref(),
            Some("What is a")
        );
        let finalized = s.commit_final("What is a lock statement used in C#?");
        assert_eq!(finalized, "What is a lock statement used in C#?");
    }

    #[test]
    fn never_publishes_a_partial_word() {
        let mut s = stabilizer();
        s.push_hypothesis("the lo", None);
        let published = s.push_hypothesis("the lock", None);
        // "the lo" vs "the lock" -> char LCP is "the lo", but "lo" is not
        // followed by a separator in "the lock", so it must trim back to "the".
        assert_eq!(published.as_deref(), Some("the"));
        assert_eq!(s.stable_text(), "the");
    }

    #[test]
    fn never_retracts_published_text() {
        let mut s = stabilizer();
        s.push_hypothesis("hello there", None);
        s.push_hypothesis("hello there friend", None);
        assert_eq!(s.stable_text(), "hello there");
        // A divergent, shorter hypothesis must not shrink the published text.
        let published = s.push_hypothesis("hello", None);
        assert_eq!(published, None);
        assert_eq!(s.stable_text(), "hello there");
    }

    #[test]
    fn low_confidence_tail_is_dropped_without_repetition() {
        let mut s = Stabilizer::new(StabilizerConfig {
            window_size: 3,
            min_confidence: 0.6,
            require_repetition_for_low_confidence: true,
        });
        let words = vec![
            AsrWord { word: "turn".into(), start_s: 0.0, end_s: 0.1, confidence: 0.9, speaker: None },
            AsrWord { word: "write".into(), start_s: 0.1, end_s: 0.2, confidence: 0.3, speaker: None },
            AsrWord { word: "on".into(), start_s: 0.2, end_s: 0.3, confidence: 0.9, speaker: None },
        ];
        s.push_hypothesis("turn write on", Some(&words));
        let published = s.push_hypothesis("turn write on", None);
        assert_eq!(published.as_deref(), Some("turn"));
    }

    #[test]
    fn reset_clears_everything() {
        let mut s = stabilizer();
        s.push_hypothesis("a b", None);
        s.push_hypothesis("a b c", None);
        s.reset();
        assert_eq!(s.stable_text(), "");
        assert_eq!(s.push_hypothesis("x y", None), None);
    }

    #[test]
    fn empty_hypothesis_is_ignored() {
        let mut s = stabilizer();
        s.push_hypothesis("hello world", None);
        s.push_hypothesis("hello world again", None);
        let published = s.push_hypothesis("   ", None);
        assert_eq!(published, None);
    }
}
