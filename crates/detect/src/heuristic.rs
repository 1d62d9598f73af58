//! Pure, deterministic, zero-I/O classification. Rules are applied in
//! strict priority order (imperative, then question, then default
//! statement) and are compiled once at construction time.

use regex::Regex;
use utterance_events::{DetectedIntent, IntentSlots, IntentSubtype, IntentType};

const POLITE_PREFIXES: &[&str] = &["please ", "can you ", "could you ", "would you "];

struct ImperativePattern {
    regex: Regex,
    subtype: IntentSubtype,
    confidence: f32,
}

pub struct HeuristicDetector {
    stop: ImperativePattern,
    imperatives: Vec<ImperativePattern>,
    repeat_numbered: Regex,
    repeat_last: Regex,
    generate: Regex,
    generate_count: Regex,
    generate_topic: Regex,
    wh_word: Regex,
    auxiliary: Regex,
    question_phrase: Regex,
    comparison: Regex,
    troubleshoot: Regex,
    definition_topic: Regex,
    about_topic: Regex,
}

impl Default for HeuristicDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicDetector {
    pub fn new() -> Self {
        Self {
            stop: ImperativePattern {
                regex: Regex::new(
                    r"^(stop|cancel|nevermind|never\s*mind|quit|exit|enough|that's\s*enough)\b",
                )
                .unwrap(),
                subtype: IntentSubtype::Stop,
                confidence: 0.95,
            },
            imperatives: vec![
                ImperativePattern {
                    regex: Regex::new(r"^(continue|go on|next|proceed|keep going|carry on)\b")
                        .unwrap(),
                    subtype: IntentSubtype::Continue,
                    confidence: 0.85,
                },
                ImperativePattern {
                    regex: Regex::new(
                        r"(start over|from the (beginning|start)|reset|begin again)",
                    )
                    .unwrap(),
                    subtype: IntentSubtype::StartOver,
                    confidence: 0.90,
                },
            ],
            repeat_numbered: Regex::new(r"repeat\s+(?:number\s+|#)?(\d+)").unwrap(),
            repeat_last: Regex::new(r"(repeat|say)\s+(the\s+)?(last|previous)").unwrap(),
            generate: Regex::new(
                r"(generate|give me|create|make|produce).*(questions?|queries)",
            )
            .unwrap(),
            generate_count: Regex::new(r"(\d+)\s+(questions?|queries)").unwrap(),
            generate_topic: Regex::new(r"about\s+(.+)$").unwrap(),
            wh_word: Regex::new(r"^(what|why|how|when|where|who|which|whose)\b").unwrap(),
            auxiliary: Regex::new(
                r"^(is|are|was|were|do|does|did|can|could|would|should|have|has|will|shall|may|might)\b",
            )
            .unwrap(),
            question_phrase: Regex::new(r"(do you know|can you tell me|what's|what is)").unwrap(),
            comparison: Regex::new(r"(difference between|compare|vs\.?|versus|compared to)")
                .unwrap(),
            troubleshoot: Regex::new(
                r"(why isn't|doesn't|won't|not working|error|issue|problem|fail)",
            )
            .unwrap(),
            definition_topic: Regex::new(
                r"(?:what is (?:a|an|the)?\s*|define\s+|explain\s+)(.+?)(\?|$)",
            )
            .unwrap(),
            about_topic: Regex::new(r"about\s+(.+?)(\?|$)").unwrap(),
        }
    }

    /// Candidate classification: returns `None` below confidence 0.3.
    pub fn detect_candidate(&self, text: &str) -> Option<DetectedIntent> {
        let intent = self.classify(text)?;
        (intent.confidence >= 0.3).then_some(intent)
    }

    /// Final classification: falls back to a Statement at confidence 0.4
    /// when no other rule matched.
    pub fn detect_final(&self, text: &str) -> DetectedIntent {
        self.classify(text).unwrap_or_else(|| DetectedIntent {
            kind: IntentType::Statement,
            subtype: None,
            confidence: 0.4,
            slots: IntentSlots::default(),
            source_text: text.to_string(),
            original_text: None,
            utterance_id: None,
        })
    }

    fn classify(&self, text: &str) -> Option<DetectedIntent> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let lower = trimmed.to_lowercase();

        if let Some(intent) = self.classify_imperative(&lower, trimmed) {
            return Some(intent);
        }
        self.classify_question(&lower, trimmed)
    }

    fn classify_imperative(&self, lower: &str, source: &str) -> Option<DetectedIntent> {
        let (stripped, was_polite) = strip_polite_prefix(lower);

        if self.stop.regex.is_match(stripped) {
            return Some(DetectedIntent {
                kind: IntentType::Imperative,
                subtype: Some(self.stop.subtype),
                confidence: self.stop.confidence,
                slots: IntentSlots::default(),
                source_text: source.to_string(),
                original_text: None,
                utterance_id: None,
            });
        }

        if let Some(captures) = self.repeat_numbered.captures(stripped) {
            let n: u32 = captures[1].parse().ok()?;
            return Some(DetectedIntent {
                kind: IntentType::Imperative,
                subtype: Some(IntentSubtype::Repeat),
                confidence: 0.90,
                slots: IntentSlots {
                    count: Some(n),
                    reference: Some(format!("number {n}")),
                    topic: None,
                },
                source_text: source.to_string(),
                original_text: None,
                utterance_id: None,
            });
        }

        if self.repeat_last.is_match(stripped) {
            return Some(DetectedIntent {
                kind: IntentType::Imperative,
                subtype: Some(IntentSubtype::Repeat),
                confidence: 0.90,
                slots: IntentSlots {
                    reference: Some("last".to_string()),
                    ..Default::default()
                },
                source_text: source.to_string(),
                original_text: None,
                utterance_id: None,
            });
        }

        let repeat_general =
            stripped.starts_with("repeat") || stripped.starts_with("say that again")
                || stripped.starts_with("say it again")
                || stripped.starts_with("what did you say");
        if repeat_general {
            let confidence = if was_polite { 0.85 } else { 0.80 };
            return Some(DetectedIntent {
                kind: IntentType::Imperative,
                subtype: Some(IntentSubtype::Repeat),
                confidence,
                slots: IntentSlots::default(),
                source_text: source.to_string(),
                original_text: None,
                utterance_id: None,
            });
        }

        for pattern in &self.imperatives {
            if pattern.regex.is_match(stripped) {
                return Some(DetectedIntent {
                    kind: IntentType::Imperative,
                    subtype: Some(pattern.subtype),
                    confidence: pattern.confidence,
                    slots: IntentSlots::default(),
                    source_text: source.to_string(),
                    original_text: None,
                    utterance_id: None,
                });
            }
        }

        if self.generate.is_match(stripped) {
            let count = self
                .generate_count
                .captures(stripped)
                .and_then(|c| c[1].parse().ok());
            let topic = self
                .generate_topic
                .captures(stripped)
                .map(|c| c[1].trim_end_matches('?').trim().to_string());
            return Some(DetectedIntent {
                kind: IntentType::Imperative,
                subtype: Some(IntentSubtype::Generate),
                confidence: 0.85,
                slots: IntentSlots {
                    count,
                    topic,
                    reference: None,
                },
                source_text: source.to_string(),
                original_text: None,
                utterance_id: None,
            });
        }

        None
    }

    fn classify_question(&self, lower: &str, source: &str) -> Option<DetectedIntent> {
        let mut score = 0.0_f32;
        if lower.trim_end().ends_with('?') {
            score += 0.5;
        }
        if self.wh_word.is_match(lower) {
            score += 0.4;
        }
        if self.auxiliary.is_match(lower) {
            score += 0.3;
        }
        if self.question_phrase.is_match(lower) {
            score += 0.3;
        }
        if self.comparison.is_match(lower) {
            score += 0.5;
        }
        if self.troubleshoot.is_match(lower) {
            score += 0.4;
        }

        if score < 0.4 {
            return None;
        }

        let subtype = if self.comparison.is_match(lower) {
            IntentSubtype::Compare
        } else if self.wh_word.is_match(lower) && lower.contains("how") {
            IntentSubtype::HowTo
        } else if self.troubleshoot.is_match(lower) {
            IntentSubtype::Troubleshoot
        } else {
            IntentSubtype::Definition
        };

        let topic = self
            .definition_topic
            .captures(lower)
            .map(|c| c[1].trim().to_string())
            .or_else(|| {
                self.about_topic
                    .captures(lower)
                    .map(|c| c[1].trim().to_string())
            })
            .filter(|t| !t.is_empty());

        Some(DetectedIntent {
            kind: IntentType::Question,
            subtype: Some(subtype),
            confidence: score.min(1.0),
            slots: IntentSlots {
                topic,
                count: None,
                reference: None,
            },
            source_text: source.to_string(),
            original_text: None,
            utterance_id: None,
        })
    }
}

fn strip_polite_prefix(lower: &str) -> (&str, bool) {
    for prefix in POLITE_PREFIXES {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return (rest, true);
        }
    }
    (lower, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> HeuristicDetector {
        HeuristicDetector::new()
    }

    #[test]
    fn stop_is_high_confidence() {
        let intent = detector().detect_final("stop");
        assert_eq!(intent.kind, IntentType::Imperative);
        assert_eq!(intent.subtype, Some(IntentSubtype::Stop));
        assert!(intent.confidence >= 0.9);
    }

    #[test]
    fn stop_takes_priority_over_a_trailing_repeat_phrase() {
        let intent = detector().detect_final("stop, repeat number 5");
        assert_eq!(intent.subtype, Some(IntentSubtype::Stop));
        assert_eq!(intent.confidence, 0.95);
    }

    #[test]
    fn repeat_with_number_extracts_count_slot() {
        let intent = detector().detect_final("please repeat number 3");
        assert_eq!(intent.subtype, Some(IntentSubtype::Repeat));
        assert_eq!(intent.slots.count, Some(3));
        assert_eq!(intent.slots.reference.as_deref(), Some("number 3"));
    }

    #[test]
    fn repeat_last_sets_reference() {
        let intent = detector().detect_final("repeat the last thing you said");
        assert_eq!(intent.subtype, Some(IntentSubtype::Repeat));
        assert_eq!(intent.slots.reference.as_deref(), Some("last"));
    }

    #[test]
    fn polite_prefix_boosts_confidence() {
        let polite = detector().detect_final("could you repeat that");
        let blunt = detector().detect_final("repeat that");
        assert!(polite.confidence >= blunt.confidence);
    }

    #[test]
    fn question_mark_plus_auxiliary_clears_threshold() {
        // '?' (+0.5) plus a leading auxiliary (+0.3) clears the 0.4 bar.
        let intent = detector().detect_candidate("is this thing on?");
        assert!(intent.is_some());
    }

    #[test]
    fn comparison_question_gets_compare_subtype() {
        let intent = detector().detect_final("what's the difference between A and B?");
        assert_eq!(intent.kind, IntentType::Question);
        assert_eq!(intent.subtype, Some(IntentSubtype::Compare));
    }

    #[test]
    fn definition_question_extracts_topic() {
        let intent = detector().detect_final("what is a lock statement?");
        assert_eq!(intent.subtype, Some(IntentSubtype::Definition));
        assert_eq!(intent.slots.topic.as_deref(), Some("lock statement"));
    }

    #[test]
    fn unrecognized_text_falls_back_to_statement() {
        let intent = detector().detect_final("the weather today is nice");
        assert_eq!(intent.kind, IntentType::Statement);
        assert_eq!(intent.confidence, 0.4);
    }

    #[test]
    fn generate_extracts_count_and_topic() {
        let intent = detector().detect_final("generate 5 questions about rust ownership");
        assert_eq!(intent.subtype, Some(IntentSubtype::Generate));
        assert_eq!(intent.slots.count, Some(5));
        assert_eq!(intent.slots.topic.as_deref(), Some("rust ownership"));
    }

    #[test]
    fn candidate_below_threshold_returns_none() {
        let intent = detector().detect_candidate("um so anyway");
        assert!(intent.is_none());
    }
}
