//! Escalation detection.
//!
//! Decides when a call should be handed to a human agent: explicit keyword
//! requests, frustration patterns, conversations that run too long, callers
//! repeating themselves, and the DTMF `0` convention.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::info;

use crate::config::EscalationConfig;

/// Which strategy fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationTrigger {
    Keyword,
    Sentiment,
    Turns,
    Repeated,
    Dtmf,
}

impl EscalationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationTrigger::Keyword => "keyword",
            EscalationTrigger::Sentiment => "sentiment",
            EscalationTrigger::Turns => "turns",
            EscalationTrigger::Repeated => "repeated",
            EscalationTrigger::Dtmf => "dtmf",
        }
    }
}

/// Result of an escalation check.
#[derive(Debug, Clone)]
pub struct EscalationResult {
    pub should_escalate: bool,
    pub reason: String,
    pub confidence: f32,
    pub trigger: Option<EscalationTrigger>,
}

impl EscalationResult {
    fn none() -> Self {
        Self { should_escalate: false, reason: String::new(), confidence: 0.0, trigger: None }
    }

    fn fired(trigger: EscalationTrigger, reason: String, confidence: f32) -> Self {
        Self { should_escalate: true, reason, confidence, trigger: Some(trigger) }
    }
}

static ANGER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"this is (?:so |really )?(?:frustrating|ridiculous|unacceptable|terrible|awful)",
        r"(?:i'm|i am) (?:so |really |very )?(?:angry|frustrated|upset|furious|mad)",
        r"(?:you're|you are) (?:useless|terrible|awful|incompetent|stupid|dumb)",
        r"this (?:doesn't|does not|isn't|is not) (?:help|work|make sense)",
        r"(?:wtf|omg|seriously|come on|for god'?s? sake)\b",
        r"i (?:already|just) (?:told|said|explained) (?:you|that)",
        r"what the (?:hell|heck|fuck)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("anger pattern must compile"))
    .collect()
});

/// Per-call escalation detector. Tracks turn count and recent messages;
/// keyword and DTMF escalations latch so a call escalates once.
pub struct EscalationDetector {
    enabled: bool,
    config: EscalationConfig,
    turn_count: u32,
    user_messages: Vec<String>,
    triggered: bool,
}

impl EscalationDetector {
    pub fn new(enabled: bool, config: EscalationConfig) -> Self {
        Self { enabled, config, turn_count: 0, user_messages: Vec::new(), triggered: false }
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    pub fn transfer_message(&self) -> &str {
        &self.config.transfer_message
    }

    pub fn transfer_number(&self) -> &str {
        &self.config.transfer_number
    }

    /// Check one user turn. Call on every transcribed turn.
    pub fn check_user_message(&mut self, text: &str) -> EscalationResult {
        if !self.enabled || self.triggered {
            return EscalationResult::none();
        }

        self.turn_count += 1;
        let lowered = text.to_lowercase().trim().to_string();
        self.user_messages.push(lowered.clone());

        // 1. Keyword triggers.
        for keyword in &self.config.keyword_triggers {
            if lowered.contains(&keyword.to_lowercase()) {
                self.triggered = true;
                info!("escalation triggered by keyword: '{keyword}'");
                return EscalationResult::fired(
                    EscalationTrigger::Keyword,
                    format!("Caller requested human: '{keyword}'"),
                    0.95,
                );
            }
        }

        // 2. Anger patterns.
        for pattern in ANGER_PATTERNS.iter() {
            if pattern.is_match(&lowered) {
                info!("anger pattern detected: {pattern}");
                return EscalationResult::fired(
                    EscalationTrigger::Sentiment,
                    "Caller frustration detected".into(),
                    0.7,
                );
            }
        }

        // 3. Turn budget.
        if self.turn_count >= self.config.max_turns_before_escalation {
            info!("max turns ({}) reached", self.config.max_turns_before_escalation);
            return EscalationResult::fired(
                EscalationTrigger::Turns,
                format!(
                    "Conversation exceeded {} turns",
                    self.config.max_turns_before_escalation
                ),
                0.6,
            );
        }

        // 4. Repeated questions over the recent window.
        let window = self.config.repeated_question_threshold;
        if self.user_messages.len() >= window {
            let recent = &self.user_messages[self.user_messages.len() - window..];
            if messages_are_similar(recent, 0.6) {
                info!("repeated question pattern detected");
                return EscalationResult::fired(
                    EscalationTrigger::Repeated,
                    "Caller is repeating the same question".into(),
                    0.65,
                );
            }
        }

        EscalationResult::none()
    }

    /// DTMF `0` requests a human agent, with full confidence.
    pub fn check_dtmf(&mut self, digit: &str) -> EscalationResult {
        if !self.enabled {
            return EscalationResult::none();
        }
        if digit == "0" {
            self.triggered = true;
            info!("escalation triggered by DTMF 0");
            return EscalationResult::fired(
                EscalationTrigger::Dtmf,
                "Caller pressed 0 to speak with a human agent".into(),
                1.0,
            );
        }
        EscalationResult::none()
    }

    pub fn reset(&mut self) {
        self.turn_count = 0;
        self.user_messages.clear();
        self.triggered = false;
    }
}

/// Whether at least half of the pairs in `messages` have Jaccard word
/// similarity at or above `threshold`.
fn messages_are_similar(messages: &[String], threshold: f64) -> bool {
    if messages.len() < 2 {
        return false;
    }
    let word_sets: Vec<HashSet<&str>> =
        messages.iter().map(|m| m.split_whitespace().collect()).collect();

    let mut similar_pairs = 0usize;
    let mut total_pairs = 0usize;
    for i in 0..word_sets.len() {
        for j in (i + 1)..word_sets.len() {
            total_pairs += 1;
            if word_sets[i].is_empty() || word_sets[j].is_empty() {
                continue;
            }
            let intersection = word_sets[i].intersection(&word_sets[j]).count();
            let union = word_sets[i].union(&word_sets[j]).count();
            if union > 0 && intersection as f64 / union as f64 >= threshold {
                similar_pairs += 1;
            }
        }
    }

    total_pairs > 0 && similar_pairs * 2 >= total_pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> EscalationDetector {
        EscalationDetector::new(true, EscalationConfig::default())
    }

    #[test]
    fn test_dtmf_zero_always_triggers_full_confidence() {
        let mut d = detector();
        let result = d.check_dtmf("0");
        assert!(result.should_escalate);
        assert_eq!(result.trigger, Some(EscalationTrigger::Dtmf));
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_other_digits_do_not_trigger() {
        let mut d = detector();
        for digit in ["1", "5", "9", "*", "#"] {
            assert!(!d.check_dtmf(digit).should_escalate);
        }
    }

    #[test]
    fn test_disabled_detector_never_triggers() {
        let mut d = EscalationDetector::new(false, EscalationConfig::default());
        assert!(!d.check_dtmf("0").should_escalate);
        assert!(!d.check_user_message("transfer me to a supervisor now").should_escalate);
    }

    #[test]
    fn test_keyword_trigger_latches() {
        let mut d = detector();
        let result = d.check_user_message("I want to speak to a human please");
        assert!(result.should_escalate);
        assert_eq!(result.trigger, Some(EscalationTrigger::Keyword));
        assert!((result.confidence - 0.95).abs() < 1e-6);

        // Latched: later messages no longer fire.
        assert!(!d.check_user_message("speak to a human").should_escalate);
    }

    #[test]
    fn test_anger_pattern() {
        let mut d = detector();
        let result = d.check_user_message("This is absolutely ridiculous, I am so frustrated");
        assert!(result.should_escalate);
        assert_eq!(result.trigger, Some(EscalationTrigger::Sentiment));
    }

    #[test]
    fn test_turn_budget() {
        let mut config = EscalationConfig::default();
        config.max_turns_before_escalation = 3;
        let mut d = EscalationDetector::new(true, config);

        assert!(!d.check_user_message("first thing").should_escalate);
        assert!(!d.check_user_message("second thing").should_escalate);
        let result = d.check_user_message("third thing");
        assert!(result.should_escalate);
        assert_eq!(result.trigger, Some(EscalationTrigger::Turns));
    }

    #[test]
    fn test_repeated_question() {
        let mut d = detector();
        d.check_user_message("where is my order number five");
        d.check_user_message("where is my order number five");
        let result = d.check_user_message("where is my order number five");
        assert!(result.should_escalate);
        assert_eq!(result.trigger, Some(EscalationTrigger::Repeated));
    }

    #[test]
    fn test_distinct_messages_do_not_repeat_trigger() {
        let mut d = detector();
        assert!(!d.check_user_message("what time do you open").should_escalate);
        assert!(!d.check_user_message("can I change my address").should_escalate);
        assert!(!d.check_user_message("what is the refund policy").should_escalate);
    }

    #[test]
    fn test_similarity_metric() {
        let same = vec!["where is my order".to_string(); 3];
        assert!(messages_are_similar(&same, 0.6));

        let different = vec![
            "where is my order".to_string(),
            "completely different words here".to_string(),
            "yet another unrelated utterance".to_string(),
        ];
        assert!(!messages_are_similar(&different, 0.6));
    }

    #[test]
    fn test_reset() {
        let mut d = detector();
        d.check_dtmf("0");
        d.reset();
        assert_eq!(d.turn_count(), 0);
        assert!(d.check_dtmf("0").should_escalate, "reset unlatches the detector");
    }
}
