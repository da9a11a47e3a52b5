//! Auto-responder
//!
//! Answers a small safe subset of prompts without waking the user. Three
//! hard guards run before any rule is consulted, each an unconditional
//! block: permission prompts, destructive keywords, and the global pause
//! flag. Only then are enabled rules tried in id order; first match wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};

use crate::classify::{has_destructive_keyword, Classifier};
use crate::db::Store;
use crate::types::{AutoRule, MatchType};

/// Outcome of [`AutoResponder::decide`].
#[derive(Debug, Clone, PartialEq)]
pub struct AutoDecision {
    pub respond: bool,
    pub response: String,
    pub rule_id: Option<i64>,
    /// Why the responder declined, for logs and the audit trail
    pub block_reason: Option<String>,
}

impl AutoDecision {
    fn blocked(reason: &str) -> Self {
        Self {
            respond: false,
            response: String::new(),
            rule_id: None,
            block_reason: Some(reason.to_string()),
        }
    }

    fn matched(rule: &AutoRule) -> Self {
        Self {
            respond: true,
            response: rule.response.clone(),
            rule_id: Some(rule.id),
            block_reason: None,
        }
    }
}

/// Matches prompts against stored rules and answers when safe.
pub struct AutoResponder {
    store: Arc<Store>,
    classifier: Classifier,
    paused: AtomicBool,
}

impl AutoResponder {
    pub fn new(store: Arc<Store>, enabled: bool) -> Self {
        Self {
            store,
            classifier: Classifier::new(),
            paused: AtomicBool::new(!enabled),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Decide whether to answer `text`, against an explicit rule list.
    /// Guards run in a fixed order; each is a hard block.
    pub fn decide(&self, text: &str, rules: &[AutoRule]) -> AutoDecision {
        if self.classifier.is_permission_prompt(text) {
            return AutoDecision::blocked("permission prompt requires manual approval");
        }
        if has_destructive_keyword(text) {
            return AutoDecision::blocked("destructive keyword detected");
        }
        if self.is_paused() {
            return AutoDecision::blocked("auto-responder paused");
        }

        for rule in rules {
            if !rule.enabled {
                continue;
            }
            if Self::matches(text, rule) {
                return AutoDecision::matched(rule);
            }
        }
        AutoDecision::blocked("no rule")
    }

    /// Decide against the stored rule set and record the hit on a match.
    pub fn check_and_respond(&self, text: &str) -> AutoDecision {
        let rules = match self.store.get_rules(true) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "Failed to load auto-rules");
                return AutoDecision::blocked("rule load failed");
            }
        };
        let decision = self.decide(text, &rules);
        if let Some(rule_id) = decision.rule_id {
            if let Err(e) = self.store.increment_rule_hit(rule_id) {
                warn!(rule_id, error = %e, "Failed to record rule hit");
            }
            info!(
                rule_id,
                response = %decision.response,
                "Auto-responding"
            );
        }
        decision
    }

    fn matches(text: &str, rule: &AutoRule) -> bool {
        match rule.match_type {
            MatchType::Exact => text.trim() == rule.pattern.trim(),
            MatchType::Contains => text
                .to_lowercase()
                .contains(&rule.pattern.to_lowercase()),
            MatchType::Regex => match Regex::new(&rule.pattern) {
                Ok(re) => re.is_match(text),
                Err(_) => {
                    // Insertion-time validation should make this unreachable.
                    warn!(rule_id = rule.id, pattern = %rule.pattern, "Invalid regex in rule");
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, pattern: &str, response: &str, match_type: MatchType) -> AutoRule {
        AutoRule {
            id,
            pattern: pattern.to_string(),
            response: response.to_string(),
            match_type,
            enabled: true,
            hit_count: 0,
            created_at: String::new(),
        }
    }

    fn responder() -> AutoResponder {
        AutoResponder::new(Arc::new(Store::in_memory().unwrap()), true)
    }

    #[test]
    fn test_simple_prompt_matches() {
        let responder = responder();
        let rules = vec![rule(1, "Continue? (Y/n)", "y", MatchType::Contains)];
        let decision = responder.decide("Continue? (Y/n)\n", &rules);
        assert!(decision.respond);
        assert_eq!(decision.response, "y");
        assert_eq!(decision.rule_id, Some(1));
    }

    #[test]
    fn test_permission_prompt_never_answered() {
        let responder = responder();
        // A rule that would match, but the permission guard fires first.
        let rules = vec![rule(1, "(y/n)", "y", MatchType::Contains)];
        let decision = responder.decide("Claude wants to run: cargo build\nAllow? (y/n)", &rules);
        assert!(!decision.respond);
        assert!(decision.block_reason.unwrap().contains("permission"));
    }

    #[test]
    fn test_destructive_keyword_blocks_all_rules() {
        let responder = responder();
        let rules = vec![rule(1, "(y/n)", "y", MatchType::Contains)];
        let decision = responder.decide("Delete all records? (y/n)", &rules);
        assert!(!decision.respond);
        assert!(decision.block_reason.unwrap().contains("destructive"));
    }

    #[test]
    fn test_pause_flag_blocks() {
        let responder = responder();
        let rules = vec![rule(1, "Continue?", "y", MatchType::Contains)];
        responder.pause();
        let decision = responder.decide("Continue?", &rules);
        assert!(!decision.respond);
        responder.resume();
        assert!(responder.decide("Continue?", &rules).respond);
    }

    #[test]
    fn test_first_matching_rule_wins_in_id_order() {
        let responder = responder();
        let rules = vec![
            rule(1, "continue", "first", MatchType::Contains),
            rule(2, "Continue?", "second", MatchType::Contains),
        ];
        let decision = responder.decide("Continue?", &rules);
        assert_eq!(decision.response, "first");
    }

    #[test]
    fn test_disabled_rules_skipped() {
        let responder = responder();
        let mut disabled = rule(1, "Continue?", "y", MatchType::Contains);
        disabled.enabled = false;
        let decision = responder.decide("Continue?", &[disabled]);
        assert!(!decision.respond);
        assert_eq!(decision.block_reason.as_deref(), Some("no rule"));
    }

    #[test]
    fn test_match_types() {
        let responder = responder();

        let exact = rule(1, "y/n", "y", MatchType::Exact);
        assert!(responder.decide("  y/n  ", &[exact.clone()]).respond);
        assert!(!responder.decide("ask y/n now", &[exact]).respond);

        let re = rule(2, r"retry \d+ of \d+", "", MatchType::Regex);
        assert!(responder.decide("retry 2 of 5", &[re.clone()]).respond);
        assert!(!responder.decide("retry later", &[re]).respond);
    }

    #[test]
    fn test_check_and_respond_records_hit() {
        let store = Arc::new(Store::in_memory().unwrap());
        let id = store.add_rule("Overwrite log?", "n", MatchType::Contains).unwrap();
        let responder = AutoResponder::new(store.clone(), true);

        // "Overwrite" is a destructive keyword: blocked, no hit.
        let decision = responder.check_and_respond("Overwrite log? (y/n)");
        assert!(!decision.respond);

        let safe_id = store.add_rule("Proceed with fetch?", "y", MatchType::Contains).unwrap();
        let decision = responder.check_and_respond("Proceed with fetch?");
        assert!(decision.respond);
        assert_eq!(decision.rule_id, Some(safe_id));

        let rules = store.get_rules(false).unwrap();
        assert_eq!(rules.iter().find(|r| r.id == safe_id).unwrap().hit_count, 1);
        assert_eq!(rules.iter().find(|r| r.id == id).unwrap().hit_count, 0);
    }
}
