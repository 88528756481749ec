//! Deterministic rule matching.
//!
//! A rule matches when its sender pattern (if any) matches the sender
//! address and its keyword terms pass:
//! - any `-term` found in subject or body excludes the rule
//! - otherwise at least one positive term must be present, if there are any
//! - no pattern and no keywords matches everything
//!
//! Matching is case-insensitive throughout. Rules with an invalid sender
//! regex are skipped with a warning rather than failing the message.

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::pipeline::types::{InboundMessage, Rule};

/// A rule with its sender regex and keyword terms prepared for matching.
#[derive(Debug, Clone)]
struct CompiledRule {
    rule: Rule,
    sender: Option<Regex>,
    positive: Vec<String>,
    negative: Vec<String>,
}

impl CompiledRule {
    fn compile(rule: Rule) -> Option<Self> {
        let sender = match rule.sender_pattern.as_deref().map(str::trim) {
            Some(pattern) if !pattern.is_empty() => {
                match RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(
                            rule_id = %rule.id,
                            pattern = %pattern,
                            error = %e,
                            "Invalid sender pattern, skipping rule"
                        );
                        return None;
                    }
                }
            }
            _ => None,
        };

        let mut positive = Vec::new();
        let mut negative = Vec::new();
        for term in &rule.keywords {
            let term = term.trim();
            if let Some(stripped) = term.strip_prefix('-') {
                let stripped = stripped.trim();
                if !stripped.is_empty() {
                    negative.push(stripped.to_lowercase());
                }
            } else if !term.is_empty() {
                positive.push(term.to_lowercase());
            }
        }

        Some(Self {
            rule,
            sender,
            positive,
            negative,
        })
    }

    fn matches(&self, sender: &str, text_lower: &str) -> bool {
        if let Some(ref re) = self.sender
            && !re.is_match(sender)
        {
            return false;
        }
        if self.negative.iter().any(|t| text_lower.contains(t.as_str())) {
            return false;
        }
        self.positive.is_empty() || self.positive.iter().any(|t| text_lower.contains(t.as_str()))
    }
}

/// Matches messages against one owner's active rules.
pub struct RulesEngine {
    rules: Vec<CompiledRule>,
}

impl RulesEngine {
    /// Build an engine from rules in insertion order.
    ///
    /// Inactive rules are dropped. The result is stably sorted by
    /// `rule_order`, so equal orders keep insertion order.
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .filter(|r| r.is_active)
            .filter_map(CompiledRule::compile)
            .collect();
        compiled.sort_by_key(|c| c.rule.rule_order);
        Self { rules: compiled }
    }

    /// An engine with no rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Matching rules, best (lowest `rule_order`) first.
    pub fn evaluate(&self, message: &InboundMessage) -> Vec<&Rule> {
        let text_lower = message.matching_text().to_lowercase();
        let matched: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|c| c.matches(&message.sender, &text_lower))
            .map(|c| &c.rule)
            .collect();
        debug!(
            message_id = %message.message_id,
            candidates = self.rules.len(),
            matched = matched.len(),
            "Rules evaluated"
        );
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(sender: &str, subject: &str, body: &str) -> InboundMessage {
        InboundMessage::new("owner", "m-1", sender, subject, body)
    }

    fn rule(label: &str, order: i64) -> Rule {
        let mut r = Rule::new("owner", Some(label.to_string()));
        r.rule_order = order;
        r
    }

    #[test]
    fn empty_rules_match_nothing() {
        let engine = RulesEngine::empty();
        assert!(engine.evaluate(&make_message("a@b.com", "s", "b")).is_empty());
    }

    #[test]
    fn rule_without_conditions_matches_everything() {
        let engine = RulesEngine::new(vec![rule("All", 0)]);
        assert_eq!(engine.evaluate(&make_message("x@y.z", "", "")).len(), 1);
    }

    #[test]
    fn sender_pattern_is_case_insensitive() {
        let mut r = rule("VIP", 0);
        r.sender_pattern = Some(r"@vip\.example\.com".into());
        let engine = RulesEngine::new(vec![r]);
        assert_eq!(
            engine
                .evaluate(&make_message("CEO@VIP.Example.com", "hi", "b"))
                .len(),
            1
        );
        assert!(engine.evaluate(&make_message("ceo@other.com", "hi", "b")).is_empty());
    }

    #[test]
    fn invalid_regex_skips_rule() {
        let mut bad = rule("Bad", 0);
        bad.sender_pattern = Some("([unclosed".into());
        let engine = RulesEngine::new(vec![bad, rule("Good", 1)]);
        assert_eq!(engine.len(), 1);
        let matched = engine.evaluate(&make_message("a@b.com", "s", "b"));
        assert_eq!(matched[0].label_to_apply.as_deref(), Some("Good"));
    }

    #[test]
    fn positive_keyword_required_when_present() {
        let mut r = rule("Invoices", 0);
        r.keywords = vec!["invoice".into(), "facture".into()];
        let engine = RulesEngine::new(vec![r]);
        assert_eq!(engine.evaluate(&make_message("a@b.com", "Your FACTURE", "")).len(), 1);
        assert!(engine.evaluate(&make_message("a@b.com", "Lunch", "tomorrow")).is_empty());
    }

    #[test]
    fn negative_keyword_excludes_despite_positive_match() {
        let mut r = rule("Invoices", 0);
        r.keywords = vec!["invoice".into(), "-unsubscribe".into()];
        let engine = RulesEngine::new(vec![r]);
        let msg = make_message("a@b.com", "Invoice #4", "Click to Unsubscribe");
        assert!(engine.evaluate(&msg).is_empty());
    }

    #[test]
    fn negative_keyword_checked_against_subject_and_body() {
        for (subject, body) in [("promo inside", ""), ("", "a PROMO inside")] {
            let mut r = rule("Any", 0);
            r.keywords = vec!["-promo".into()];
            let engine = RulesEngine::new(vec![r]);
            assert!(engine.evaluate(&make_message("a@b.com", subject, body)).is_empty());
        }
    }

    #[test]
    fn inactive_rules_are_ignored() {
        let mut r = rule("Off", 0);
        r.is_active = false;
        let engine = RulesEngine::new(vec![r]);
        assert!(engine.is_empty());
    }

    #[test]
    fn ordered_by_rule_order_then_insertion() {
        let engine = RulesEngine::new(vec![
            rule("Third", 5),
            rule("First", 1),
            rule("SecondA", 3),
            rule("SecondB", 3),
        ]);
        let labels: Vec<_> = engine
            .evaluate(&make_message("a@b.com", "s", "b"))
            .iter()
            .map(|r| r.label_to_apply.clone().unwrap())
            .collect();
        assert_eq!(labels, vec!["First", "SecondA", "SecondB", "Third"]);
    }
}
