//! Label resolution: one optional category label plus one action label.
//!
//! Category precedence:
//! 1. classifier `matched_label`, if it is in the vocabulary
//! 2. classifier category proposal, if it is in the vocabulary
//! 3. the best matching rule's `label_to_apply`
//! 4. a brand-new classifier label, only when no rule matched at all
//!
//! Vocabulary membership ignores case; the vocabulary's spelling is kept.

use serde::{Deserialize, Serialize};

use crate::pipeline::types::{
    ClassifierResult, DEFAULT_CATEGORY, LABEL_MANUAL_REVIEW, LABEL_NOTHING_TO_DO, LABEL_RESPOND,
    Rule, is_action_label,
};

/// Which rule labels count as existing vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VocabularyPolicy {
    /// Labels of active and inactive rules.
    #[default]
    AllRules,
    ActiveRulesOnly,
}

/// Deduplicated label vocabulary for one owner.
///
/// Union of rule labels (per `policy`), previously applied category labels
/// and the built-in review category. First spelling seen wins.
pub fn build_vocabulary(rules: &[Rule], applied: &[String], policy: VocabularyPolicy) -> Vec<String> {
    let rule_labels = rules
        .iter()
        .filter(|r| policy == VocabularyPolicy::AllRules || r.is_active)
        .filter_map(|r| r.label_to_apply.as_deref());

    let mut vocabulary: Vec<String> = Vec::new();
    for label in rule_labels
        .chain(applied.iter().map(String::as_str))
        .chain(std::iter::once(DEFAULT_CATEGORY))
    {
        let label = label.trim();
        if label.is_empty() || is_action_label(label) {
            continue;
        }
        if lookup(&vocabulary, label).is_none() {
            vocabulary.push(label.to_string());
        }
    }
    vocabulary
}

fn lookup<'a>(vocabulary: &'a [String], label: &str) -> Option<&'a str> {
    let label = label.trim().to_lowercase();
    vocabulary
        .iter()
        .find(|v| v.to_lowercase() == label)
        .map(String::as_str)
}

/// How the category label was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "label", rename_all = "snake_case")]
pub enum CategoryResolution {
    /// Classifier's matched label, found in the vocabulary.
    Matched(String),
    /// Classifier's category proposal, found in the vocabulary.
    Proposed(String),
    /// Best matching rule's label.
    RuleFallback(String),
    /// New label from the classifier; no rule matched.
    Suggested(String),
    None,
}

impl CategoryResolution {
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Matched(l) | Self::Proposed(l) | Self::RuleFallback(l) | Self::Suggested(l) => {
                Some(l)
            }
            Self::None => None,
        }
    }

    /// Label to record as a pending suggestion.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Suggested(l) => Some(l),
            _ => None,
        }
    }
}

/// Resolve the category label.
///
/// `best_rule` is the lowest-order matching rule, `None` when nothing matched.
pub fn resolve_category(
    result: &ClassifierResult,
    vocabulary: &[String],
    best_rule: Option<&Rule>,
) -> CategoryResolution {
    if let Some(label) = result.matched_label.as_deref().and_then(|l| lookup(vocabulary, l)) {
        return CategoryResolution::Matched(label.to_string());
    }
    if let Some(label) = result.category.as_deref().and_then(|l| lookup(vocabulary, l)) {
        return CategoryResolution::Proposed(label.to_string());
    }
    if let Some(rule) = best_rule {
        return match rule.label_to_apply.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => CategoryResolution::RuleFallback(label.to_string()),
            _ => CategoryResolution::None,
        };
    }
    if result.fallback {
        return CategoryResolution::None;
    }
    [&result.suggested_label, &result.category, &result.matched_label]
        .into_iter()
        .flatten()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && !is_action_label(l))
        .map(|l| CategoryResolution::Suggested(l.to_string()))
        .unwrap_or(CategoryResolution::None)
}

/// Map a free-form action hint onto an action label.
pub fn map_suggested_action(hint: &str) -> Option<&'static str> {
    let hint = hint.to_lowercase();
    if ["reply", "urgent", "respond"].iter().any(|k| hint.contains(k)) {
        Some(LABEL_RESPOND)
    } else if ["review", "forward"].iter().any(|k| hint.contains(k)) {
        Some(LABEL_MANUAL_REVIEW)
    } else if ["archive", "ignore"].iter().any(|k| hint.contains(k)) {
        Some(LABEL_NOTHING_TO_DO)
    } else {
        None
    }
}

/// Action label: the proposal verbatim, else the mapped hint, else manual review.
pub fn resolve_action_label(result: &ClassifierResult) -> String {
    if let Some(label) = result.action_label.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        return label.to_string();
    }
    result
        .suggested_action
        .as_deref()
        .and_then(map_suggested_action)
        .unwrap_or(LABEL_MANUAL_REVIEW)
        .to_string()
}

/// Final ordered label list: `[category?, action]`, never empty.
pub fn final_labels(category: Option<&str>, action: &str) -> Vec<String> {
    let labels: Vec<String> = [category, Some(action)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if labels.is_empty() {
        vec![LABEL_MANUAL_REVIEW.to_string()]
    } else {
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> ClassifierResult {
        let mut r = ClassifierResult::fallback("");
        r.fallback = false;
        r.category = None;
        r.action_label = None;
        r
    }

    fn vocab(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn vocabulary_policy_controls_inactive_rules() {
        let active = Rule::new("o", Some("Work".into()));
        let mut inactive = Rule::new("o", Some("Old".into()));
        inactive.is_active = false;
        let rules = vec![active, inactive];
        let applied = vec!["work".to_string(), "Travel".to_string()];

        let all = build_vocabulary(&rules, &applied, VocabularyPolicy::AllRules);
        assert_eq!(all, vec!["Work", "Old", "Travel", DEFAULT_CATEGORY]);

        let active_only = build_vocabulary(&rules, &applied, VocabularyPolicy::ActiveRulesOnly);
        assert_eq!(active_only, vec!["Work", "Travel", DEFAULT_CATEGORY]);
    }

    #[test]
    fn matched_label_wins() {
        let mut r = result();
        r.matched_label = Some("work".into());
        r.category = Some("Travel".into());
        let res = resolve_category(&r, &vocab(&["Work", "Travel"]), None);
        assert_eq!(res, CategoryResolution::Matched("Work".into()));
    }

    #[test]
    fn category_in_vocabulary_is_proposed() {
        let mut r = result();
        r.matched_label = Some("Unknown".into());
        r.category = Some("Travel".into());
        let res = resolve_category(&r, &vocab(&["Travel"]), None);
        assert_eq!(res, CategoryResolution::Proposed("Travel".into()));
    }

    #[test]
    fn rule_label_overrides_unknown_proposal() {
        let mut r = result();
        r.category = Some("Brand New".into());
        let rule = Rule::new("o", Some("Invoices".into()));
        let res = resolve_category(&r, &vocab(&["Invoices"]), Some(&rule));
        assert_eq!(res, CategoryResolution::RuleFallback("Invoices".into()));
        assert!(res.suggestion().is_none());
    }

    #[test]
    fn matched_rule_without_label_suggests_nothing() {
        let mut r = result();
        r.suggested_label = Some("Brand New".into());
        let rule = Rule::new("o", None);
        assert_eq!(resolve_category(&r, &[], Some(&rule)), CategoryResolution::None);
    }

    #[test]
    fn new_label_suggested_when_no_rule_matched() {
        let mut r = result();
        r.category = Some("Finance".into());
        let res = resolve_category(&r, &vocab(&["Work"]), None);
        assert_eq!(res, CategoryResolution::Suggested("Finance".into()));
        assert_eq!(res.suggestion(), Some("Finance"));
        assert_eq!(res.label(), Some("Finance"));
    }

    #[test]
    fn action_label_prefers_proposal_then_hint() {
        let mut r = result();
        r.action_label = Some("Actions/Custom".into());
        assert_eq!(resolve_action_label(&r), "Actions/Custom");

        r.action_label = None;
        r.suggested_action = Some("Please reply soon".into());
        assert_eq!(resolve_action_label(&r), LABEL_RESPOND);

        r.suggested_action = Some("forward to accounting".into());
        assert_eq!(resolve_action_label(&r), LABEL_MANUAL_REVIEW);

        r.suggested_action = Some("archive".into());
        assert_eq!(resolve_action_label(&r), LABEL_NOTHING_TO_DO);

        r.suggested_action = None;
        assert_eq!(resolve_action_label(&r), LABEL_MANUAL_REVIEW);
    }

    #[test]
    fn final_labels_order_and_fallback() {
        assert_eq!(
            final_labels(Some("Finance"), LABEL_NOTHING_TO_DO),
            vec!["Finance".to_string(), LABEL_NOTHING_TO_DO.to_string()]
        );
        assert_eq!(final_labels(None, LABEL_RESPOND), vec![LABEL_RESPOND.to_string()]);
        assert_eq!(final_labels(None, " "), vec![LABEL_MANUAL_REVIEW.to_string()]);
    }
}
