//! Action decision: which side effects to run for one message.

use serde::{Deserialize, Serialize};

use crate::pipeline::types::{ClassifierResult, ResponseKind, Rule};

/// Default urgent-notification threshold.
pub const DEFAULT_URGENT_THRESHOLD: u8 = 8;

/// Why a draft or auto-reply was withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suppression {
    /// The matching rule explicitly disabled the requested response kind.
    RuleDisabled,
    Newsletter,
    Marketing,
    Phishing,
    Spam,
}

/// Side effects chosen for one message.
///
/// `create_draft` and `auto_reply` are never both set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDecision {
    pub apply_labels: bool,
    pub create_draft: bool,
    pub auto_reply: bool,
    pub create_calendar_event: bool,
    pub notify_urgent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<Suppression>,
}

/// Everything the decision depends on.
pub struct DecisionInput<'a> {
    pub labels: &'a [String],
    /// Resolved category label.
    pub category: Option<&'a str>,
    pub score: u8,
    pub classification: &'a ClassifierResult,
    /// Matching rules, best first.
    pub matched: &'a [&'a Rule],
    pub urgent_threshold: u8,
}

/// Whether `category` names `kind`, either whole or as one `/` segment.
fn category_is(category: &str, kind: &str) -> bool {
    category.split('/').any(|segment| {
        let segment = segment.trim().to_lowercase();
        segment == kind || segment.strip_suffix('s') == Some(kind)
    })
}

/// Content suppression from the resolved and proposed categories.
///
/// Each exclusion flag defaults to true, including when no rule matched.
fn content_suppression(categories: &[&str], best: Option<&Rule>) -> Option<Suppression> {
    let exclude_newsletters = best.and_then(|r| r.exclude_newsletters).unwrap_or(true);
    let exclude_marketing = best.and_then(|r| r.exclude_marketing).unwrap_or(true);

    if exclude_newsletters && categories.iter().any(|c| category_is(c, "newsletter")) {
        return Some(Suppression::Newsletter);
    }
    if exclude_marketing && categories.iter().any(|c| category_is(c, "marketing")) {
        return Some(Suppression::Marketing);
    }
    None
}

/// Decide the side effects for one message.
pub fn decide(input: &DecisionInput<'_>) -> ActionDecision {
    let c = input.classification;
    let best = input.matched.first().copied();
    let mut decision = ActionDecision {
        apply_labels: !input.labels.is_empty(),
        ..Default::default()
    };

    match c.requested_response() {
        ResponseKind::Draft => decision.create_draft = true,
        ResponseKind::AutoReply => decision.auto_reply = true,
        ResponseKind::None => {}
    }

    if let Some(rule) = best {
        if decision.create_draft && rule.create_draft == Some(false) {
            decision.create_draft = false;
            decision.suppressed = Some(Suppression::RuleDisabled);
        }
        if decision.auto_reply && rule.auto_reply == Some(false) {
            decision.auto_reply = false;
            decision.suppressed = Some(Suppression::RuleDisabled);
        }
    }

    let categories: Vec<&str> = input
        .category
        .into_iter()
        .chain(c.category.as_deref())
        .collect();
    let threat = if c.is_phishing {
        Some(Suppression::Phishing)
    } else if c.is_spam {
        Some(Suppression::Spam)
    } else {
        None
    };

    if let Some(reason) = threat.or_else(|| content_suppression(&categories, best)) {
        decision.create_draft = false;
        decision.auto_reply = false;
        decision.suppressed = Some(reason);
    } else if best.is_some_and(|r| r.create_draft == Some(true))
        && !decision.create_draft
        && !decision.auto_reply
    {
        decision.create_draft = true;
    }

    decision.create_calendar_event = c.needs_calendar
        && c.calendar.as_ref().and_then(|p| p.to_event()).is_some();

    decision.notify_urgent = input.score >= input.urgent_threshold
        || input.matched.iter().any(|r| r.notify_urgent == Some(true))
        || c.notify_urgent;

    decision
}
