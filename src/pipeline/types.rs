//! Shared types for the triage pipeline.

use chrono::{DateTime, NaiveDateTime, Utc};
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::decision::ActionDecision;

// ── Label vocabulary ────────────────────────────────────────────────

/// Prefix carried by every action label.
pub const ACTION_PREFIX: &str = "Actions/";

/// Action label: the message needs a reply.
pub const LABEL_RESPOND: &str = "Actions/Répondre";

/// Action label: a human should look at the message.
pub const LABEL_MANUAL_REVIEW: &str = "Actions/Revue Manuelle";

/// Action label: nothing to do.
pub const LABEL_NOTHING_TO_DO: &str = "Actions/Rien à faire";

/// Category used when the classifier is unavailable.
pub const DEFAULT_CATEGORY: &str = "Needs Manual Review";

/// Whether a label is an internal action label (never pushed to the mailbox).
pub fn is_action_label(label: &str) -> bool {
    label.starts_with(ACTION_PREFIX)
}

// ── Inbound message ─────────────────────────────────────────────────

/// One inbound email, the unit of work.
///
/// `(owner_id, message_id)` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub owner_id: String,
    /// Provider-native message id.
    pub message_id: String,
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        owner_id: impl Into<String>,
        message_id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            message_id: message_id.into(),
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    /// Reject messages missing the fields the pipeline keys on.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.owner_id.trim().is_empty() {
            return Err(PipelineError::Input("owner_id is required".into()));
        }
        if self.message_id.trim().is_empty() {
            return Err(PipelineError::Input("message_id is required".into()));
        }
        if self.sender.trim().is_empty() {
            return Err(PipelineError::Input("sender is required".into()));
        }
        Ok(())
    }

    /// Text that keyword terms are matched against.
    pub fn matching_text(&self) -> String {
        format!("{}\n{}", self.subject, self.body)
    }

    /// Parse a raw RFC 822 message.
    ///
    /// The `Message-ID` header becomes the provider id. A message without a
    /// parseable `From` address or `Message-ID` is an input error.
    pub fn from_rfc822(owner_id: &str, raw: &[u8]) -> Result<Self, PipelineError> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| PipelineError::Input("unparseable RFC 822 message".into()))?;

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .ok_or_else(|| PipelineError::Input("message has no From address".into()))?;

        let message_id = parsed
            .message_id()
            .map(|s| s.to_string())
            .ok_or_else(|| PipelineError::Input("message has no Message-ID".into()))?;

        let subject = parsed.subject().unwrap_or_default().to_string();
        let body = parsed
            .body_text(0)
            .map(|t| t.to_string())
            .or_else(|| parsed.body_html(0).map(|h| h.to_string()))
            .unwrap_or_default();

        let received_at = parsed
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or_else(Utc::now);

        let message = Self {
            owner_id: owner_id.to_string(),
            message_id,
            sender,
            subject,
            body,
            received_at,
        };
        message.validate()?;
        Ok(message)
    }
}

// ── Rules ───────────────────────────────────────────────────────────

/// Priority tier carried by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Low,
    #[default]
    Medium,
    High,
}

impl PriorityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::str::FromStr for PriorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority tier: '{other}'")),
        }
    }
}

/// A user-owned automation rule.
///
/// Tri-state flags distinguish "unset" from "explicitly false".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub owner_id: String,
    /// Case-insensitive regex over the sender address.
    pub sender_pattern: Option<String>,
    /// Keyword terms; a leading `-` marks an exclusion term.
    pub keywords: Vec<String>,
    pub label_to_apply: Option<String>,
    pub priority: PriorityTier,
    pub create_draft: Option<bool>,
    pub auto_reply: Option<bool>,
    pub notify_urgent: Option<bool>,
    pub response_template: Option<String>,
    pub exclude_newsletters: Option<bool>,
    pub exclude_marketing: Option<bool>,
    pub is_active: bool,
    pub rule_order: i64,
    /// Append-only learning log.
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// A new active rule with every flag unset.
    pub fn new(owner_id: impl Into<String>, label_to_apply: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            sender_pattern: None,
            keywords: Vec::new(),
            label_to_apply,
            priority: PriorityTier::Medium,
            create_draft: None,
            auto_reply: None,
            notify_urgent: None,
            response_template: None,
            exclude_newsletters: None,
            exclude_marketing: None,
            is_active: true,
            rule_order: 0,
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Classifier result ───────────────────────────────────────────────

/// Kind of response the classifier wants sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    #[default]
    None,
    Draft,
    AutoReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// Event the classifier proposes to put on the calendar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalendarProposal {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub attendees: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Default event length when the proposal carries none.
pub const DEFAULT_EVENT_MINUTES: u32 = 60;

impl CalendarProposal {
    /// A concrete event, if the proposal has a title and a parseable start.
    pub fn to_event(&self) -> Option<CalendarEvent> {
        let title = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
        let start = parse_event_start(self.start.as_deref()?)?;
        Some(CalendarEvent {
            title: title.to_string(),
            start,
            duration_minutes: self
                .duration_minutes
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_EVENT_MINUTES),
            location: self.location.clone(),
            attendees: self.attendees.clone().unwrap_or_default(),
            description: self.description.clone(),
        })
    }
}

/// Accepts RFC 3339 or a naive `YYYY-MM-DD[ T]HH:MM[:SS]` (read as UTC).
fn parse_event_start(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|ndt| ndt.and_utc())
}

/// A calendar event ready for the calendar surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub title: String,
    pub start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub location: Option<String>,
    pub attendees: Vec<String>,
    pub description: Option<String>,
}

/// Parsed classifier output, stored verbatim on the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierResult {
    /// 1–10.
    pub urgency: u8,
    pub category: Option<String>,
    pub action_label: Option<String>,
    /// Free-form action hint, used when no action label was proposed.
    pub suggested_action: Option<String>,
    pub reasoning: String,
    pub is_phishing: bool,
    pub is_spam: bool,
    pub matched_label: Option<String>,
    pub suggested_label: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub needs_calendar: bool,
    pub calendar: Option<CalendarProposal>,
    pub notify_urgent: bool,
    pub needs_response: bool,
    pub response_kind: ResponseKind,
    pub response_reasoning: String,
    pub response_body: Option<String>,
    /// Set when this is the default result substituted for a failed call.
    #[serde(default)]
    pub fallback: bool,
}

impl ClassifierResult {
    /// The deterministic result used whenever the classifier fails.
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self {
            urgency: 5,
            category: Some(DEFAULT_CATEGORY.to_string()),
            action_label: Some(LABEL_MANUAL_REVIEW.to_string()),
            suggested_action: None,
            reasoning: reason.into(),
            is_phishing: false,
            is_spam: false,
            matched_label: None,
            suggested_label: None,
            sentiment: None,
            needs_calendar: false,
            calendar: None,
            notify_urgent: false,
            needs_response: false,
            response_kind: ResponseKind::None,
            response_reasoning: String::new(),
            response_body: None,
            fallback: true,
        }
    }

    /// Enforce the result's internal invariants.
    ///
    /// Blank strings become `None`, urgency is clamped, `matched_label`
    /// wins over `suggested_label`, and kind `none` clears the response need.
    pub fn normalize(mut self) -> Self {
        fn blank_to_none(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        self.urgency = self.urgency.clamp(1, 10);
        self.category = blank_to_none(self.category);
        self.action_label = blank_to_none(self.action_label);
        self.suggested_action = blank_to_none(self.suggested_action);
        self.matched_label = blank_to_none(self.matched_label);
        self.suggested_label = blank_to_none(self.suggested_label);
        self.response_body = blank_to_none(self.response_body);
        if self.matched_label.is_some() {
            self.suggested_label = None;
        }
        if self.response_kind == ResponseKind::None {
            self.needs_response = false;
        }
        self
    }

    /// Response kind to act on, if the classifier wants one.
    pub fn requested_response(&self) -> ResponseKind {
        if self.needs_response {
            self.response_kind
        } else {
            ResponseKind::None
        }
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// One side effect attempted for a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionRecord {
    LabelApplied { label: String },
    LabelFailed { label: String, error: String },
    DraftCreated { draft_id: String },
    DraftFailed { error: String },
    AutoReplySent { recipient: String },
    AutoReplyFailed { error: String },
    CalendarCreated { event_id: String },
    CalendarFailed { error: String },
    NotifySent,
    NotifyFailed { error: String },
}

impl ActionRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LabelApplied { .. } => "label_applied",
            Self::LabelFailed { .. } => "label_failed",
            Self::DraftCreated { .. } => "draft_created",
            Self::DraftFailed { .. } => "draft_failed",
            Self::AutoReplySent { .. } => "auto_reply_sent",
            Self::AutoReplyFailed { .. } => "auto_reply_failed",
            Self::CalendarCreated { .. } => "calendar_created",
            Self::CalendarFailed { .. } => "calendar_failed",
            Self::NotifySent => "notify_sent",
            Self::NotifyFailed { .. } => "notify_failed",
        }
    }

    /// Error text for failed entries.
    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::LabelFailed { error, .. }
            | Self::DraftFailed { error }
            | Self::AutoReplyFailed { error }
            | Self::CalendarFailed { error }
            | Self::NotifyFailed { error } => Some(error),
            _ => None,
        }
    }
}

/// Correction lifecycle of an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionStatus {
    #[default]
    None,
    /// A human changed the labels.
    Corrected,
    /// The correction was turned into a rule change.
    Applied,
}

impl CorrectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Corrected => "corrected",
            Self::Applied => "applied",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "corrected" => Self::Corrected,
            "applied" => Self::Applied,
            _ => Self::None,
        }
    }
}

/// Durable record of how one message was handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub owner_id: String,
    pub message_id: String,
    /// Category label first (if any), action label second.
    pub labels: Vec<String>,
    /// 1–10.
    pub priority: u8,
    pub classification: ClassifierResult,
    pub decision: ActionDecision,
    pub actions: Vec<ActionRecord>,
    pub draft_id: Option<String>,
    pub suggested_new_label: Option<String>,
    pub matched_rule_id: Option<Uuid>,
    pub correction_status: CorrectionStatus,
    pub correction_reason: Option<String>,
    pub correction_summary: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessingOutcome {
    /// First non-action label.
    pub fn category_label(&self) -> Option<&str> {
        category_of(&self.labels)
    }

    pub fn action_label(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| is_action_label(l))
            .map(String::as_str)
    }
}

/// First label in a set that is not an action label.
pub fn category_of(labels: &[String]) -> Option<&str> {
    labels
        .iter()
        .find(|l| !is_action_label(l))
        .map(String::as_str)
}

// ── Corrections ─────────────────────────────────────────────────────

/// A human label override on one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub id: Uuid,
    pub owner_id: String,
    pub message_id: String,
    pub old_label: String,
    pub new_label: String,
    /// Mandatory justification.
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Correction {
    pub fn new(
        owner_id: impl Into<String>,
        message_id: impl Into<String>,
        old_label: impl Into<String>,
        new_label: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            message_id: message_id.into(),
            old_label: old_label.into(),
            new_label: new_label.into(),
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }

    /// Label set after this correction is applied to `labels`.
    ///
    /// The old label is replaced in place. When it is absent, a new
    /// category replaces the current category (or is put first) and a new
    /// action label replaces the current action label.
    pub fn apply_to(&self, labels: &[String]) -> Vec<String> {
        let new = self.new_label.trim().to_string();
        if new.is_empty() {
            return labels.to_vec();
        }
        let mut out: Vec<String> = Vec::with_capacity(labels.len() + 1);
        if labels.iter().any(|l| *l == self.old_label) {
            for l in labels {
                if *l == self.old_label {
                    out.push(new.clone());
                } else if *l != new {
                    out.push(l.clone());
                }
            }
        } else if is_action_label(&new) {
            out.extend(labels.iter().filter(|l| !is_action_label(l)).cloned());
            out.push(new);
        } else {
            out.push(new.clone());
            out.extend(labels.iter().filter(|l| is_action_label(l)).cloned());
        }
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_missing_fields() {
        let mut msg = InboundMessage::new("owner", "m1", "a@b.com", "s", "b");
        assert!(msg.validate().is_ok());
        msg.sender = "  ".into();
        assert!(matches!(msg.validate(), Err(PipelineError::Input(_))));
        msg.sender = "a@b.com".into();
        msg.message_id.clear();
        assert!(matches!(msg.validate(), Err(PipelineError::Input(_))));
    }

    #[test]
    fn rfc822_message_is_parsed() {
        let raw = b"From: Alice <alice@example.com>\r\n\
To: me@example.com\r\n\
Subject: Lunch?\r\n\
Message-ID: <abc123@example.com>\r\n\
Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
\r\n\
Are you free tomorrow?\r\n";
        let msg = InboundMessage::from_rfc822("owner-1", raw).unwrap();
        assert_eq!(msg.sender, "alice@example.com");
        assert_eq!(msg.subject, "Lunch?");
        assert_eq!(msg.message_id, "abc123@example.com");
        assert!(msg.body.contains("free tomorrow"));
    }

    #[test]
    fn rfc822_without_from_is_input_error() {
        let raw = b"Subject: hi\r\nMessage-ID: <x@y>\r\n\r\nbody\r\n";
        assert!(matches!(
            InboundMessage::from_rfc822("o", raw),
            Err(PipelineError::Input(_))
        ));
    }

    #[test]
    fn calendar_proposal_requires_title_and_start() {
        let mut p = CalendarProposal {
            title: Some("Sync".into()),
            start: Some("2025-07-01T10:00:00Z".into()),
            ..Default::default()
        };
        let event = p.to_event().unwrap();
        assert_eq!(event.duration_minutes, DEFAULT_EVENT_MINUTES);

        p.start = Some("2025-07-01 14:30".into());
        assert!(p.to_event().is_some());

        p.start = Some("next tuesday".into());
        assert!(p.to_event().is_none());

        p.start = Some("2025-07-01T10:00:00Z".into());
        p.title = Some(" ".into());
        assert!(p.to_event().is_none());
    }

    #[test]
    fn normalize_enforces_invariants() {
        let mut r = ClassifierResult::fallback("x");
        r.fallback = false;
        r.urgency = 42;
        r.matched_label = Some("Work".into());
        r.suggested_label = Some("Other".into());
        r.needs_response = true;
        r.response_kind = ResponseKind::None;
        r.category = Some("   ".into());
        let r = r.normalize();
        assert_eq!(r.urgency, 10);
        assert!(r.suggested_label.is_none());
        assert!(!r.needs_response);
        assert!(r.category.is_none());
    }

    #[test]
    fn action_record_serializes_tagged() {
        let json = serde_json::to_value(ActionRecord::CalendarFailed {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "calendar_failed");
        assert_eq!(json["error"], "boom");
        assert_eq!(
            serde_json::to_value(ActionRecord::NotifySent).unwrap()["kind"],
            "notify_sent"
        );
    }

    #[test]
    fn correction_replaces_old_label() {
        let labels = vec!["A".to_string(), LABEL_RESPOND.to_string()];
        let c = Correction::new("o", "m", "A", "B", "B is correct when X");
        assert_eq!(c.apply_to(&labels), vec!["B".to_string(), LABEL_RESPOND.to_string()]);
    }

    #[test]
    fn correction_with_unknown_old_label_replaces_category() {
        let labels = vec!["A".to_string(), LABEL_RESPOND.to_string()];
        let c = Correction::new("o", "m", "Z", "B", "why");
        assert_eq!(c.apply_to(&labels), vec!["B".to_string(), LABEL_RESPOND.to_string()]);

        let c = Correction::new("o", "m", "Z", LABEL_NOTHING_TO_DO, "why");
        assert_eq!(
            c.apply_to(&labels),
            vec!["A".to_string(), LABEL_NOTHING_TO_DO.to_string()]
        );
    }

    #[test]
    fn category_of_skips_action_labels() {
        let labels = vec![LABEL_RESPOND.to_string(), "Work".to_string()];
        assert_eq!(category_of(&labels), Some("Work"));
        assert_eq!(category_of(&[LABEL_RESPOND.to_string()]), None);
    }
}
