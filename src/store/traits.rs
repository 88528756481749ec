//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{CalendarEvent, Correction, CorrectionStatus, ProcessingOutcome, Rule};

/// A stored reply draft awaiting approval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDraft {
    pub id: String,
    pub owner_id: String,
    pub message_id: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// `draft` or `sent`.
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A calendar event created by the local calendar surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub id: String,
    pub owner_id: String,
    pub event: CalendarEvent,
    pub created_at: DateTime<Utc>,
}

/// One row of the activity log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub owner_id: String,
    pub message_id: Option<String>,
    /// e.g. `calendar_failed`, `reinforcement_applied`, `notification`.
    pub kind: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        owner_id: impl Into<String>,
        message_id: Option<&str>,
        kind: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            message_id: message_id.map(str::to_string),
            kind: kind.into(),
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }
}

/// A single LLM call to record.
#[derive(Debug, Clone)]
pub struct LlmCallRecord<'a> {
    pub owner_id: &'a str,
    pub message_id: Option<&'a str>,
    pub provider: &'a str,
    pub model: &'a str,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
    /// `classify` or `interpret_feedback`.
    pub purpose: &'a str,
}

/// Aggregated LLM usage for one owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LlmCostSummary {
    pub total_cost: Decimal,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub call_count: u64,
}

/// Backend-agnostic database trait covering rules, outcomes and local surfaces.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    /// All of an owner's rules, active or not, by `rule_order`, creation time, then insertion.
    async fn list_rules(&self, owner_id: &str) -> Result<Vec<Rule>, DatabaseError>;

    async fn get_rule(&self, owner_id: &str, id: Uuid) -> Result<Option<Rule>, DatabaseError>;

    /// First rule (by order) whose `label_to_apply` equals `label`, ignoring case.
    async fn find_rule_by_label(
        &self,
        owner_id: &str,
        label: &str,
    ) -> Result<Option<Rule>, DatabaseError>;

    async fn insert_rule(&self, rule: &Rule) -> Result<(), DatabaseError>;

    /// Overwrite every mutable column of a rule.
    async fn update_rule(&self, rule: &Rule) -> Result<(), DatabaseError>;

    async fn delete_rule(&self, owner_id: &str, id: Uuid) -> Result<bool, DatabaseError>;

    /// One past the owner's highest `rule_order` (0 when there are no rules).
    async fn next_rule_order(&self, owner_id: &str) -> Result<i64, DatabaseError>;

    /// Append a line to a rule's description in a single statement.
    async fn append_rule_description(
        &self,
        owner_id: &str,
        id: Uuid,
        line: &str,
    ) -> Result<(), DatabaseError>;

    /// Replace a rule's keyword list.
    async fn set_rule_keywords(
        &self,
        owner_id: &str,
        id: Uuid,
        keywords: &[String],
    ) -> Result<(), DatabaseError>;

    /// Set the sender pattern only if the rule has none. Returns whether it was set.
    async fn set_rule_sender_pattern_if_unset(
        &self,
        owner_id: &str,
        id: Uuid,
        pattern: &str,
    ) -> Result<bool, DatabaseError>;

    // ── Outcomes ────────────────────────────────────────────────────

    /// Insert or overwrite the outcome for `(owner_id, message_id)`.
    ///
    /// Correction fields of an existing row are preserved.
    async fn upsert_outcome(&self, outcome: &ProcessingOutcome) -> Result<(), DatabaseError>;

    async fn get_outcome(
        &self,
        owner_id: &str,
        message_id: &str,
    ) -> Result<Option<ProcessingOutcome>, DatabaseError>;

    async fn count_outcomes(&self, owner_id: &str) -> Result<i64, DatabaseError>;

    /// Replace an outcome's labels and set its correction state.
    async fn update_outcome_correction(
        &self,
        owner_id: &str,
        message_id: &str,
        labels: &[String],
        status: CorrectionStatus,
        reason: Option<&str>,
        summary: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Every distinct category label on the owner's outcomes, most recently used first.
    async fn applied_labels(&self, owner_id: &str) -> Result<Vec<String>, DatabaseError>;

    // ── Corrections ─────────────────────────────────────────────────

    async fn insert_correction(&self, correction: &Correction) -> Result<(), DatabaseError>;

    /// Most recent first.
    async fn recent_corrections(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<Correction>, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(
        &self,
        owner_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(
        &self,
        owner_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    // ── Local surfaces ──────────────────────────────────────────────

    /// Label id for `name`, creating the label on first use.
    async fn ensure_label(&self, owner_id: &str, name: &str) -> Result<String, DatabaseError>;

    /// Attach a label to a message; duplicates are ignored.
    async fn apply_label(
        &self,
        owner_id: &str,
        message_id: &str,
        label_id: &str,
    ) -> Result<(), DatabaseError>;

    /// Names of labels attached to a message.
    async fn message_labels(
        &self,
        owner_id: &str,
        message_id: &str,
    ) -> Result<Vec<String>, DatabaseError>;

    async fn insert_draft(&self, draft: &StoredDraft) -> Result<(), DatabaseError>;

    async fn list_drafts(&self, owner_id: &str) -> Result<Vec<StoredDraft>, DatabaseError>;

    async fn insert_event(&self, event: &StoredEvent) -> Result<(), DatabaseError>;

    async fn list_events(&self, owner_id: &str) -> Result<Vec<StoredEvent>, DatabaseError>;

    // ── Activity ────────────────────────────────────────────────────

    async fn record_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError>;

    /// Most recent first.
    async fn list_activity(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>, DatabaseError>;

    // ── LLM calls ───────────────────────────────────────────────────

    async fn record_llm_call(&self, record: &LlmCallRecord<'_>) -> Result<Uuid, DatabaseError>;

    async fn llm_cost_summary(&self, owner_id: &str) -> Result<LlmCostSummary, DatabaseError>;
}
