//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as RFC 3339; structured fields (keywords, labels, classification) are
//! stored as JSON text.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{
    CalendarEvent, Correction, CorrectionStatus, PriorityTier, ProcessingOutcome, Rule,
    category_of,
};
use crate::store::migrations;
use crate::store::traits::{
    ActivityEntry, Database, LlmCallRecord, LlmCostSummary, StoredDraft, StoredEvent,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Tri-state flag to a nullable INTEGER.
fn opt_bool(b: Option<bool>) -> libsql::Value {
    match b {
        Some(b) => libsql::Value::Integer(i64::from(b)),
        None => libsql::Value::Null,
    }
}

fn read_opt_bool(row: &libsql::Row, idx: i32) -> Option<bool> {
    row.get::<i64>(idx).ok().map(|v| v != 0)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const RULE_COLUMNS: &str = "id, owner_id, sender_pattern, keywords, label_to_apply, priority, \
    create_draft, auto_reply, notify_urgent, response_template, exclude_newsletters, \
    exclude_marketing, is_active, rule_order, description, created_at, updated_at";

const OUTCOME_COLUMNS: &str = "owner_id, message_id, labels, priority, classification, decision, \
    actions, draft_id, suggested_new_label, matched_rule_id, correction_status, \
    correction_reason, correction_summary, processed_at";

const CORRECTION_COLUMNS: &str =
    "id, owner_id, message_id, old_label, new_label, reason, created_at";

fn row_to_rule(row: &libsql::Row) -> Result<Rule, DatabaseError> {
    let map = query_err("row_to_rule");
    let id_str: String = row.get(0).map_err(&map)?;
    let keywords_str: String = row.get::<String>(3).unwrap_or_else(|_| "[]".into());
    let priority_str: String = row.get::<String>(5).unwrap_or_default();
    let created_str: String = row.get(15).map_err(&map)?;
    let updated_str: String = row.get(16).map_err(&map)?;

    Ok(Rule {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        owner_id: row.get(1).map_err(&map)?,
        sender_pattern: row.get::<String>(2).ok(),
        keywords: serde_json::from_str(&keywords_str).unwrap_or_default(),
        label_to_apply: row.get::<String>(4).ok(),
        priority: PriorityTier::from_str(&priority_str).unwrap_or_default(),
        create_draft: read_opt_bool(row, 6),
        auto_reply: read_opt_bool(row, 7),
        notify_urgent: read_opt_bool(row, 8),
        response_template: row.get::<String>(9).ok(),
        exclude_newsletters: read_opt_bool(row, 10),
        exclude_marketing: read_opt_bool(row, 11),
        is_active: row.get::<i64>(12).map(|v| v != 0).unwrap_or(true),
        rule_order: row.get::<i64>(13).unwrap_or(0),
        description: row.get::<String>(14).unwrap_or_default(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_outcome(row: &libsql::Row) -> Result<ProcessingOutcome, DatabaseError> {
    let map = query_err("row_to_outcome");
    let labels_str: String = row.get(2).map_err(&map)?;
    let classification_str: String = row.get(4).map_err(&map)?;
    let decision_str: String = row.get(5).map_err(&map)?;
    let actions_str: String = row.get::<String>(6).unwrap_or_else(|_| "[]".into());
    let status_str: String = row.get::<String>(10).unwrap_or_default();
    let processed_str: String = row.get(13).map_err(&map)?;

    Ok(ProcessingOutcome {
        owner_id: row.get(0).map_err(&map)?,
        message_id: row.get(1).map_err(&map)?,
        labels: from_json(&labels_str, "outcome labels")?,
        priority: row.get::<i64>(3).map_err(&map)?.clamp(1, 10) as u8,
        classification: from_json(&classification_str, "outcome classification")?,
        decision: from_json(&decision_str, "outcome decision")?,
        actions: serde_json::from_str(&actions_str).unwrap_or_default(),
        draft_id: row.get::<String>(7).ok(),
        suggested_new_label: row.get::<String>(8).ok(),
        matched_rule_id: row
            .get::<String>(9)
            .ok()
            .and_then(|s| Uuid::parse_str(&s).ok()),
        correction_status: CorrectionStatus::parse(&status_str),
        correction_reason: row.get::<String>(11).ok(),
        correction_summary: row.get::<String>(12).ok(),
        processed_at: parse_datetime(&processed_str),
    })
}

fn row_to_correction(row: &libsql::Row) -> Result<Correction, DatabaseError> {
    let map = query_err("row_to_correction");
    let id_str: String = row.get(0).map_err(&map)?;
    let created_str: String = row.get(6).map_err(&map)?;
    Ok(Correction {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        owner_id: row.get(1).map_err(&map)?,
        message_id: row.get(2).map_err(&map)?,
        old_label: row.get(3).map_err(&map)?,
        new_label: row.get(4).map_err(&map)?,
        reason: row.get(5).map_err(&map)?,
        created_at: parse_datetime(&created_str),
    })
}

async fn collect_rules(mut rows: libsql::Rows) -> Result<Vec<Rule>, DatabaseError> {
    let mut rules = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("collect_rules"))? {
        rules.push(row_to_rule(&row)?);
    }
    Ok(rules)
}

async fn parse_cost_summary_row(rows: &mut libsql::Rows) -> Result<LlmCostSummary, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => {
            // TOTAL() always returns f64 in SQLite/libsql
            let cost_f64: f64 = row.get(0).unwrap_or(0.0);
            let total_cost =
                Decimal::from_str(&format!("{cost_f64:.10}")).unwrap_or(Decimal::ZERO);
            let input_tokens: f64 = row.get(1).unwrap_or(0.0);
            let output_tokens: f64 = row.get(2).unwrap_or(0.0);
            let call_count = row.get::<i64>(3).unwrap_or(0);

            Ok(LlmCostSummary {
                total_cost: total_cost.normalize(),
                total_input_tokens: input_tokens as u64,
                total_output_tokens: output_tokens as u64,
                call_count: call_count as u64,
            })
        }
        _ => Ok(LlmCostSummary::default()),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn list_rules(&self, owner_id: &str) -> Result<Vec<Rule>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules WHERE owner_id = ?1 \
                     ORDER BY rule_order ASC, created_at ASC, rowid ASC"
                ),
                params![owner_id],
            )
            .await
            .map_err(query_err("list_rules"))?;
        collect_rules(rows).await
    }

    async fn get_rule(&self, owner_id: &str, id: Uuid) -> Result<Option<Rule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE owner_id = ?1 AND id = ?2"),
                params![owner_id, id.to_string()],
            )
            .await
            .map_err(query_err("get_rule"))?;

        match rows.next().await.map_err(query_err("get_rule"))? {
            Some(row) => Ok(Some(row_to_rule(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_rule_by_label(
        &self,
        owner_id: &str,
        label: &str,
    ) -> Result<Option<Rule>, DatabaseError> {
        // SQLite's lower() only folds ASCII, so compare in Rust.
        let wanted = label.trim().to_lowercase();
        Ok(self.list_rules(owner_id).await?.into_iter().find(|r| {
            r.label_to_apply
                .as_deref()
                .is_some_and(|l| l.trim().to_lowercase() == wanted)
        }))
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO rules ({RULE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    rule.id.to_string(),
                    rule.owner_id.as_str(),
                    opt_text(rule.sender_pattern.as_deref()),
                    to_json(&rule.keywords)?,
                    opt_text(rule.label_to_apply.as_deref()),
                    rule.priority.as_str(),
                    opt_bool(rule.create_draft),
                    opt_bool(rule.auto_reply),
                    opt_bool(rule.notify_urgent),
                    opt_text(rule.response_template.as_deref()),
                    opt_bool(rule.exclude_newsletters),
                    opt_bool(rule.exclude_marketing),
                    i64::from(rule.is_active),
                    rule.rule_order,
                    rule.description.as_str(),
                    rule.created_at.to_rfc3339(),
                    rule.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("insert_rule"))?;
        debug!(rule_id = %rule.id, owner = %rule.owner_id, "Rule inserted");
        Ok(())
    }

    async fn update_rule(&self, rule: &Rule) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE rules SET sender_pattern = ?3, keywords = ?4, label_to_apply = ?5, \
                 priority = ?6, create_draft = ?7, auto_reply = ?8, notify_urgent = ?9, \
                 response_template = ?10, exclude_newsletters = ?11, exclude_marketing = ?12, \
                 is_active = ?13, rule_order = ?14, description = ?15, updated_at = ?16 \
                 WHERE owner_id = ?1 AND id = ?2",
                params![
                    rule.owner_id.as_str(),
                    rule.id.to_string(),
                    opt_text(rule.sender_pattern.as_deref()),
                    to_json(&rule.keywords)?,
                    opt_text(rule.label_to_apply.as_deref()),
                    rule.priority.as_str(),
                    opt_bool(rule.create_draft),
                    opt_bool(rule.auto_reply),
                    opt_bool(rule.notify_urgent),
                    opt_text(rule.response_template.as_deref()),
                    opt_bool(rule.exclude_newsletters),
                    opt_bool(rule.exclude_marketing),
                    i64::from(rule.is_active),
                    rule.rule_order,
                    rule.description.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("update_rule"))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "rule".into(),
                id: rule.id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_rule(&self, owner_id: &str, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM rules WHERE owner_id = ?1 AND id = ?2",
                params![owner_id, id.to_string()],
            )
            .await
            .map_err(query_err("delete_rule"))?;
        Ok(count > 0)
    }

    async fn next_rule_order(&self, owner_id: &str) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(MAX(rule_order) + 1, 0) FROM rules WHERE owner_id = ?1",
                params![owner_id],
            )
            .await
            .map_err(query_err("next_rule_order"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            _ => Ok(0),
        }
    }

    async fn append_rule_description(
        &self,
        owner_id: &str,
        id: Uuid,
        line: &str,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE rules SET description = CASE WHEN description = '' THEN ?3 \
                 ELSE description || char(10) || ?3 END, updated_at = ?4 \
                 WHERE owner_id = ?1 AND id = ?2",
                params![owner_id, id.to_string(), line, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err("append_rule_description"))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "rule".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_rule_keywords(
        &self,
        owner_id: &str,
        id: Uuid,
        keywords: &[String],
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE rules SET keywords = ?3, updated_at = ?4 WHERE owner_id = ?1 AND id = ?2",
                params![owner_id, id.to_string(), to_json(&keywords)?, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err("set_rule_keywords"))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "rule".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_rule_sender_pattern_if_unset(
        &self,
        owner_id: &str,
        id: Uuid,
        pattern: &str,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE rules SET sender_pattern = ?3, updated_at = ?4 \
                 WHERE owner_id = ?1 AND id = ?2 AND sender_pattern IS NULL",
                params![owner_id, id.to_string(), pattern, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err("set_rule_sender_pattern_if_unset"))?;
        Ok(count > 0)
    }

    // ── Outcomes ────────────────────────────────────────────────────

    async fn upsert_outcome(&self, outcome: &ProcessingOutcome) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO outcomes ({OUTCOME_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                     ON CONFLICT (owner_id, message_id) DO UPDATE SET \
                     labels = excluded.labels, priority = excluded.priority, \
                     classification = excluded.classification, decision = excluded.decision, \
                     actions = excluded.actions, draft_id = excluded.draft_id, \
                     suggested_new_label = excluded.suggested_new_label, \
                     matched_rule_id = excluded.matched_rule_id, \
                     processed_at = excluded.processed_at"
                ),
                params![
                    outcome.owner_id.as_str(),
                    outcome.message_id.as_str(),
                    to_json(&outcome.labels)?,
                    i64::from(outcome.priority),
                    to_json(&outcome.classification)?,
                    to_json(&outcome.decision)?,
                    to_json(&outcome.actions)?,
                    opt_text(outcome.draft_id.as_deref()),
                    opt_text(outcome.suggested_new_label.as_deref()),
                    opt_text(outcome.matched_rule_id.map(|id| id.to_string()).as_deref()),
                    outcome.correction_status.as_str(),
                    opt_text(outcome.correction_reason.as_deref()),
                    opt_text(outcome.correction_summary.as_deref()),
                    outcome.processed_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("upsert_outcome"))?;
        Ok(())
    }

    async fn get_outcome(
        &self,
        owner_id: &str,
        message_id: &str,
    ) -> Result<Option<ProcessingOutcome>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OUTCOME_COLUMNS} FROM outcomes WHERE owner_id = ?1 AND message_id = ?2"
                ),
                params![owner_id, message_id],
            )
            .await
            .map_err(query_err("get_outcome"))?;

        match rows.next().await.map_err(query_err("get_outcome"))? {
            Some(row) => Ok(Some(row_to_outcome(&row)?)),
            None => Ok(None),
        }
    }

    async fn count_outcomes(&self, owner_id: &str) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM outcomes WHERE owner_id = ?1",
                params![owner_id],
            )
            .await
            .map_err(query_err("count_outcomes"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            _ => Ok(0),
        }
    }

    async fn update_outcome_correction(
        &self,
        owner_id: &str,
        message_id: &str,
        labels: &[String],
        status: CorrectionStatus,
        reason: Option<&str>,
        summary: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE outcomes SET labels = ?3, correction_status = ?4, \
                 correction_reason = COALESCE(?5, correction_reason), \
                 correction_summary = COALESCE(?6, correction_summary) \
                 WHERE owner_id = ?1 AND message_id = ?2",
                params![
                    owner_id,
                    message_id,
                    to_json(&labels)?,
                    status.as_str(),
                    opt_text(reason),
                    opt_text(summary),
                ],
            )
            .await
            .map_err(query_err("update_outcome_correction"))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "outcome".into(),
                id: format!("{owner_id}/{message_id}"),
            });
        }
        Ok(())
    }

    async fn applied_labels(&self, owner_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT labels, MAX(processed_at) AS last_seen FROM outcomes \
                 WHERE owner_id = ?1 GROUP BY labels ORDER BY last_seen DESC",
                params![owner_id],
            )
            .await
            .map_err(query_err("applied_labels"))?;

        let mut seen = HashSet::new();
        let mut labels = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("applied_labels"))? {
            let raw: String = row.get::<String>(0).unwrap_or_else(|_| "[]".into());
            let set: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
            if let Some(category) = category_of(&set)
                && seen.insert(category.to_lowercase())
            {
                labels.push(category.to_string());
            }
        }
        Ok(labels)
    }

    // ── Corrections ─────────────────────────────────────────────────

    async fn insert_correction(&self, correction: &Correction) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO corrections ({CORRECTION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    correction.id.to_string(),
                    correction.owner_id.as_str(),
                    correction.message_id.as_str(),
                    correction.old_label.as_str(),
                    correction.new_label.as_str(),
                    correction.reason.as_str(),
                    correction.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("insert_correction"))?;
        Ok(())
    }

    async fn recent_corrections(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<Correction>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CORRECTION_COLUMNS} FROM corrections WHERE owner_id = ?1 \
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![owner_id, limit as i64],
            )
            .await
            .map_err(query_err("recent_corrections"))?;

        let mut corrections = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("recent_corrections"))? {
            corrections.push(row_to_correction(&row)?);
        }
        Ok(corrections)
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(
        &self,
        owner_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM settings WHERE owner_id = ?1 AND key = ?2",
                params![owner_id, key],
            )
            .await
            .map_err(query_err("get_setting"))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        owner_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let value_str = to_json(value)?;

        self.conn()
            .execute(
                "INSERT INTO settings (owner_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (owner_id, key) DO UPDATE SET value = ?3, updated_at = ?4",
                params![owner_id, key, value_str, now],
            )
            .await
            .map_err(query_err("set_setting"))?;
        Ok(())
    }

    // ── Local surfaces ──────────────────────────────────────────────

    async fn ensure_label(&self, owner_id: &str, name: &str) -> Result<String, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO labels (id, owner_id, name) VALUES (?1, ?2, ?3)",
            params![Uuid::new_v4().to_string(), owner_id, name],
        )
        .await
        .map_err(query_err("ensure_label"))?;

        let mut rows = conn
            .query(
                "SELECT id FROM labels WHERE owner_id = ?1 AND name = ?2",
                params![owner_id, name],
            )
            .await
            .map_err(query_err("ensure_label"))?;

        match rows.next().await.map_err(query_err("ensure_label"))? {
            Some(row) => row.get::<String>(0).map_err(query_err("ensure_label")),
            None => Err(DatabaseError::NotFound {
                entity: "label".into(),
                id: name.to_string(),
            }),
        }
    }

    async fn apply_label(
        &self,
        owner_id: &str,
        message_id: &str,
        label_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO message_labels (owner_id, message_id, label_id) \
                 VALUES (?1, ?2, ?3)",
                params![owner_id, message_id, label_id],
            )
            .await
            .map_err(query_err("apply_label"))?;
        Ok(())
    }

    async fn message_labels(
        &self,
        owner_id: &str,
        message_id: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT l.name FROM message_labels ml JOIN labels l ON l.id = ml.label_id \
                 WHERE ml.owner_id = ?1 AND ml.message_id = ?2 ORDER BY ml.applied_at, l.name",
                params![owner_id, message_id],
            )
            .await
            .map_err(query_err("message_labels"))?;

        let mut names = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("message_labels"))? {
            names.push(row.get::<String>(0).map_err(query_err("message_labels"))?);
        }
        Ok(names)
    }

    async fn insert_draft(&self, draft: &StoredDraft) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO drafts (id, owner_id, message_id, recipient, subject, body, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    draft.id.as_str(),
                    draft.owner_id.as_str(),
                    draft.message_id.as_str(),
                    draft.recipient.as_str(),
                    draft.subject.as_str(),
                    draft.body.as_str(),
                    draft.status.as_str(),
                    draft.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("insert_draft"))?;
        Ok(())
    }

    async fn list_drafts(&self, owner_id: &str) -> Result<Vec<StoredDraft>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, owner_id, message_id, recipient, subject, body, status, created_at \
                 FROM drafts WHERE owner_id = ?1 ORDER BY created_at DESC",
                params![owner_id],
            )
            .await
            .map_err(query_err("list_drafts"))?;

        let map = query_err("list_drafts");
        let mut drafts = Vec::new();
        while let Some(row) = rows.next().await.map_err(&map)? {
            let created: String = row.get(7).map_err(&map)?;
            drafts.push(StoredDraft {
                id: row.get(0).map_err(&map)?,
                owner_id: row.get(1).map_err(&map)?,
                message_id: row.get(2).map_err(&map)?,
                recipient: row.get(3).map_err(&map)?,
                subject: row.get(4).map_err(&map)?,
                body: row.get(5).map_err(&map)?,
                status: row.get(6).map_err(&map)?,
                created_at: parse_datetime(&created),
            });
        }
        Ok(drafts)
    }

    async fn insert_event(&self, event: &StoredEvent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO calendar_events \
                 (id, owner_id, title, start_at, duration_minutes, location, attendees, description, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.id.as_str(),
                    event.owner_id.as_str(),
                    event.event.title.as_str(),
                    event.event.start.to_rfc3339(),
                    i64::from(event.event.duration_minutes),
                    opt_text(event.event.location.as_deref()),
                    to_json(&event.event.attendees)?,
                    opt_text(event.event.description.as_deref()),
                    event.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("insert_event"))?;
        Ok(())
    }

    async fn list_events(&self, owner_id: &str) -> Result<Vec<StoredEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, owner_id, title, start_at, duration_minutes, location, attendees, \
                 description, created_at FROM calendar_events WHERE owner_id = ?1 \
                 ORDER BY start_at ASC",
                params![owner_id],
            )
            .await
            .map_err(query_err("list_events"))?;

        let map = query_err("list_events");
        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(&map)? {
            let start: String = row.get(3).map_err(&map)?;
            let attendees: String = row.get::<String>(6).unwrap_or_else(|_| "[]".into());
            let created: String = row.get(8).map_err(&map)?;
            events.push(StoredEvent {
                id: row.get(0).map_err(&map)?,
                owner_id: row.get(1).map_err(&map)?,
                event: CalendarEvent {
                    title: row.get(2).map_err(&map)?,
                    start: parse_datetime(&start),
                    duration_minutes: row.get::<i64>(4).unwrap_or(0).max(0) as u32,
                    location: row.get::<String>(5).ok(),
                    attendees: serde_json::from_str(&attendees).unwrap_or_default(),
                    description: row.get::<String>(7).ok(),
                },
                created_at: parse_datetime(&created),
            });
        }
        Ok(events)
    }

    // ── Activity ────────────────────────────────────────────────────

    async fn record_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO activity_log (id, owner_id, message_id, kind, detail, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.id.to_string(),
                    entry.owner_id.as_str(),
                    opt_text(entry.message_id.as_deref()),
                    entry.kind.as_str(),
                    entry.detail.as_str(),
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("record_activity"))?;
        Ok(())
    }

    async fn list_activity(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, owner_id, message_id, kind, detail, created_at FROM activity_log \
                 WHERE owner_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                params![owner_id, limit as i64],
            )
            .await
            .map_err(query_err("list_activity"))?;

        let map = query_err("list_activity");
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(&map)? {
            let id: String = row.get(0).map_err(&map)?;
            let created: String = row.get(5).map_err(&map)?;
            entries.push(ActivityEntry {
                id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                owner_id: row.get(1).map_err(&map)?,
                message_id: row.get::<String>(2).ok(),
                kind: row.get(3).map_err(&map)?,
                detail: row.get(4).map_err(&map)?,
                created_at: parse_datetime(&created),
            });
        }
        Ok(entries)
    }

    // ── LLM Call Tracking ───────────────────────────────────────────

    async fn record_llm_call(&self, record: &LlmCallRecord<'_>) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO llm_calls (id, owner_id, message_id, provider, model, input_tokens, output_tokens, cost, purpose, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id.to_string(),
                    record.owner_id,
                    opt_text(record.message_id),
                    record.provider,
                    record.model,
                    record.input_tokens as i64,
                    record.output_tokens as i64,
                    record.cost.to_string(),
                    record.purpose,
                    now,
                ],
            )
            .await
            .map_err(query_err("record_llm_call"))?;
        Ok(id)
    }

    async fn llm_cost_summary(&self, owner_id: &str) -> Result<LlmCostSummary, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT TOTAL(CAST(cost AS REAL)), TOTAL(input_tokens), TOTAL(output_tokens), COUNT(*) \
                 FROM llm_calls WHERE owner_id = ?1",
                params![owner_id],
            )
            .await
            .map_err(query_err("llm_cost_summary"))?;

        parse_cost_summary_row(&mut rows).await
    }
}
