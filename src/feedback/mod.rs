//! Human corrections and the reinforcement loop they trigger.
//!
//! `commit_correction` is the synchronous, authoritative label change.
//! `spawn_reinforcement` then updates rules in the background; its failure
//! is logged and never reverts the committed correction.

pub mod reinforce;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use reinforce::{ReinforcementResult, Reinforcer};

use crate::error::ReinforceError;
use crate::pipeline::types::{Correction, CorrectionStatus, ProcessingOutcome};
use crate::store::{ActivityEntry, Database};

/// Apply a correction to its outcome and store it as a classifier exemplar.
///
/// Returns the outcome with its corrected labels.
pub async fn commit_correction(
    db: &dyn Database,
    correction: &Correction,
) -> Result<ProcessingOutcome, ReinforceError> {
    if correction.reason.trim().is_empty() {
        return Err(ReinforceError::MissingReason);
    }
    let mut outcome = db
        .get_outcome(&correction.owner_id, &correction.message_id)
        .await?
        .ok_or_else(|| ReinforceError::OutcomeNotFound {
            owner_id: correction.owner_id.clone(),
            message_id: correction.message_id.clone(),
        })?;

    let labels = correction.apply_to(&outcome.labels);
    db.update_outcome_correction(
        &correction.owner_id,
        &correction.message_id,
        &labels,
        CorrectionStatus::Corrected,
        Some(correction.reason.trim()),
        None,
    )
    .await?;
    db.insert_correction(correction).await?;

    info!(
        owner = %correction.owner_id,
        message_id = %correction.message_id,
        old = %correction.old_label,
        new = %correction.new_label,
        "Correction committed"
    );

    outcome.labels = labels;
    outcome.correction_status = CorrectionStatus::Corrected;
    outcome.correction_reason = Some(correction.reason.trim().to_string());
    Ok(outcome)
}

/// Run reinforcement for a committed correction on a background task.
///
/// When `free_text` is given, the interpreted-feedback path runs afterwards.
pub fn spawn_reinforcement(
    db: Arc<dyn Database>,
    reinforcer: Arc<Reinforcer>,
    correction: Correction,
    free_text: Option<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = reinforcer.reinforce(&correction).await {
            report_failure(db.as_ref(), &correction, "reinforcement_failed", &e).await;
        }

        let Some(free_text) = free_text.filter(|t| !t.trim().is_empty()) else {
            return;
        };
        if let Err(e) = reinforcer.interpret_feedback(&correction, &free_text).await {
            report_failure(db.as_ref(), &correction, "feedback_failed", &e).await;
        }
    })
}

async fn report_failure(
    db: &dyn Database,
    correction: &Correction,
    kind: &str,
    error: &ReinforceError,
) {
    warn!(
        owner = %correction.owner_id,
        message_id = %correction.message_id,
        error = %error,
        "Reinforcement failed"
    );
    let entry = ActivityEntry::new(
        &correction.owner_id,
        Some(&correction.message_id),
        kind,
        error.to_string(),
    );
    if let Err(e) = db.record_activity(&entry).await {
        warn!(error = %e, "Failed to write activity entry");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::pipeline::decision::ActionDecision;
    use crate::pipeline::types::{ClassifierResult, LABEL_RESPOND};
    use crate::store::LibSqlBackend;

    async fn db_with_outcome() -> Arc<LibSqlBackend> {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.upsert_outcome(&ProcessingOutcome {
            owner_id: "u1".into(),
            message_id: "m1".into(),
            labels: vec!["Work".into(), LABEL_RESPOND.into()],
            priority: 5,
            classification: ClassifierResult::fallback("test"),
            decision: ActionDecision::default(),
            actions: Vec::new(),
            draft_id: None,
            suggested_new_label: None,
            matched_rule_id: None,
            correction_status: CorrectionStatus::None,
            correction_reason: None,
            correction_summary: None,
            processed_at: Utc::now(),
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn commit_updates_labels_and_stores_exemplar() {
        let db = db_with_outcome().await;
        let correction = Correction::new("u1", "m1", "Work", "Family", "my sister's address");

        let outcome = commit_correction(&*db, &correction).await.unwrap();
        assert_eq!(outcome.labels, vec!["Family", LABEL_RESPOND]);

        let stored = db.get_outcome("u1", "m1").await.unwrap().unwrap();
        assert_eq!(stored.correction_status, CorrectionStatus::Corrected);
        assert_eq!(stored.correction_reason.as_deref(), Some("my sister's address"));
        assert_eq!(db.recent_corrections("u1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commit_requires_reason() {
        let db = db_with_outcome().await;
        let err = commit_correction(&*db, &Correction::new("u1", "m1", "Work", "Family", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ReinforceError::MissingReason));
        assert!(db.recent_corrections("u1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_reinforcement_keeps_correction() {
        let db = db_with_outcome().await;
        // Moving the category to an action label leaves no category to reinforce.
        let correction = Correction::new("u1", "m1", "Work", "Actions/Rien à faire", "noise");
        commit_correction(&*db, &correction).await.unwrap();

        let reinforcer = Arc::new(Reinforcer::new(db.clone(), None));
        spawn_reinforcement(db.clone(), reinforcer, correction, None)
            .await
            .unwrap();

        let stored = db.get_outcome("u1", "m1").await.unwrap().unwrap();
        assert_eq!(stored.correction_status, CorrectionStatus::Corrected);
        let activity = db.list_activity("u1", 10).await.unwrap();
        assert_eq!(activity[0].kind, "reinforcement_failed");
    }

    #[tokio::test]
    async fn spawned_reinforcement_marks_outcome_applied() {
        let db = db_with_outcome().await;
        let correction = Correction::new("u1", "m1", "Work", "Family", "my sister's address");
        commit_correction(&*db, &correction).await.unwrap();

        let reinforcer = Arc::new(Reinforcer::new(db.clone(), None));
        spawn_reinforcement(db.clone(), reinforcer, correction, None)
            .await
            .unwrap();

        let stored = db.get_outcome("u1", "m1").await.unwrap().unwrap();
        assert_eq!(stored.correction_status, CorrectionStatus::Applied);
        assert!(db.find_rule_by_label("u1", "Family").await.unwrap().is_some());
    }
}
