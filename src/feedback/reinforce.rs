//! Turns human corrections into rule changes.
//!
//! Two paths share the same lookup:
//! - `reinforce` appends the dated reason to the rule for the corrected
//!   category, creating that rule when it does not exist yet
//! - `interpret_feedback` asks the classifier for keywords and sender
//!   domains and merges them into the rule by set union
//!
//! Both only ever grow a rule, through targeted column updates. Work for
//! one owner is serialized.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ReinforceError;
use crate::pipeline::classifier::{Classifier, FeedbackInterpretation};
use crate::pipeline::types::{Correction, CorrectionStatus, Rule, category_of};
use crate::store::{ActivityEntry, Database, LlmCallRecord};

/// What a reinforcement run changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReinforcementResult {
    pub rule_id: Uuid,
    /// The category label the rule applies.
    pub label: String,
    /// True when the rule did not exist before this run.
    pub created: bool,
    pub added_keywords: Vec<String>,
    /// Sender pattern set by this run, if any.
    pub sender_pattern: Option<String>,
    pub summary: String,
}

/// Applies corrections to an owner's rules.
pub struct Reinforcer {
    db: Arc<dyn Database>,
    classifier: Option<Arc<Classifier>>,
    owner_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Reinforcer {
    pub fn new(db: Arc<dyn Database>, classifier: Option<Arc<Classifier>>) -> Self {
        Self {
            db,
            classifier,
            owner_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn owner_lock(&self, owner_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.owner_locks.lock().await;
        Arc::clone(locks.entry(owner_id.to_string()).or_default())
    }

    /// Drop our handle and forget owners nobody else is waiting on.
    async fn release_owner_lock(&self, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.owner_locks
            .lock()
            .await
            .retain(|_, l| Arc::strong_count(l) > 1);
    }

    /// Record the correction's reason on the rule for its category label.
    pub async fn reinforce(
        &self,
        correction: &Correction,
    ) -> Result<ReinforcementResult, ReinforceError> {
        let reason = require_reason(correction)?;
        let lock = self.owner_lock(&correction.owner_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.reinforce_locked(correction, reason).await
        };
        self.release_owner_lock(lock).await;
        result
    }

    async fn reinforce_locked(
        &self,
        correction: &Correction,
        reason: &str,
    ) -> Result<ReinforcementResult, ReinforceError> {
        let (labels, label) = self.corrected_labels(correction).await?;
        let line = dated_line(reason);
        let owner = correction.owner_id.as_str();

        let (rule_id, created) = match self.db.find_rule_by_label(owner, &label).await? {
            Some(rule) => {
                self.db.append_rule_description(owner, rule.id, &line).await?;
                (rule.id, false)
            }
            None => {
                let mut rule = Rule::new(owner, Some(label.clone()));
                rule.description = line;
                rule.rule_order = self.db.next_rule_order(owner).await?;
                self.db.insert_rule(&rule).await?;
                (rule.id, true)
            }
        };

        let summary = if created {
            format!("Created rule '{label}' from correction")
        } else {
            format!("Added correction reason to rule '{label}'")
        };
        let result = ReinforcementResult {
            rule_id,
            label,
            created,
            added_keywords: Vec::new(),
            sender_pattern: None,
            summary,
        };
        self.finish(correction, &labels, &result).await?;
        Ok(result)
    }

    /// Enrich the category's rule with classifier-suggested keywords and domains.
    ///
    /// An existing rule only gets a description line when the classifier
    /// returned one. A rule created here falls back to the dated reason.
    pub async fn interpret_feedback(
        &self,
        correction: &Correction,
        free_text: &str,
    ) -> Result<ReinforcementResult, ReinforceError> {
        let reason = require_reason(correction)?;
        let lock = self.owner_lock(&correction.owner_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.interpret_feedback_locked(correction, reason, free_text)
                .await
        };
        self.release_owner_lock(lock).await;
        result
    }

    async fn interpret_feedback_locked(
        &self,
        correction: &Correction,
        reason: &str,
        free_text: &str,
    ) -> Result<ReinforcementResult, ReinforceError> {
        let (labels, label) = self.corrected_labels(correction).await?;
        let owner = correction.owner_id.as_str();
        let existing = self.db.find_rule_by_label(owner, &label).await?;

        let interpretation = self
            .ask_classifier(correction, free_text, existing.as_ref())
            .await;
        let description = interpretation.description.trim();
        let domain_pattern = sender_pattern_for(&interpretation.domains);

        let (rule_id, created, added_keywords, sender_pattern) = match existing {
            Some(mut rule) => {
                let added = merge_keywords(&mut rule.keywords, &interpretation.keywords);
                if !added.is_empty() {
                    self.db
                        .set_rule_keywords(owner, rule.id, &rule.keywords)
                        .await?;
                }
                let sender_pattern = match domain_pattern {
                    Some(pattern) => self
                        .db
                        .set_rule_sender_pattern_if_unset(owner, rule.id, &pattern)
                        .await?
                        .then_some(pattern),
                    None => None,
                };
                if !description.is_empty() {
                    self.db
                        .append_rule_description(owner, rule.id, &dated_line(description))
                        .await?;
                }
                (rule.id, false, added, sender_pattern)
            }
            None => {
                let mut rule = Rule::new(owner, Some(label.clone()));
                rule.rule_order = self.db.next_rule_order(owner).await?;
                let added = merge_keywords(&mut rule.keywords, &interpretation.keywords);
                rule.sender_pattern = domain_pattern.clone();
                rule.description =
                    dated_line(if description.is_empty() { reason } else { description });
                self.db.insert_rule(&rule).await?;
                (rule.id, true, added, domain_pattern)
            }
        };

        let mut summary = if created {
            format!("Created rule '{label}'")
        } else {
            format!("Updated rule '{label}'")
        };
        if !added_keywords.is_empty() {
            summary.push_str(&format!("; added keywords: {}", added_keywords.join(", ")));
        }
        if let Some(ref pattern) = sender_pattern {
            summary.push_str(&format!("; sender pattern: {pattern}"));
        }

        let result = ReinforcementResult {
            rule_id,
            label,
            created,
            added_keywords,
            sender_pattern,
            summary,
        };
        self.finish(correction, &labels, &result).await?;
        Ok(result)
    }

    /// The outcome's labels with the correction applied, and their category.
    async fn corrected_labels(
        &self,
        correction: &Correction,
    ) -> Result<(Vec<String>, String), ReinforceError> {
        let outcome = self
            .db
            .get_outcome(&correction.owner_id, &correction.message_id)
            .await?
            .ok_or_else(|| ReinforceError::OutcomeNotFound {
                owner_id: correction.owner_id.clone(),
                message_id: correction.message_id.clone(),
            })?;
        let labels = correction.apply_to(&outcome.labels);
        let category = category_of(&labels)
            .ok_or(ReinforceError::NoCategoryLabel)?
            .to_string();
        Ok((labels, category))
    }

    async fn ask_classifier(
        &self,
        correction: &Correction,
        free_text: &str,
        rule: Option<&Rule>,
    ) -> FeedbackInterpretation {
        let Some(ref classifier) = self.classifier else {
            return FeedbackInterpretation::default();
        };
        match classifier.interpret_feedback(correction, free_text, rule).await {
            Ok((interpretation, usage)) => {
                let record = LlmCallRecord {
                    owner_id: &correction.owner_id,
                    message_id: Some(&correction.message_id),
                    provider: "anthropic",
                    model: &usage.model,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cost: usage.cost,
                    purpose: "interpret_feedback",
                };
                if let Err(e) = self.db.record_llm_call(&record).await {
                    warn!(error = %e, "Failed to record LLM call");
                }
                interpretation
            }
            Err(e) => {
                warn!(
                    message_id = %correction.message_id,
                    error = %e,
                    "Feedback interpretation failed, keeping the reason only"
                );
                FeedbackInterpretation::default()
            }
        }
    }

    /// Mark the outcome applied and log the change.
    async fn finish(
        &self,
        correction: &Correction,
        labels: &[String],
        result: &ReinforcementResult,
    ) -> Result<(), ReinforceError> {
        self.db
            .update_outcome_correction(
                &correction.owner_id,
                &correction.message_id,
                labels,
                CorrectionStatus::Applied,
                None,
                Some(&result.summary),
            )
            .await?;

        let entry = ActivityEntry::new(
            &correction.owner_id,
            Some(&correction.message_id),
            "reinforcement_applied",
            &result.summary,
        );
        if let Err(e) = self.db.record_activity(&entry).await {
            warn!(error = %e, "Failed to write activity entry");
        }
        info!(
            owner = %correction.owner_id,
            rule_id = %result.rule_id,
            created = result.created,
            "{}",
            result.summary
        );
        Ok(())
    }
}

fn require_reason(correction: &Correction) -> Result<&str, ReinforceError> {
    let reason = correction.reason.trim();
    if reason.is_empty() {
        Err(ReinforceError::MissingReason)
    } else {
        Ok(reason)
    }
}

fn dated_line(text: &str) -> String {
    format!("[{}] {}", Utc::now().format("%Y-%m-%d"), text.trim())
}

/// Append suggestions not already present (exact match). Returns what was added.
fn merge_keywords(existing: &mut Vec<String>, suggested: &[String]) -> Vec<String> {
    let mut added = Vec::new();
    for keyword in suggested.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
        if !existing.iter().any(|e| e == keyword) {
            existing.push(keyword.to_string());
            added.push(keyword.to_string());
        }
    }
    added
}

/// OR-joined, regex-escaped sender domains. `None` when there are none.
fn sender_pattern_for(domains: &[String]) -> Option<String> {
    let mut escaped: Vec<String> = Vec::new();
    for domain in domains {
        let domain = domain.trim().trim_start_matches('@');
        if domain.is_empty() {
            continue;
        }
        let pattern = regex::escape(domain);
        if !escaped.contains(&pattern) {
            escaped.push(pattern);
        }
    }
    (!escaped.is_empty()).then(|| escaped.join("|"))
}
