//! Message processor: classifies one inbound message and carries out its actions.
//!
//! Flow:
//! 1. Validate input (nothing is persisted for invalid messages)
//! 2. Load owner context, then run rule matching alongside the classifier
//! 3. Resolve labels, score priority, decide actions
//! 4. Upsert the outcome (the durable checkpoint)
//! 5. Fan out side effects; each one yields an `ActionRecord`
//! 6. Record failures in the activity log and re-save the outcome

use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, join_all};
use tracing::{debug, error, info, warn};

use crate::config::OwnerSettings;
use crate::error::PipelineError;
use crate::pipeline::classifier::{CallUsage, Classifier, ClassifierConfig, MAX_CORRECTION_EXAMPLES};
use crate::pipeline::decision::{DecisionInput, decide};
use crate::pipeline::labels::{build_vocabulary, final_labels, resolve_action_label, resolve_category};
use crate::pipeline::priority;
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::types::{
    ActionRecord, CorrectionStatus, InboundMessage, ProcessingOutcome, Rule, is_action_label,
};
use crate::store::{ActivityEntry, Database, LlmCallRecord};
use crate::surfaces::Surfaces;

/// Reply body used when neither the classifier nor a rule supplies one.
const DEFAULT_REPLY_BODY: &str =
    "Thank you for your message. I have received it and will get back to you shortly.";

/// Longest reasoning excerpt included in an urgent notification.
const NOTIFY_REASONING_CHARS: usize = 200;

/// Classifies inbound messages and orchestrates their side effects.
pub struct MessageProcessor {
    db: Arc<dyn Database>,
    classifier: Arc<Classifier>,
    surfaces: Surfaces,
}

impl MessageProcessor {
    pub fn new(db: Arc<dyn Database>, classifier: Arc<Classifier>, surfaces: Surfaces) -> Self {
        Self {
            db,
            classifier,
            surfaces,
        }
    }

    /// Process a single inbound message through the full pipeline.
    ///
    /// Only input and outcome-persistence failures are returned as errors.
    /// Classifier and side-effect failures are absorbed into the outcome.
    pub async fn process(&self, message: InboundMessage) -> Result<ProcessingOutcome, PipelineError> {
        message.validate()?;
        info!(
            owner = %message.owner_id,
            message_id = %message.message_id,
            sender = %message.sender,
            "Processing inbound message"
        );

        let owner = message.owner_id.as_str();
        let (rules, settings, applied, corrections) = tokio::try_join!(
            self.db.list_rules(owner),
            OwnerSettings::load(self.db.as_ref(), owner),
            self.db.applied_labels(owner),
            self.db.recent_corrections(owner, MAX_CORRECTION_EXAMPLES),
        )?;

        let vocabulary = build_vocabulary(&rules, &applied, settings.vocabulary_policy);
        let config = ClassifierConfig {
            system_instructions: settings.system_instructions.clone(),
            vocabulary,
            recent_corrections: corrections,
        };
        let engine = RulesEngine::new(rules);

        let (matched, classification) = tokio::join!(
            async { engine.evaluate(&message) },
            self.classifier.classify(&message, &config),
        );
        let result = classification.result;
        let best = matched.first().copied();
        if let Some(rule) = best {
            debug!(
                message_id = %message.message_id,
                rule_id = %rule.id,
                matched = matched.len(),
                "Rules matched"
            );
        }

        let resolution = resolve_category(&result, &config.vocabulary, best);
        let action_label = resolve_action_label(&result);
        let labels = final_labels(resolution.label(), &action_label);
        let score = priority::score(result.urgency, best.map(|r| r.priority), result.sentiment);
        let decision = decide(&DecisionInput {
            labels: &labels,
            category: resolution.label(),
            score,
            classification: &result,
            matched: &matched,
            urgent_threshold: settings.urgent_threshold,
        });

        let mut outcome = ProcessingOutcome {
            owner_id: message.owner_id.clone(),
            message_id: message.message_id.clone(),
            labels,
            priority: score,
            classification: result,
            decision,
            actions: Vec::new(),
            draft_id: None,
            suggested_new_label: resolution.suggestion().map(str::to_string),
            matched_rule_id: best.map(|r| r.id),
            correction_status: CorrectionStatus::None,
            correction_reason: None,
            correction_summary: None,
            processed_at: Utc::now(),
        };

        self.db.upsert_outcome(&outcome).await.map_err(|e| {
            error!(message_id = %message.message_id, error = %e, "Failed to persist outcome");
            PipelineError::Persistence(e)
        })?;

        let records = self.run_side_effects(&message, &outcome, &matched).await;
        outcome.draft_id = records.iter().find_map(|r| match r {
            ActionRecord::DraftCreated { draft_id } => Some(draft_id.clone()),
            _ => None,
        });
        outcome.actions = records;
        self.record_failures(&outcome).await;

        if let Err(e) = self.db.upsert_outcome(&outcome).await {
            warn!(
                message_id = %outcome.message_id,
                error = %e,
                "Failed to record action results on outcome"
            );
        }
        if let Some(usage) = classification.usage {
            self.record_usage(&outcome, &usage).await;
        }

        info!(
            owner = %outcome.owner_id,
            message_id = %outcome.message_id,
            labels = ?outcome.labels,
            priority = outcome.priority,
            actions = outcome.actions.len(),
            "Message processed"
        );
        Ok(outcome)
    }

    /// Process a batch of messages.
    ///
    /// Processes each message independently. Failures on individual messages
    /// are logged but don't fail the entire batch.
    pub async fn process_batch(&self, messages: Vec<InboundMessage>) -> Vec<ProcessingOutcome> {
        let count = messages.len();
        info!(count, "Processing message batch");

        let mut results = Vec::with_capacity(count);
        for message in messages {
            let message_id = message.message_id.clone();
            match self.process(message).await {
                Ok(outcome) => results.push(outcome),
                Err(e) => {
                    error!(message_id = %message_id, error = %e, "Failed to process message in batch");
                }
            }
        }

        info!(
            processed = results.len(),
            total = count,
            "Batch processing complete"
        );
        results
    }

    /// Run every decided side effect concurrently and collect one record each.
    async fn run_side_effects(
        &self,
        message: &InboundMessage,
        outcome: &ProcessingOutcome,
        matched: &[&Rule],
    ) -> Vec<ActionRecord> {
        let decision = &outcome.decision;
        let owner = outcome.owner_id.as_str();
        let message_id = outcome.message_id.as_str();
        let mut tasks: Vec<BoxFuture<'_, ActionRecord>> = Vec::new();

        if decision.apply_labels {
            for label in outcome.labels.iter().filter(|l| !is_action_label(l)) {
                let labels = Arc::clone(&self.surfaces.labels);
                tasks.push(
                    async move {
                        let applied = async {
                            let id = labels.ensure_label(owner, label).await?;
                            labels.apply_label(owner, message_id, &id).await
                        };
                        match applied.await {
                            Ok(()) => ActionRecord::LabelApplied {
                                label: label.clone(),
                            },
                            Err(e) => ActionRecord::LabelFailed {
                                label: label.clone(),
                                error: e.to_string(),
                            },
                        }
                    }
                    .boxed(),
                );
            }
        }

        if decision.create_draft || decision.auto_reply {
            let drafts = Arc::clone(&self.surfaces.drafts);
            let recipient = message.sender.clone();
            let subject = reply_subject(&message.subject);
            let body = reply_body(outcome, matched);
            let auto_reply = decision.auto_reply;
            tasks.push(
                async move {
                    if auto_reply {
                        match drafts
                            .send_reply(owner, message_id, &recipient, &subject, &body)
                            .await
                        {
                            Ok(()) => ActionRecord::AutoReplySent { recipient },
                            Err(e) => ActionRecord::AutoReplyFailed {
                                error: e.to_string(),
                            },
                        }
                    } else {
                        match drafts
                            .create_draft(owner, message_id, &recipient, &subject, &body)
                            .await
                        {
                            Ok(draft_id) => ActionRecord::DraftCreated { draft_id },
                            Err(e) => ActionRecord::DraftFailed {
                                error: e.to_string(),
                            },
                        }
                    }
                }
                .boxed(),
            );
        }

        if decision.create_calendar_event
            && let Some(event) = outcome
                .classification
                .calendar
                .as_ref()
                .and_then(|p| p.to_event())
        {
            let calendar = Arc::clone(&self.surfaces.calendar);
            tasks.push(
                async move {
                    match calendar.create_event(owner, &event).await {
                        Ok(event_id) => ActionRecord::CalendarCreated { event_id },
                        Err(e) => ActionRecord::CalendarFailed {
                            error: e.to_string(),
                        },
                    }
                }
                .boxed(),
            );
        }

        if decision.notify_urgent {
            let notifier = Arc::clone(&self.surfaces.notifier);
            let text = notification_text(message, outcome);
            tasks.push(
                async move {
                    match notifier.notify(owner, &text).await {
                        Ok(()) => ActionRecord::NotifySent,
                        Err(e) => ActionRecord::NotifyFailed {
                            error: e.to_string(),
                        },
                    }
                }
                .boxed(),
            );
        }

        join_all(tasks).await
    }

    async fn record_failures(&self, outcome: &ProcessingOutcome) {
        for record in &outcome.actions {
            let Some(error) = record.failure() else {
                continue;
            };
            warn!(
                message_id = %outcome.message_id,
                action = record.kind(),
                error = %error,
                "Side effect failed"
            );
            let entry = ActivityEntry::new(
                &outcome.owner_id,
                Some(&outcome.message_id),
                record.kind(),
                error,
            );
            if let Err(e) = self.db.record_activity(&entry).await {
                warn!(error = %e, "Failed to write activity entry");
            }
        }
    }

    async fn record_usage(&self, outcome: &ProcessingOutcome, usage: &CallUsage) {
        let record = LlmCallRecord {
            owner_id: &outcome.owner_id,
            message_id: Some(&outcome.message_id),
            provider: "anthropic",
            model: &usage.model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: usage.cost,
            purpose: "classify",
        };
        if let Err(e) = self.db.record_llm_call(&record).await {
            warn!(error = %e, "Failed to record LLM call");
        }
    }
}

// ── Reply and notification text ─────────────────────────────────────

fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject.to_lowercase().starts_with("re:") {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

/// Classifier body, else the first matching rule template, else a stock acknowledgement.
fn reply_body(outcome: &ProcessingOutcome, matched: &[&Rule]) -> String {
    outcome
        .classification
        .response_body
        .as_deref()
        .or_else(|| {
            matched
                .iter()
                .find_map(|r| r.response_template.as_deref())
                .filter(|t| !t.trim().is_empty())
        })
        .unwrap_or(DEFAULT_REPLY_BODY)
        .to_string()
}

fn notification_text(message: &InboundMessage, outcome: &ProcessingOutcome) -> String {
    let reasoning: String = outcome
        .classification
        .reasoning
        .chars()
        .take(NOTIFY_REASONING_CHARS)
        .collect();
    let mut text = format!(
        "Urgent email (priority {}/10)\nFrom: {}\nSubject: {}\nLabels: {}",
        outcome.priority,
        message.sender,
        message.subject,
        outcome.labels.join(", ")
    );
    if !reasoning.is_empty() {
        text.push_str(&format!("\n{reasoning}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::error::{CollaboratorError, LlmError};
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::pipeline::decision::Suppression;
    use crate::pipeline::types::{
        CalendarEvent, DEFAULT_CATEGORY, LABEL_MANUAL_REVIEW, LABEL_NOTHING_TO_DO, LABEL_RESPOND,
        PriorityTier,
    };
    use crate::store::LibSqlBackend;
    use crate::surfaces::{CalendarSurface, DraftSurface, LabelSurface, Notifier};

    // ── Mocks ───────────────────────────────────────────────────────

    /// Mock LLM that returns a fixed classification, fails, or stalls.
    struct MockLlm {
        response: Option<String>,
        delay: Duration,
    }

    impl MockLlm {
        fn replying(json: &str) -> Arc<dyn LlmProvider> {
            Arc::new(Self {
                response: Some(json.to_string()),
                delay: Duration::ZERO,
            })
        }

        fn failing() -> Arc<dyn LlmProvider> {
            Arc::new(Self {
                response: None,
                delay: Duration::ZERO,
            })
        }

        fn stalled() -> Arc<dyn LlmProvider> {
            Arc::new(Self {
                response: Some("{}".into()),
                delay: Duration::from_secs(5),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock-classifier"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::new(1, 6), Decimal::new(2, 6))
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(self.delay).await;
            match &self.response {
                Some(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 100,
                    output_tokens: 50,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                None => Err(LlmError::ServerError {
                    provider: "mock".into(),
                    status: 503,
                }),
            }
        }
    }

    /// Records every collaborator call; optionally fails one surface.
    #[derive(Default)]
    struct Recorder {
        labels: Mutex<Vec<String>>,
        drafts: Mutex<Vec<(String, String, String)>>,
        replies: Mutex<Vec<String>>,
        events: Mutex<Vec<CalendarEvent>>,
        notifications: Mutex<Vec<String>>,
        fail_calendar: bool,
    }

    #[async_trait]
    impl LabelSurface for Recorder {
        async fn ensure_label(&self, _owner: &str, name: &str) -> Result<String, CollaboratorError> {
            Ok(format!("id:{name}"))
        }

        async fn apply_label(
            &self,
            _owner: &str,
            _message_id: &str,
            label_id: &str,
        ) -> Result<(), CollaboratorError> {
            self.labels.lock().unwrap().push(label_id.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl DraftSurface for Recorder {
        async fn create_draft(
            &self,
            _owner: &str,
            _message_id: &str,
            recipient: &str,
            subject: &str,
            body: &str,
        ) -> Result<String, CollaboratorError> {
            self.drafts
                .lock()
                .unwrap()
                .push((recipient.into(), subject.into(), body.into()));
            Ok("draft-1".into())
        }

        async fn send_reply(
            &self,
            _owner: &str,
            _message_id: &str,
            recipient: &str,
            _subject: &str,
            _body: &str,
        ) -> Result<(), CollaboratorError> {
            self.replies.lock().unwrap().push(recipient.into());
            Ok(())
        }
    }

    #[async_trait]
    impl CalendarSurface for Recorder {
        async fn create_event(
            &self,
            _owner: &str,
            event: &CalendarEvent,
        ) -> Result<String, CollaboratorError> {
            if self.fail_calendar {
                return Err(CollaboratorError::Failed {
                    surface: "calendar",
                    reason: "quota exceeded".into(),
                });
            }
            self.events.lock().unwrap().push(event.clone());
            Ok("event-1".into())
        }
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, _owner: &str, text: &str) -> Result<(), CollaboratorError> {
            self.notifications.lock().unwrap().push(text.into());
            Ok(())
        }
    }

    struct Harness {
        db: Arc<LibSqlBackend>,
        recorder: Arc<Recorder>,
        processor: MessageProcessor,
    }

    async fn harness_with(llm: Arc<dyn LlmProvider>, recorder: Recorder) -> Harness {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let recorder = Arc::new(recorder);
        let surfaces = Surfaces {
            labels: recorder.clone(),
            drafts: recorder.clone(),
            calendar: recorder.clone(),
            notifier: recorder.clone(),
        };
        let classifier = Arc::new(Classifier::new(llm, Duration::from_millis(200)));
        let processor = MessageProcessor::new(db.clone(), classifier, surfaces);
        Harness {
            db,
            recorder,
            processor,
        }
    }

    async fn harness(llm: Arc<dyn LlmProvider>) -> Harness {
        harness_with(llm, Recorder::default()).await
    }

    fn message(id: &str, sender: &str, subject: &str, body: &str) -> InboundMessage {
        InboundMessage::new("u1", id, sender, subject, body)
    }

    // ── Input handling ──────────────────────────────────────────────

    #[tokio::test]
    async fn invalid_input_persists_nothing() {
        let h = harness(MockLlm::replying("{}")).await;
        let err = h
            .processor
            .process(message("m1", "", "Hi", "body"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)));
        assert_eq!(h.db.count_outcomes("u1").await.unwrap(), 0);
    }

    // ── Scenarios ───────────────────────────────────────────────────

    #[tokio::test]
    async fn new_category_is_suggested_when_no_rule_matched() {
        let h = harness(MockLlm::replying(
            r#"{"urgency": 3, "category_label": "Finance", "action_label": "Actions/Rien à faire", "reasoning": "statement"}"#,
        ))
        .await;

        let outcome = h
            .processor
            .process(message("m1", "alerts@bank-example.com", "Statement ready", "Your statement is ready."))
            .await
            .unwrap();

        assert_eq!(outcome.labels, vec!["Finance", LABEL_NOTHING_TO_DO]);
        assert_eq!(outcome.suggested_new_label.as_deref(), Some("Finance"));
        assert!(outcome.matched_rule_id.is_none());
        assert_eq!(*h.recorder.labels.lock().unwrap(), vec!["id:Finance"]);
    }

    #[tokio::test]
    async fn vip_rule_raises_priority_and_notifies() {
        let h = harness(MockLlm::replying(
            r#"{"urgency": "medium", "category_label": "Work", "action_label": "Actions/Répondre"}"#,
        ))
        .await;
        let mut rule = Rule::new("u1", None);
        rule.sender_pattern = Some(r"@vip\.example\.com".into());
        rule.priority = PriorityTier::High;
        rule.notify_urgent = Some(true);
        h.db.insert_rule(&rule).await.unwrap();

        let outcome = h
            .processor
            .process(message("m1", "ceo@vip.example.com", "Quick question", "Call me"))
            .await
            .unwrap();

        assert!(outcome.priority >= 7);
        assert!(outcome.decision.notify_urgent);
        assert_eq!(outcome.matched_rule_id, Some(rule.id));
        assert!(outcome.actions.contains(&ActionRecord::NotifySent));
        let notes = h.recorder.notifications.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("ceo@vip.example.com"));
    }

    #[tokio::test]
    async fn newsletter_rule_suppresses_requested_draft() {
        let h = harness(MockLlm::replying(
            r#"{"urgency": 2, "category_label": "Newsletter", "response_type": "draft", "response_body": "Thanks!"}"#,
        ))
        .await;
        let mut rule = Rule::new("u1", Some("Newsletter".into()));
        rule.keywords = vec!["weekly digest".into()];
        rule.exclude_newsletters = Some(true);
        h.db.insert_rule(&rule).await.unwrap();

        let outcome = h
            .processor
            .process(message("m1", "news@site.com", "Your weekly digest", "Top stories"))
            .await
            .unwrap();

        assert!(!outcome.decision.create_draft);
        assert_eq!(outcome.decision.suppressed, Some(Suppression::Newsletter));
        assert!(outcome.draft_id.is_none());
        assert!(h.recorder.drafts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn draft_uses_classifier_body_and_reply_subject() {
        let h = harness(MockLlm::replying(
            r#"{"urgency": 5, "category_label": "Work", "action_label": "Actions/Répondre", "response_type": "draft", "response_body": "Tuesday works."}"#,
        ))
        .await;

        let outcome = h
            .processor
            .process(message("m1", "alice@company.com", "Meeting", "Can we meet Tuesday?"))
            .await
            .unwrap();

        assert_eq!(outcome.draft_id.as_deref(), Some("draft-1"));
        let drafts = h.recorder.drafts.lock().unwrap();
        assert_eq!(
            drafts[0],
            (
                "alice@company.com".to_string(),
                "Re: Meeting".to_string(),
                "Tuesday works.".to_string()
            )
        );
        assert!(h.recorder.replies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rule_forced_draft_uses_template() {
        let h = harness(MockLlm::replying(r#"{"urgency": 4, "category_label": "Support"}"#)).await;
        let mut rule = Rule::new("u1", Some("Support".into()));
        rule.keywords = vec!["ticket".into()];
        rule.create_draft = Some(true);
        rule.response_template = Some("We received your ticket.".into());
        h.db.insert_rule(&rule).await.unwrap();

        h.processor
            .process(message("m1", "bob@client.com", "Ticket #42", "It broke"))
            .await
            .unwrap();

        let drafts = h.recorder.drafts.lock().unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].2, "We received your ticket.");
    }

    #[tokio::test]
    async fn auto_reply_is_sent_once_and_no_draft() {
        let h = harness(MockLlm::replying(
            r#"{"urgency": 3, "category_label": "Receipts", "response_type": "auto_reply"}"#,
        ))
        .await;

        let outcome = h
            .processor
            .process(message("m1", "shop@store.com", "Order received", "Thanks for ordering"))
            .await
            .unwrap();

        assert!(outcome.decision.auto_reply);
        assert!(!outcome.decision.create_draft);
        assert_eq!(*h.recorder.replies.lock().unwrap(), vec!["shop@store.com"]);
        assert!(h.recorder.drafts.lock().unwrap().is_empty());
    }

    // ── Degradation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn classifier_timeout_degrades_to_manual_review() {
        let h = harness(MockLlm::stalled()).await;

        let outcome = h
            .processor
            .process(message("m1", "someone@x.com", "Hello", "Body"))
            .await
            .unwrap();

        assert!(outcome.classification.fallback);
        assert_eq!(outcome.labels, vec![DEFAULT_CATEGORY, LABEL_MANUAL_REVIEW]);
        assert_eq!(outcome.priority, 5);
        assert!(h.db.get_outcome("u1", "m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn classifier_error_still_persists_outcome() {
        let h = harness(MockLlm::failing()).await;
        let outcome = h
            .processor
            .process(message("m1", "someone@x.com", "Hello", "Body"))
            .await
            .unwrap();
        assert!(outcome.classification.fallback);
        assert_eq!(h.db.count_outcomes("u1").await.unwrap(), 1);
        assert_eq!(h.db.llm_cost_summary("u1").await.unwrap().call_count, 0);
    }

    #[tokio::test]
    async fn side_effect_failure_is_recorded_not_fatal() {
        let recorder = Recorder {
            fail_calendar: true,
            ..Default::default()
        };
        let h = harness_with(
            MockLlm::replying(
                r#"{"urgency": 5, "category_label": "Work", "needs_calendar": true,
                    "calendar_event": {"title": "Sync", "start": "2026-03-02T10:00:00Z"}}"#,
            ),
            recorder,
        )
        .await;

        let outcome = h
            .processor
            .process(message("m1", "pm@company.com", "Sync Monday", "10am?"))
            .await
            .unwrap();

        assert!(outcome.decision.create_calendar_event);
        assert!(
            outcome
                .actions
                .iter()
                .any(|a| matches!(a, ActionRecord::CalendarFailed { .. }))
        );
        let activity = h.db.list_activity("u1", 10).await.unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].kind, "calendar_failed");

        let stored = h.db.get_outcome("u1", "m1").await.unwrap().unwrap();
        assert_eq!(stored.actions, outcome.actions);
    }

    // ── Idempotence & accounting ────────────────────────────────────

    #[tokio::test]
    async fn reprocessing_keeps_one_outcome() {
        let h = harness(MockLlm::replying(
            r#"{"urgency": 5, "category_label": "Work", "action_label": "Actions/Répondre"}"#,
        ))
        .await;

        let first = h
            .processor
            .process(message("m1", "a@b.com", "Hi", "Body"))
            .await
            .unwrap();
        let second = h
            .processor
            .process(message("m1", "a@b.com", "Hi", "Body"))
            .await
            .unwrap();

        assert_eq!(h.db.count_outcomes("u1").await.unwrap(), 1);
        assert_eq!(first.labels, second.labels);
        assert_eq!(second.labels, vec!["Work", LABEL_RESPOND]);
    }

    #[tokio::test]
    async fn classifier_usage_is_recorded() {
        let h = harness(MockLlm::replying(r#"{"urgency": 5}"#)).await;
        h.processor
            .process(message("m1", "a@b.com", "Hi", "Body"))
            .await
            .unwrap();

        let summary = h.db.llm_cost_summary("u1").await.unwrap();
        assert_eq!(summary.call_count, 1);
        assert_eq!(summary.total_input_tokens, 100);
    }

    #[tokio::test]
    async fn batch_skips_invalid_messages() {
        let h = harness(MockLlm::replying(r#"{"urgency": 5}"#)).await;
        let results = h
            .processor
            .process_batch(vec![
                message("m1", "a@b.com", "One", "Body"),
                message("", "a@b.com", "Broken", "Body"),
                message("m3", "c@d.com", "Three", "Body"),
            ])
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(h.db.count_outcomes("u1").await.unwrap(), 2);
    }

    // ── Text helpers ────────────────────────────────────────────────

    #[test]
    fn reply_subject_adds_prefix_once() {
        assert_eq!(reply_subject("Meeting"), "Re: Meeting");
        assert_eq!(reply_subject("RE: Meeting"), "RE: Meeting");
    }
}
