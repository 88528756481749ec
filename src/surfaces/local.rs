//! Store-backed collaborator surfaces.
//!
//! Labels, drafts and calendar events are written to the local database so
//! a deployment without mailbox or calendar integrations still has a
//! complete, inspectable record of every action.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::CollaboratorError;
use crate::pipeline::types::CalendarEvent;
use crate::store::{ActivityEntry, Database, StoredDraft, StoredEvent};
use crate::surfaces::smtp::SmtpSender;
use crate::surfaces::{CalendarSurface, DraftSurface, LabelSurface, Notifier};

const DRAFT_STATUS_DRAFT: &str = "draft";
const DRAFT_STATUS_SENT: &str = "sent";

/// Labels kept in the `labels` / `message_labels` tables.
pub struct LocalLabels {
    db: Arc<dyn Database>,
}

impl LocalLabels {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LabelSurface for LocalLabels {
    async fn ensure_label(&self, owner_id: &str, name: &str) -> Result<String, CollaboratorError> {
        Ok(self.db.ensure_label(owner_id, name).await?)
    }

    async fn apply_label(
        &self,
        owner_id: &str,
        message_id: &str,
        label_id: &str,
    ) -> Result<(), CollaboratorError> {
        Ok(self.db.apply_label(owner_id, message_id, label_id).await?)
    }
}

/// Drafts stored for human approval. Cannot send.
pub struct LocalDrafts {
    db: Arc<dyn Database>,
}

impl LocalDrafts {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    async fn store(
        &self,
        owner_id: &str,
        message_id: &str,
        recipient: &str,
        subject: &str,
        body: &str,
        status: &str,
    ) -> Result<String, CollaboratorError> {
        let draft = StoredDraft {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            message_id: message_id.to_string(),
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            status: status.to_string(),
            created_at: Utc::now(),
        };
        self.db.insert_draft(&draft).await?;
        Ok(draft.id)
    }
}

#[async_trait]
impl DraftSurface for LocalDrafts {
    async fn create_draft(
        &self,
        owner_id: &str,
        message_id: &str,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, CollaboratorError> {
        let id = self
            .store(owner_id, message_id, recipient, subject, body, DRAFT_STATUS_DRAFT)
            .await?;
        tracing::info!(owner = %owner_id, message_id = %message_id, draft_id = %id, "Draft stored");
        Ok(id)
    }

    async fn send_reply(
        &self,
        _owner_id: &str,
        _message_id: &str,
        _recipient: &str,
        _subject: &str,
        _body: &str,
    ) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::NotConfigured { surface: "smtp" })
    }
}

/// Stored drafts plus immediate replies over SMTP.
///
/// Sent replies are also recorded in the drafts table with status `sent`.
pub struct MailingDrafts {
    drafts: LocalDrafts,
    sender: SmtpSender,
}

impl MailingDrafts {
    pub fn new(db: Arc<dyn Database>, sender: SmtpSender) -> Self {
        Self {
            drafts: LocalDrafts::new(db),
            sender,
        }
    }
}

#[async_trait]
impl DraftSurface for MailingDrafts {
    async fn create_draft(
        &self,
        owner_id: &str,
        message_id: &str,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, CollaboratorError> {
        self.drafts
            .create_draft(owner_id, message_id, recipient, subject, body)
            .await
    }

    async fn send_reply(
        &self,
        owner_id: &str,
        message_id: &str,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), CollaboratorError> {
        self.sender.send(recipient, subject, body).await?;
        if let Err(e) = self
            .drafts
            .store(owner_id, message_id, recipient, subject, body, DRAFT_STATUS_SENT)
            .await
        {
            tracing::warn!(message_id = %message_id, error = %e, "Reply sent but not recorded");
        }
        Ok(())
    }
}

/// Calendar events kept in the `calendar_events` table.
pub struct LocalCalendar {
    db: Arc<dyn Database>,
}

impl LocalCalendar {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CalendarSurface for LocalCalendar {
    async fn create_event(
        &self,
        owner_id: &str,
        event: &CalendarEvent,
    ) -> Result<String, CollaboratorError> {
        let stored = StoredEvent {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            event: event.clone(),
            created_at: Utc::now(),
        };
        self.db.insert_event(&stored).await?;
        tracing::info!(owner = %owner_id, event_id = %stored.id, title = %event.title, "Calendar event stored");
        Ok(stored.id)
    }
}

/// Notifier that writes alerts to the activity log.
pub struct ActivityNotifier {
    db: Arc<dyn Database>,
}

impl ActivityNotifier {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Notifier for ActivityNotifier {
    async fn notify(&self, owner_id: &str, text: &str) -> Result<(), CollaboratorError> {
        let entry = ActivityEntry::new(owner_id, None, "notification", text);
        self.db.record_activity(&entry).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::store::LibSqlBackend;

    async fn test_db() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn labels_are_created_once_and_applied_idempotently() {
        let db = test_db().await;
        let labels = LocalLabels::new(db.clone());

        let id = labels.ensure_label("u1", "Finance").await.unwrap();
        assert_eq!(labels.ensure_label("u1", "Finance").await.unwrap(), id);
        labels.apply_label("u1", "m1", &id).await.unwrap();
        labels.apply_label("u1", "m1", &id).await.unwrap();

        assert_eq!(db.message_labels("u1", "m1").await.unwrap(), vec!["Finance"]);
    }

    #[tokio::test]
    async fn local_drafts_store_but_cannot_send() {
        let db = test_db().await;
        let drafts = LocalDrafts::new(db.clone());

        let id = drafts
            .create_draft("u1", "m1", "a@b.com", "Re: Hi", "Thanks")
            .await
            .unwrap();
        let stored = db.list_drafts("u1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].status, "draft");

        let err = drafts
            .send_reply("u1", "m1", "a@b.com", "Re: Hi", "Thanks")
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn calendar_event_is_stored() {
        let db = test_db().await;
        let calendar = LocalCalendar::new(db.clone());
        let event = CalendarEvent {
            title: "Quarterly review".into(),
            start: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            duration_minutes: 60,
            location: Some("Room 4".into()),
            attendees: vec![],
            description: None,
        };

        let id = calendar.create_event("u1", &event).await.unwrap();
        let events = db.list_events("u1").await.unwrap();
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].event, event);
    }

    #[tokio::test]
    async fn activity_notifier_logs_text() {
        let db = test_db().await;
        ActivityNotifier::new(db.clone())
            .notify("u1", "Urgent email")
            .await
            .unwrap();
        let entries = db.list_activity("u1", 5).await.unwrap();
        assert_eq!(entries[0].kind, "notification");
        assert_eq!(entries[0].detail, "Urgent email");
    }
}
