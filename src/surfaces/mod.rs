//! External collaborator surfaces: mailbox labels, drafts, calendar, notifications.
//!
//! The pipeline only sees these traits. `local` provides store-backed
//! implementations; `smtp` and `telegram` deliver replies and alerts.

pub mod local;
pub mod smtp;
pub mod telegram;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::pipeline::types::CalendarEvent;

pub use local::{ActivityNotifier, LocalCalendar, LocalDrafts, LocalLabels, MailingDrafts};
pub use smtp::{SmtpConfig, SmtpSender};
pub use telegram::{TelegramConfig, TelegramNotifier};

/// Mailbox label surface.
#[async_trait]
pub trait LabelSurface: Send + Sync {
    /// Look up a label by name, creating it if needed. Returns its id.
    async fn ensure_label(&self, owner_id: &str, name: &str) -> Result<String, CollaboratorError>;

    /// Attach a label to a message. Re-applying is a no-op.
    async fn apply_label(
        &self,
        owner_id: &str,
        message_id: &str,
        label_id: &str,
    ) -> Result<(), CollaboratorError>;
}

/// Draft creation and reply sending.
#[async_trait]
pub trait DraftSurface: Send + Sync {
    /// Store a reply draft for human approval. Returns the draft id.
    async fn create_draft(
        &self,
        owner_id: &str,
        message_id: &str,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, CollaboratorError>;

    /// Send a reply immediately.
    async fn send_reply(
        &self,
        owner_id: &str,
        message_id: &str,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait CalendarSurface: Send + Sync {
    /// Create an event. Returns the event id.
    async fn create_event(
        &self,
        owner_id: &str,
        event: &CalendarEvent,
    ) -> Result<String, CollaboratorError>;
}

/// Best-effort owner notification.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, owner_id: &str, text: &str) -> Result<(), CollaboratorError>;
}

/// The set of collaborators the processor fans out to.
#[derive(Clone)]
pub struct Surfaces {
    pub labels: Arc<dyn LabelSurface>,
    pub drafts: Arc<dyn DraftSurface>,
    pub calendar: Arc<dyn CalendarSurface>,
    pub notifier: Arc<dyn Notifier>,
}
