//! SMTP reply sender built on `lettre`.
//!
//! `lettre`'s blocking transport runs on the blocking thread pool so the
//! async pipeline never stalls on network I/O.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::error::CollaboratorError;

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `SMTP_HOST` is not set (sending disabled).
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("SMTP_HOST").filter(|s| !s.trim().is_empty())?;
        let port: u16 = lookup("SMTP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = lookup("SMTP_USERNAME").unwrap_or_default();
        let password = lookup("SMTP_PASSWORD").unwrap_or_default();
        let from_address = lookup("SMTP_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        Some(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            from_address,
        })
    }
}

/// Sends plain-text replies over an authenticated SMTP relay.
#[derive(Debug, Clone)]
pub struct SmtpSender {
    config: SmtpConfig,
}

impl SmtpSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    pub async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), CollaboratorError> {
        let email = build_message(&self.config.from_address, to, subject, body)?;
        let config = self.config.clone();
        let to = to.to_string();

        tokio::task::spawn_blocking(move || send_blocking(&config, &email))
            .await
            .map_err(|e| smtp_failed(format!("SMTP task panicked: {e}")))??;

        tracing::info!(to = %to, "Reply sent");
        Ok(())
    }
}

fn smtp_failed(reason: String) -> CollaboratorError {
    CollaboratorError::Failed {
        surface: "smtp",
        reason,
    }
}

fn build_message(from: &str, to: &str, subject: &str, body: &str) -> Result<Message, CollaboratorError> {
    Message::builder()
        .from(
            from.parse()
                .map_err(|e| smtp_failed(format!("Invalid from address: {e}")))?,
        )
        .to(to
            .parse()
            .map_err(|e| smtp_failed(format!("Invalid to address: {e}")))?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| smtp_failed(format!("Failed to build email: {e}")))
}

fn send_blocking(config: &SmtpConfig, email: &Message) -> Result<(), CollaboratorError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.host)
        .map_err(|e| smtp_failed(format!("SMTP relay error: {e}")))?
        .port(config.port)
        .credentials(creds)
        .build();

    transport
        .send(email)
        .map_err(|e| smtp_failed(format!("SMTP send failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_absent_without_host() {
        assert!(SmtpConfig::from_lookup(|_| None).is_none());
    }

    #[test]
    fn config_defaults_port_and_from() {
        let config = SmtpConfig::from_lookup(|k| match k {
            "SMTP_HOST" => Some("smtp.example.com".into()),
            "SMTP_USERNAME" => Some("me@example.com".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.port, 587);
        assert_eq!(config.from_address, "me@example.com");
    }

    #[test]
    fn build_message_rejects_bad_recipient() {
        let err = build_message("me@example.com", "not an address", "Re: Hi", "Thanks").unwrap_err();
        assert!(err.to_string().contains("Invalid to address"));
    }

    #[test]
    fn build_message_accepts_valid_addresses() {
        assert!(build_message("me@example.com", "you@example.com", "Re: Hi", "Thanks").is_ok());
    }
}
