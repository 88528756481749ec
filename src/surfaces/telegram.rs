//! Telegram notifier: sends urgent-message alerts through the Bot API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::CollaboratorError;
use crate::surfaces::Notifier;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram notifier configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Chat that receives every alert.
    pub chat_id: String,
    pub api_base: String,
}

impl TelegramConfig {
    /// Returns `None` unless both `TELEGRAM_BOT_TOKEN` and `TELEGRAM_CHAT_ID` are set.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = lookup("TELEGRAM_BOT_TOKEN").filter(|s| !s.trim().is_empty())?;
        let chat_id = lookup("TELEGRAM_CHAT_ID").filter(|s| !s.trim().is_empty())?;
        Some(Self {
            bot_token: SecretString::from(bot_token),
            chat_id,
            api_base: lookup("TELEGRAM_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }
}

pub struct TelegramNotifier {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token.expose_secret()
        )
    }

    /// Send a single chunk, Markdown first with a plain-text fallback.
    async fn send_message_chunk(&self, text: &str) -> Result<(), CollaboratorError> {
        let markdown_body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(send_failed)?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(send_failed)?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(CollaboratorError::Failed {
                surface: "notifier",
                reason: format!(
                    "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
                ),
            });
        }
        Ok(())
    }
}

fn send_failed(e: reqwest::Error) -> CollaboratorError {
    CollaboratorError::Failed {
        surface: "notifier",
        reason: e.to_string(),
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, owner_id: &str, text: &str) -> Result<(), CollaboratorError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(&chunk).await?;
        }
        tracing::info!(owner = %owner_id, "Telegram notification sent");
        Ok(())
    }
}

/// Split text into chunks of at most `max_len` bytes, preferring newline
/// then space boundaries and never cutting inside a character.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_token_and_chat() {
        assert!(TelegramConfig::from_lookup(|_| None).is_none());
        assert!(
            TelegramConfig::from_lookup(|k| (k == "TELEGRAM_BOT_TOKEN").then(|| "t".to_string()))
                .is_none()
        );

        let config = TelegramConfig::from_lookup(|k| match k {
            "TELEGRAM_BOT_TOKEN" => Some("123:abc".into()),
            "TELEGRAM_CHAT_ID" => Some("42".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.chat_id, "42");
        assert_eq!(config.api_base, DEFAULT_API_BASE);
    }

    #[test]
    fn api_url_includes_token() {
        let notifier = TelegramNotifier::new(TelegramConfig {
            bot_token: SecretString::from("123:abc".to_string()),
            chat_id: "42".into(),
            api_base: "https://tg.example/".into(),
        });
        assert_eq!(
            notifier.api_url("sendMessage"),
            "https://tg.example/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello", 4096), vec!["Hello"]);
    }

    #[test]
    fn split_message_prefers_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2000);
        assert_eq!(chunks[1].len(), 3000);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "é".repeat(10);
        let chunks = split_message(&msg, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), msg);
    }
}
