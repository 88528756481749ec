//! LLM integration for inbox-triage.
//!
//! The classifier talks to a hosted completion endpoint through the
//! `LlmProvider` trait. Anthropic is reached through rig-core's client via
//! `RigAdapter`, wrapped in a `RetryProvider` for transient failures.

pub mod costs;
pub mod provider;
pub(crate) mod retry;
mod rig_adapter;

pub use provider::*;
pub use retry::{RetryConfig, RetryProvider};
pub use rig_adapter::RigAdapter;

use std::sync::Arc;
use std::time::Duration;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, LlmError};

const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
    /// Per-HTTP-request timeout.
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl LlmConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("ANTHROPIC_API_KEY")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;

        let model = lookup("TRIAGE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let request_timeout_secs: u64 = match lookup("TRIAGE_LLM_TIMEOUT_SECS") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TRIAGE_LLM_TIMEOUT_SECS".to_string(),
                message: format!("expected seconds, got '{raw}'"),
            })?,
            None => 20,
        };

        let max_retries: u32 = lookup("TRIAGE_LLM_MAX_RETRIES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        Ok(Self {
            api_key: SecretString::from(api_key),
            model,
            request_timeout: Duration::from_secs(request_timeout_secs),
            retry: RetryConfig {
                max_retries,
                ..RetryConfig::default()
            },
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = create_anthropic_provider(config)?;
    Ok(Arc::new(RetryProvider::new(provider, config.retry.clone())))
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(
        model,
        &config.model,
        "anthropic",
        config.request_timeout,
    )))
}
