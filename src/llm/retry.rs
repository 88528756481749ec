//! Retry wrapper for LLM providers: exponential backoff with jitter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::warn;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Backoff policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Whether an error is worth another attempt.
pub(crate) fn is_retryable(err: &LlmError) -> bool {
    matches!(
        err,
        LlmError::RateLimited { .. } | LlmError::ServerError { .. } | LlmError::RequestFailed { .. }
    )
}

/// Delay before retry number `attempt` (0-based).
///
/// Honors a provider `retry-after` hint when present, otherwise doubles the
/// base delay per attempt and adds up to 25% random jitter.
pub(crate) fn retry_delay(config: &RetryConfig, attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(hint) = retry_after {
        return hint.min(config.max_delay);
    }
    let exp = config
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(config.max_delay);
    let jitter_ms = (exp.as_millis() as u64) / 4;
    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_ms)
    } else {
        0
    };
    (exp + Duration::from_millis(jitter)).min(config.max_delay)
}

/// Wraps a provider and retries transient failures.
pub struct RetryProvider {
    inner: Arc<dyn LlmProvider>,
    config: RetryConfig,
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmProvider for RetryProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        self.inner.cost_per_token()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.config.max_retries && is_retryable(&e) => {
                    let retry_after = match &e {
                        LlmError::RateLimited { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    let delay = retry_delay(&self.config, attempt, retry_after);
                    warn!(
                        model = self.inner.model_name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LLM call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
