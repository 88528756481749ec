//! Error types for inbox-triage.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Reinforcement error: {0}")]
    Reinforce(#[from] ReinforceError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} returned server error {status}")]
    ServerError { provider: String, status: u16 },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from an external side-effect surface (labels, drafts, calendar, notifications).
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{surface} surface failed: {reason}")]
    Failed {
        surface: &'static str,
        reason: String,
    },

    #[error("{surface} surface is not configured")]
    NotConfigured { surface: &'static str },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Fatal pipeline errors.
///
/// Classification failures never appear here; they degrade to a default
/// result inside the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),
}

/// Errors raised while turning a correction into a rule change.
#[derive(Debug, thiserror::Error)]
pub enum ReinforceError {
    #[error("Correction reason is required")]
    MissingReason,

    #[error("No outcome for message {message_id} (owner {owner_id})")]
    OutcomeNotFound { owner_id: String, message_id: String },

    #[error("Corrected label set has no category label")]
    NoCategoryLabel,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
