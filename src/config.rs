//! Configuration types.
//!
//! Process-wide settings come from the environment. Per-owner triage
//! settings live in the `settings` table under [`OWNER_SETTINGS_KEY`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DatabaseError};
use crate::pipeline::decision::DEFAULT_URGENT_THRESHOLD;
use crate::pipeline::labels::VocabularyPolicy;
use crate::store::Database;

/// Settings row key holding an owner's [`OwnerSettings`].
pub const OWNER_SETTINGS_KEY: &str = "triage";

/// Service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    /// Directory for the daily-rolling log file. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    /// Upper bound on one classifier call, retries included.
    pub classifier_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/inbox-triage.db"),
            port: 8080,
            log_dir: None,
            classifier_timeout: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = match lookup("TRIAGE_PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TRIAGE_PORT".to_string(),
                message: format!("expected a port number, got '{raw}'"),
            })?,
            None => defaults.port,
        };

        let classifier_timeout = match lookup("TRIAGE_CLASSIFIER_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "TRIAGE_CLASSIFIER_TIMEOUT_SECS".to_string(),
                    message: format!("expected seconds, got '{raw}'"),
                }
            })?),
            None => defaults.classifier_timeout,
        };

        Ok(Self {
            db_path: lookup("TRIAGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port,
            log_dir: lookup("TRIAGE_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            classifier_timeout,
        })
    }
}

/// Per-owner triage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerSettings {
    /// Free-form instructions appended to the classifier prompt.
    pub system_instructions: String,
    /// Minimum score that triggers an urgent notification.
    pub urgent_threshold: u8,
    pub vocabulary_policy: VocabularyPolicy,
}

impl Default for OwnerSettings {
    fn default() -> Self {
        Self {
            system_instructions: String::new(),
            urgent_threshold: DEFAULT_URGENT_THRESHOLD,
            vocabulary_policy: VocabularyPolicy::default(),
        }
    }
}

impl OwnerSettings {
    /// Load an owner's settings. Missing or malformed values fall back to defaults.
    pub async fn load(db: &dyn Database, owner_id: &str) -> Result<Self, DatabaseError> {
        let Some(value) = db.get_setting(owner_id, OWNER_SETTINGS_KEY).await? else {
            return Ok(Self::default());
        };
        match serde_json::from_value::<Self>(value) {
            Ok(settings) => Ok(settings.clamped()),
            Err(e) => {
                tracing::warn!(owner = %owner_id, error = %e, "Malformed owner settings, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub async fn save(&self, db: &dyn Database, owner_id: &str) -> Result<(), DatabaseError> {
        let value = serde_json::to_value(self.clone().clamped())
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        db.set_setting(owner_id, OWNER_SETTINGS_KEY, &value).await
    }

    fn clamped(mut self) -> Self {
        self.urgent_threshold = self.urgent_threshold.clamp(1, 10);
        self
    }
}
