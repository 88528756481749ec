//! REST endpoints for message intake, outcomes, corrections, rules and settings.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OwnerSettings;
use crate::error::{DatabaseError, PipelineError, ReinforceError};
use crate::feedback::{self, Reinforcer};
use crate::pipeline::MessageProcessor;
use crate::pipeline::labels::VocabularyPolicy;
use crate::pipeline::types::{Correction, InboundMessage, PriorityTier, Rule};
use crate::store::Database;

const ACTIVITY_PAGE: usize = 50;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub processor: Arc<MessageProcessor>,
    pub reinforcer: Arc<Reinforcer>,
}

/// Build the Axum router with every REST route.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/messages", post(process_message))
        .route("/api/messages/raw", post(process_raw_message))
        .route("/api/messages/batch", post(process_batch))
        .route("/api/outcomes/{owner}/{message_id}", get(get_outcome))
        .route(
            "/api/outcomes/{owner}/{message_id}/correction",
            post(submit_correction),
        )
        .route("/api/rules/{owner}", get(list_rules).post(create_rule))
        .route("/api/rules/{owner}/{id}", put(update_rule).delete(delete_rule))
        .route("/api/settings/{owner}", get(get_settings).put(put_settings))
        .route("/api/activity/{owner}", get(list_activity))
        .route("/api/usage/{owner}", get(usage_summary))
        .layer(cors)
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Handler error rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => {
                warn!(error = %m, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Input(m) => ApiError::BadRequest(m),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ReinforceError> for ApiError {
    fn from(e: ReinforceError) -> Self {
        match e {
            ReinforceError::MissingReason | ReinforceError::NoCategoryLabel => {
                ApiError::BadRequest(e.to_string())
            }
            ReinforceError::OutcomeNotFound { .. } => ApiError::NotFound(e.to_string()),
            ReinforceError::Database(db) => db.into(),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "inbox-triage"
    }))
}

// ── Messages ────────────────────────────────────────────────────────────

async fn process_message(
    State(state): State<AppState>,
    Json(message): Json<InboundMessage>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.processor.process(message).await?;
    Ok(Json(outcome))
}

/// Each message is processed on its own; failures are logged and left out.
async fn process_batch(
    State(state): State<AppState>,
    Json(messages): Json<Vec<InboundMessage>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.processor.process_batch(messages).await))
}

#[derive(Deserialize)]
struct RawParams {
    owner: String,
}

/// POST /api/messages/raw?owner=...
///
/// Body is a raw RFC 822 message.
async fn process_raw_message(
    State(state): State<AppState>,
    Query(params): Query<RawParams>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let message = InboundMessage::from_rfc822(&params.owner, &body)?;
    let outcome = state.processor.process(message).await?;
    Ok(Json(outcome))
}

// ── Outcomes & corrections ──────────────────────────────────────────────

async fn get_outcome(
    State(state): State<AppState>,
    Path((owner, message_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    match state.db.get_outcome(&owner, &message_id).await? {
        Some(outcome) => Ok(Json(outcome)),
        None => Err(ApiError::NotFound(format!("No outcome for message {message_id}"))),
    }
}

#[derive(Deserialize)]
struct CorrectionRequest {
    old_label: String,
    new_label: String,
    reason: String,
    /// Optional free-text explanation for the AI-interpreted path.
    #[serde(default)]
    feedback: Option<String>,
}

/// Commit the correction now; reinforcement runs in the background.
async fn submit_correction(
    State(state): State<AppState>,
    Path((owner, message_id)): Path<(String, String)>,
    Json(body): Json<CorrectionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let correction = Correction::new(owner, message_id, body.old_label, body.new_label, body.reason);
    let outcome = feedback::commit_correction(state.db.as_ref(), &correction).await?;

    feedback::spawn_reinforcement(
        Arc::clone(&state.db),
        Arc::clone(&state.reinforcer),
        correction,
        body.feedback,
    );
    Ok(Json(outcome))
}

// ── Rules ───────────────────────────────────────────────────────────────

async fn list_rules(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_rules(&owner).await?))
}

#[derive(Deserialize)]
struct RuleRequest {
    #[serde(default)]
    sender_pattern: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    label_to_apply: Option<String>,
    #[serde(default)]
    priority: PriorityTier,
    #[serde(default)]
    create_draft: Option<bool>,
    #[serde(default)]
    auto_reply: Option<bool>,
    #[serde(default)]
    notify_urgent: Option<bool>,
    #[serde(default)]
    response_template: Option<String>,
    #[serde(default)]
    exclude_newsletters: Option<bool>,
    #[serde(default)]
    exclude_marketing: Option<bool>,
    #[serde(default)]
    description: String,
    /// Only read on update; new rules start active.
    #[serde(default)]
    is_active: Option<bool>,
    /// Only read on update; new rules go last.
    #[serde(default)]
    rule_order: Option<i64>,
}

impl RuleRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if let Some(pattern) = &self.sender_pattern
            && let Err(e) = regex::Regex::new(pattern)
        {
            return Err(ApiError::BadRequest(format!("Invalid sender_pattern: {e}")));
        }
        Ok(())
    }

    /// Copy the editable fields onto `rule`.
    fn apply(self, rule: &mut Rule) {
        rule.label_to_apply = self.label_to_apply;
        rule.sender_pattern = self.sender_pattern;
        rule.keywords = self.keywords;
        rule.priority = self.priority;
        rule.create_draft = self.create_draft;
        rule.auto_reply = self.auto_reply;
        rule.notify_urgent = self.notify_urgent;
        rule.response_template = self.response_template;
        rule.exclude_newsletters = self.exclude_newsletters;
        rule.exclude_marketing = self.exclude_marketing;
        rule.description = self.description;
        if let Some(active) = self.is_active {
            rule.is_active = active;
        }
        if let Some(order) = self.rule_order {
            rule.rule_order = order;
        }
    }
}

async fn create_rule(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(body): Json<RuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    body.validate()?;

    let mut rule = Rule::new(&owner, None);
    body.apply(&mut rule);
    rule.is_active = true;
    rule.rule_order = state.db.next_rule_order(&owner).await?;

    state.db.insert_rule(&rule).await?;
    info!(owner = %owner, rule_id = %rule.id, "Rule created");
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<AppState>,
    Path((owner, id)): Path<(String, Uuid)>,
    Json(body): Json<RuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    body.validate()?;

    let mut rule = state
        .db
        .get_rule(&owner, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("rule {id} not found")))?;
    body.apply(&mut rule);

    state.db.update_rule(&rule).await?;
    info!(owner = %owner, rule_id = %id, "Rule updated");
    Ok(Json(state.db.get_rule(&owner, id).await?.unwrap_or(rule)))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path((owner, id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.db.delete_rule(&owner, id).await? {
        return Err(ApiError::NotFound(format!("rule {id} not found")));
    }
    info!(owner = %owner, rule_id = %id, "Rule deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ── Settings ────────────────────────────────────────────────────────────

async fn get_settings(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(OwnerSettings::load(state.db.as_ref(), &owner).await?))
}

#[derive(Deserialize)]
struct SettingsRequest {
    #[serde(default)]
    system_instructions: Option<String>,
    #[serde(default)]
    urgent_threshold: Option<u8>,
    #[serde(default)]
    vocabulary_policy: Option<VocabularyPolicy>,
}

/// Merge the provided fields into the stored settings.
async fn put_settings(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(body): Json<SettingsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut settings = OwnerSettings::load(state.db.as_ref(), &owner).await?;
    if let Some(instructions) = body.system_instructions {
        settings.system_instructions = instructions;
    }
    if let Some(threshold) = body.urgent_threshold {
        settings.urgent_threshold = threshold;
    }
    if let Some(policy) = body.vocabulary_policy {
        settings.vocabulary_policy = policy;
    }
    settings.save(state.db.as_ref(), &owner).await?;

    // Reload so the response reflects clamping.
    Ok(Json(OwnerSettings::load(state.db.as_ref(), &owner).await?))
}

// ── Activity & usage ────────────────────────────────────────────────────

async fn list_activity(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_activity(&owner, ACTIVITY_PAGE).await?))
}

async fn usage_summary(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.llm_cost_summary(&owner).await?))
}
