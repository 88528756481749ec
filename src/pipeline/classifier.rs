//! Classifier adapter: one LLM call per message with a safe default.
//!
//! `classify` never fails. Transport errors, timeouts and unparsable
//! output all degrade to `ClassifierResult::fallback`.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::costs::call_cost;
use crate::llm::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider};
use crate::pipeline::priority::parse_urgency;
use crate::pipeline::types::{
    CalendarProposal, ClassifierResult, Correction, InboundMessage, ResponseKind, Rule, Sentiment,
};

/// Max tokens for the classification call.
const CLASSIFY_MAX_TOKENS: u32 = 1024;

/// Max tokens for feedback interpretation.
const FEEDBACK_MAX_TOKENS: u32 = 512;

const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Corrections shown to the model as exemplars.
pub const MAX_CORRECTION_EXAMPLES: usize = 10;

/// Body characters sent to the model.
const BODY_PREVIEW_CHARS: usize = 4000;

/// Per-run classifier context, built from owner settings and store state.
#[derive(Debug, Clone, Default)]
pub struct ClassifierConfig {
    /// Owner-configurable instructions appended to the system prompt.
    pub system_instructions: String,
    /// Known category labels.
    pub vocabulary: Vec<String>,
    /// Most recent first.
    pub recent_corrections: Vec<Correction>,
}

/// Token usage and cost of one classifier call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallUsage {
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
}

/// Classifier output plus the call's usage, when a call completed.
#[derive(Debug, Clone)]
pub struct Classification {
    pub result: ClassifierResult,
    pub usage: Option<CallUsage>,
}

/// What the model made of a free-text correction.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeedbackInterpretation {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// LLM-backed message classifier.
pub struct Classifier {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Classify one message. Falls back to the default result on any failure.
    pub async fn classify(&self, message: &InboundMessage, config: &ClassifierConfig) -> Classification {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(config)),
            ChatMessage::user(build_user_prompt(message)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = match self.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Classifier call failed, using default result"
                );
                return Classification {
                    result: ClassifierResult::fallback(format!("classifier unavailable: {e}")),
                    usage: None,
                };
            }
        };

        let usage = Some(self.usage(&response));
        match parse_classification(&response.content) {
            Ok(result) => {
                debug!(
                    message_id = %message.message_id,
                    urgency = result.urgency,
                    category = result.category.as_deref().unwrap_or("-"),
                    "Message classified"
                );
                Classification { result, usage }
            }
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Unparsable classifier output, using default result"
                );
                Classification {
                    result: ClassifierResult::fallback(format!("unparsable classifier output: {e}")),
                    usage,
                }
            }
        }
    }

    /// Ask the model to turn a correction into rule enrichment.
    pub async fn interpret_feedback(
        &self,
        correction: &Correction,
        free_text: &str,
        rule: Option<&Rule>,
    ) -> Result<(FeedbackInterpretation, CallUsage), LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(FEEDBACK_SYSTEM_PROMPT),
            ChatMessage::user(build_feedback_prompt(correction, free_text, rule)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(FEEDBACK_MAX_TOKENS);

        let response = self.complete(request).await?;
        let usage = self.usage(&response);
        let json = extract_first_json_object(&response.content).ok_or_else(|| {
            LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "no JSON object in feedback response".into(),
            }
        })?;
        let mut parsed: FeedbackInterpretation = serde_json::from_str(json)?;
        parsed.keywords.retain(|k| !k.trim().is_empty());
        parsed.domains.retain(|d| !d.trim().is_empty());
        Ok((parsed, usage))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                timeout: self.timeout,
            })?
    }

    fn usage(&self, response: &CompletionResponse) -> CallUsage {
        CallUsage {
            model: self.llm.model_name().to_string(),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            cost: call_cost(
                self.llm.cost_per_token(),
                response.input_tokens,
                response.output_tokens,
            ),
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(config: &ClassifierConfig) -> String {
    let mut prompt = String::from(
        "You are an email triage engine. Classify the message and respond with ONLY a JSON object:\n\
         {\"urgency\": 1-10, \"category_label\": \"...\", \"matched_label\": \"...\", \"suggested_label\": \"...\", \
         \"action_label\": \"Actions/Répondre | Actions/Revue Manuelle | Actions/Rien à faire\", \
         \"suggested_action\": \"...\", \"reasoning\": \"...\", \"is_phishing\": false, \"is_spam\": false, \
         \"sentiment\": \"positive|neutral|negative\", \"needs_calendar\": false, \
         \"calendar_event\": {\"title\": \"...\", \"start\": \"RFC 3339\", \"duration_minutes\": 60, \"location\": \"...\", \"attendees\": [], \"description\": \"...\"}, \
         \"notify_urgent\": false, \"needs_response\": false, \"response_type\": \"none|draft|auto_reply\", \
         \"response_reasoning\": \"...\", \"response_body\": \"...\"}\n\n\
         Rules:\n\
         - Use matched_label when one of the existing labels fits; otherwise put a new label in suggested_label\n\
         - Never fill both matched_label and suggested_label\n\
         - Only propose auto_reply for routine acknowledgements\n\
         - Omit fields that don't apply\n",
    );

    if !config.vocabulary.is_empty() {
        prompt.push_str("\nExisting labels:\n");
        for label in &config.vocabulary {
            prompt.push_str(&format!("- {label}\n"));
        }
    }

    let corrections: Vec<&Correction> = config
        .recent_corrections
        .iter()
        .take(MAX_CORRECTION_EXAMPLES)
        .collect();
    if !corrections.is_empty() {
        prompt.push_str("\nRecent corrections from the user (most recent first):\n");
        for c in corrections {
            prompt.push_str(&format!(
                "- \"{}\" was relabeled \"{}\": {}\n",
                c.old_label, c.new_label, c.reason
            ));
        }
    }

    let instructions = config.system_instructions.trim();
    if !instructions.is_empty() {
        prompt.push_str("\nAdditional instructions:\n");
        prompt.push_str(instructions);
        prompt.push('\n');
    }
    prompt
}

fn build_user_prompt(message: &InboundMessage) -> String {
    let body_preview: String = message.body.chars().take(BODY_PREVIEW_CHARS).collect();
    format!(
        "From: {}\nSubject: {}\nReceived: {}\n\n{}",
        message.sender,
        message.subject,
        message.received_at.to_rfc3339(),
        body_preview
    )
}

const FEEDBACK_SYSTEM_PROMPT: &str = "You turn a user's email label correction into rule hints. \
     Respond with ONLY a JSON object: {\"description\": \"one short sentence\", \
     \"keywords\": [\"...\"], \"domains\": [\"example.com\"]}. \
     Keywords are short phrases that identify such messages. Domains are sender domains.";

fn build_feedback_prompt(correction: &Correction, free_text: &str, rule: Option<&Rule>) -> String {
    let mut prompt = format!(
        "Old label: {}\nNew label: {}\nReason: {}\n",
        correction.old_label, correction.new_label, correction.reason
    );
    if !free_text.trim().is_empty() {
        prompt.push_str(&format!("User notes: {}\n", free_text.trim()));
    }
    if let Some(rule) = rule {
        if !rule.keywords.is_empty() {
            prompt.push_str(&format!("Existing keywords: {}\n", rule.keywords.join(", ")));
        }
        if let Some(ref pattern) = rule.sender_pattern {
            prompt.push_str(&format!("Existing sender pattern: {pattern}\n"));
        }
    }
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

/// Wire shape of the classifier JSON. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawClassification {
    urgency: serde_json::Value,
    #[serde(alias = "category")]
    category_label: Option<String>,
    action_label: Option<String>,
    suggested_action: Option<String>,
    reasoning: Option<String>,
    is_phishing: Option<bool>,
    is_spam: Option<bool>,
    matched_label: Option<String>,
    suggested_label: Option<String>,
    sentiment: Option<String>,
    needs_calendar: Option<bool>,
    calendar_event: serde_json::Value,
    notify_urgent: Option<bool>,
    needs_response: Option<bool>,
    #[serde(alias = "response_kind")]
    response_type: Option<String>,
    response_reasoning: Option<String>,
    response_body: Option<String>,
}

fn parse_response_kind(raw: Option<&str>) -> ResponseKind {
    match raw.map(|s| s.trim().to_lowercase()).as_deref() {
        Some("draft") => ResponseKind::Draft,
        Some("auto_reply") | Some("auto-reply") | Some("autoreply") => ResponseKind::AutoReply,
        _ => ResponseKind::None,
    }
}

fn parse_sentiment(raw: Option<&str>) -> Option<Sentiment> {
    match raw.map(|s| s.trim().to_lowercase()).as_deref() {
        Some("positive") => Some(Sentiment::Positive),
        Some("neutral") => Some(Sentiment::Neutral),
        Some("negative") => Some(Sentiment::Negative),
        _ => None,
    }
}

/// Read a calendar proposal without letting one odd field sink the whole
/// classification: nulls are absent, durations may be numeric strings and
/// non-string attendees are dropped.
fn parse_calendar_proposal(value: &serde_json::Value) -> Option<CalendarProposal> {
    let obj = value.as_object()?;
    let text = |key: &str| {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let duration_minutes = obj.get("duration_minutes").and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.round() as u64)),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as u64),
        _ => None,
    });
    let attendees = obj.get("attendees").and_then(|v| match v {
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect(),
        ),
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(vec![s.trim().to_string()]),
        _ => None,
    });

    Some(CalendarProposal {
        title: text("title"),
        start: text("start"),
        duration_minutes: duration_minutes.and_then(|d| u32::try_from(d).ok()),
        location: text("location"),
        attendees,
        description: text("description"),
    })
}

/// Parse model output into a normalized `ClassifierResult`.
pub(crate) fn parse_classification(raw: &str) -> Result<ClassifierResult, String> {
    let json = extract_first_json_object(raw).ok_or_else(|| "no JSON object found".to_string())?;
    let parsed: RawClassification =
        serde_json::from_str(json).map_err(|e| format!("JSON parse error: {e}"))?;

    let response_kind = parse_response_kind(parsed.response_type.as_deref());
    let result = ClassifierResult {
        urgency: parse_urgency(&parsed.urgency),
        category: parsed.category_label,
        action_label: parsed.action_label,
        suggested_action: parsed.suggested_action,
        reasoning: parsed.reasoning.unwrap_or_default(),
        is_phishing: parsed.is_phishing.unwrap_or(false),
        is_spam: parsed.is_spam.unwrap_or(false),
        matched_label: parsed.matched_label,
        suggested_label: parsed.suggested_label,
        sentiment: parse_sentiment(parsed.sentiment.as_deref()),
        needs_calendar: parsed.needs_calendar.unwrap_or(false),
        calendar: parse_calendar_proposal(&parsed.calendar_event),
        notify_urgent: parsed.notify_urgent.unwrap_or(false),
        needs_response: parsed
            .needs_response
            .unwrap_or(response_kind != ResponseKind::None),
        response_kind,
        response_reasoning: parsed.response_reasoning.unwrap_or_default(),
        response_body: parsed.response_body,
        fallback: false,
    };
    Ok(result.normalize())
}

/// The first balanced `{...}` span in `text`.
///
/// Braces inside JSON strings (including escaped quotes) are ignored.
pub(crate) fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::FinishReason;
    use crate::pipeline::types::{DEFAULT_CATEGORY, LABEL_MANUAL_REVIEW};

    /// Mock LLM that returns a fixed response after an optional delay.
    struct MockLlm {
        response: Result<String, ()>,
        delay: Duration,
    }

    #[async_trait::async_trait]
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
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 100,
                    output_tokens: 50,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(()) => Err(LlmError::ServerError {
                    provider: "mock".into(),
                    status: 503,
                }),
            }
        }
    }

    fn classifier(response: Result<&str, ()>, delay: Duration) -> Classifier {
        Classifier::new(
            Arc::new(MockLlm {
                response: response.map(str::to_string),
                delay,
            }),
            Duration::from_millis(50),
        )
    }

    fn message() -> InboundMessage {
        InboundMessage::new("owner", "m-1", "alerts@bank-example.com", "Statement ready", "Your statement is ready.")
    }

    // ── JSON extraction ─────────────────────────────────────────────

    #[test]
    fn extracts_first_balanced_object() {
        let text = "Sure: {\"a\": {\"b\": 1}} and {\"c\": 2}";
        assert_eq!(extract_first_json_object(text), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let text = r#"```json
{"reasoning": "uses } and { and \" quotes", "urgency": 3}
```"#;
        let json = extract_first_json_object(text).unwrap();
        let v: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(v["urgency"], 3);
    }

    #[test]
    fn unbalanced_input_yields_none() {
        assert_eq!(extract_first_json_object("{\"a\": 1"), None);
        assert_eq!(extract_first_json_object("no json here"), None);
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parses_full_result() {
        let raw = r#"{"urgency": "high", "category_label": "Finance", "action_label": "Actions/Rien à faire",
            "sentiment": "negative", "response_type": "draft", "is_spam": false,
            "needs_calendar": true, "calendar_event": {"title": "Call", "start": "2025-07-01T09:00:00Z"}}"#;
        let r = parse_classification(raw).unwrap();
        assert_eq!(r.urgency, 8);
        assert_eq!(r.category.as_deref(), Some("Finance"));
        assert_eq!(r.sentiment, Some(Sentiment::Negative));
        assert_eq!(r.response_kind, ResponseKind::Draft);
        assert!(r.needs_response);
        assert!(r.calendar.unwrap().to_event().is_some());
        assert!(!r.fallback);
    }

    #[test]
    fn null_attendees_keep_the_classification() {
        let raw = r#"{"urgency": 9, "category_label": "Work", "needs_calendar": true,
            "calendar_event": {"title": "Call", "start": "2025-07-01T09:00:00Z", "attendees": null}}"#;
        let r = parse_classification(raw).unwrap();
        assert_eq!(r.urgency, 9);
        assert_eq!(r.category.as_deref(), Some("Work"));
        let event = r.calendar.unwrap().to_event().unwrap();
        assert!(event.attendees.is_empty());
    }

    #[test]
    fn duration_as_string_is_accepted() {
        let raw = r#"{"urgency": 6, "category_label": "Work", "needs_calendar": true,
            "calendar_event": {"title": "Call", "start": "2025-07-01T09:00:00Z", "duration_minutes": "45"}}"#;
        let r = parse_classification(raw).unwrap();
        assert_eq!(r.urgency, 6);
        assert_eq!(r.calendar.unwrap().to_event().unwrap().duration_minutes, 45);
    }

    #[test]
    fn calendar_that_is_not_an_object_is_ignored() {
        let r = parse_classification(r#"{"urgency": 4, "calendar_event": "tomorrow"}"#).unwrap();
        assert_eq!(r.urgency, 4);
        assert!(r.calendar.is_none());
    }

    #[test]
    fn none_kind_clears_response_need() {
        let r = parse_classification(r#"{"urgency": 4, "needs_response": true, "response_type": "none"}"#)
            .unwrap();
        assert!(!r.needs_response);
    }

    #[test]
    fn both_labels_keep_matched_only() {
        let r = parse_classification(r#"{"matched_label": "Work", "suggested_label": "Jobs"}"#).unwrap();
        assert_eq!(r.matched_label.as_deref(), Some("Work"));
        assert!(r.suggested_label.is_none());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse_classification("I think this is spam").is_err());
        assert!(parse_classification("{\"urgency\": [}").is_err());
    }

    // ── Prompt ──────────────────────────────────────────────────────

    #[test]
    fn system_prompt_includes_context() {
        let corrections: Vec<Correction> = (0..12)
            .map(|i| Correction::new("o", format!("m{i}"), "A", format!("B{i}"), format!("reason {i}")))
            .collect();
        let config = ClassifierConfig {
            system_instructions: "Be strict about invoices.".into(),
            vocabulary: vec!["Work".into(), "Finance".into()],
            recent_corrections: corrections,
        };
        let prompt = build_system_prompt(&config);
        assert!(prompt.contains("- Work"));
        assert!(prompt.contains("Be strict about invoices."));
        assert!(prompt.contains("reason 9"));
        assert!(!prompt.contains("reason 10"));
    }

    // ── Adapter behavior ────────────────────────────────────────────

    #[tokio::test]
    async fn successful_call_reports_usage() {
        let c = classifier(Ok(r#"{"urgency": 6, "category_label": "Finance"}"#), Duration::ZERO);
        let out = c.classify(&message(), &ClassifierConfig::default()).await;
        assert_eq!(out.result.urgency, 6);
        let usage = out.usage.unwrap();
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.cost, Decimal::new(2, 4));
    }

    #[tokio::test]
    async fn remote_failure_yields_default() {
        let c = classifier(Err(()), Duration::ZERO);
        let out = c.classify(&message(), &ClassifierConfig::default()).await;
        assert!(out.result.fallback);
        assert_eq!(out.result.urgency, 5);
        assert_eq!(out.result.category.as_deref(), Some(DEFAULT_CATEGORY));
        assert_eq!(out.result.action_label.as_deref(), Some(LABEL_MANUAL_REVIEW));
        assert!(out.usage.is_none());
    }

    #[tokio::test]
    async fn timeout_yields_default() {
        let c = classifier(Ok("{}"), Duration::from_secs(5));
        let out = c.classify(&message(), &ClassifierConfig::default()).await;
        assert!(out.result.fallback);
        assert!(!out.result.needs_response);
    }

    #[tokio::test]
    async fn unparsable_output_yields_default_with_usage() {
        let c = classifier(Ok("not json"), Duration::ZERO);
        let out = c.classify(&message(), &ClassifierConfig::default()).await;
        assert!(out.result.fallback);
        assert!(out.usage.is_some());
    }

    #[tokio::test]
    async fn feedback_interpretation_parses() {
        let c = classifier(
            Ok(r#"{"description": "Bank statements", "keywords": ["statement", ""], "domains": ["bank-example.com"]}"#),
            Duration::ZERO,
        );
        let correction = Correction::new("o", "m", "A", "Finance", "statements are finance");
        let (interp, _) = c.interpret_feedback(&correction, "", None).await.unwrap();
        assert_eq!(interp.keywords, vec!["statement"]);
        assert_eq!(interp.domains, vec!["bank-example.com"]);
    }
}
