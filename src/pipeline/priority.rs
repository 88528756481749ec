//! Priority scoring.
//!
//! Urgency arrives either as a number (1–10) or as `high|medium|low`.
//! Strings are mapped to numbers where the classifier output is parsed
//! (high → 8, medium → 5, low → 2) and the score only sees numbers:
//! urgency ≥ 7 counts as high, ≤ 3 as low.

use crate::pipeline::types::{PriorityTier, Sentiment};

const BASE_SCORE: i32 = 5;
pub const HIGH_URGENCY: u8 = 7;
pub const LOW_URGENCY: u8 = 3;

/// Numeric urgency from a classifier JSON value.
///
/// Unknown shapes fall back to medium (5).
pub fn parse_urgency(value: &serde_json::Value) -> u8 {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(|f| f.round().clamp(1.0, 10.0) as u8)
            .unwrap_or(5),
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "high" | "urgent" | "critical" => 8,
            "low" => 2,
            "medium" | "normal" => 5,
            other => other
                .parse::<f64>()
                .map(|f| f.round().clamp(1.0, 10.0) as u8)
                .unwrap_or(5),
        },
        _ => 5,
    }
}

/// Score in [1, 10] from urgency, the best rule's tier and sentiment.
pub fn score(urgency: u8, tier: Option<PriorityTier>, sentiment: Option<Sentiment>) -> u8 {
    let mut score = BASE_SCORE;
    if urgency >= HIGH_URGENCY {
        score += 3;
    } else if urgency <= LOW_URGENCY {
        score -= 2;
    }
    match tier {
        Some(PriorityTier::High) => score += 2,
        Some(PriorityTier::Low) => score -= 2,
        _ => {}
    }
    if sentiment == Some(Sentiment::Negative) {
        score += 1;
    }
    score.clamp(1, 10) as u8
}
