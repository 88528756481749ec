//! Inbox Triage: rule-driven email classification and action orchestration.

pub mod api;
pub mod config;
pub mod error;
pub mod feedback;
pub mod llm;
pub mod pipeline;
pub mod store;
pub mod surfaces;
