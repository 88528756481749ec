//! Persistence layer: libSQL-backed storage for rules, outcomes and more.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ActivityEntry, Database, LlmCallRecord, LlmCostSummary, StoredDraft, StoredEvent,
};
