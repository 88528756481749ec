//! Message triage pipeline.
//!
//! Every inbound message flows through:
//! 1. `RulesEngine::evaluate()`: deterministic owner rules (no LLM)
//! 2. `Classifier::classify()`: LLM classification, degrading to a default result
//! 3. label resolution, priority scoring and the action decision
//! 4. `MessageProcessor`: outcome persistence and side-effect fan-out

pub mod classifier;
pub mod decision;
pub mod labels;
pub mod priority;
pub mod processor;
pub mod rules;
pub mod types;

pub use classifier::Classifier;
pub use processor::MessageProcessor;
pub use rules::RulesEngine;
