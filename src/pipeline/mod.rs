//! Three-stage knowledge extraction.
//!
//! Conversation slices flow through:
//! 1. Scan: one job per category detects candidates
//! 2. Match: each candidate is resolved against stored entities
//! 3. Update: the entity is created or merged into the knowledge base
//!
//! Each stage is a queued LLM job; the `ResponseRouter` turns a completed
//! job into the next stage's job via the `ExtractionOrchestrator`.

pub mod orchestrator;
pub mod prompts;
pub mod router;
pub mod types;

pub use orchestrator::ExtractionOrchestrator;
pub use prompts::Prompt;
pub use router::ResponseRouter;
pub use types::{
    Candidate, Category, ConversationMessage, ExtractionContext, JobPayload, MatchResolution,
    MatchedItem,
};
