//! Shared types for the extraction pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::ChatMessage;
use crate::queue::job::NextStep;

// ── Categories ──────────────────────────────────────────────────────

/// The four kinds of knowledge the pipeline extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Fact,
    Trait,
    Topic,
    Person,
}

impl Category {
    pub const ALL: [Category; 4] = [Self::Fact, Self::Trait, Self::Topic, Self::Person];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Trait => "trait",
            Self::Topic => "topic",
            Self::Person => "person",
        }
    }

    /// Key holding this category's candidates in a scan response.
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Fact => "facts",
            Self::Trait => "traits",
            Self::Topic => "topics",
            Self::Person => "people",
        }
    }

    pub fn scan_step(&self) -> NextStep {
        match self {
            Self::Fact => NextStep::FactScan,
            Self::Trait => NextStep::TraitScan,
            Self::Topic => NextStep::TopicScan,
            Self::Person => NextStep::PersonScan,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Conversation ────────────────────────────────────────────────────

/// One message of conversation fed to extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    /// Who said it (the subject's display name, or the human's).
    pub speaker: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(id: impl Into<String>, speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            speaker: speaker.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Input to one extraction pass. Carried by value through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionContext {
    pub subject_id: String,
    pub subject_display_name: String,
    /// Earlier conversation, background only.
    #[serde(default)]
    pub messages_context: Vec<ConversationMessage>,
    /// The slice to mine.
    #[serde(default)]
    pub messages_analyze: Vec<ConversationMessage>,
}

impl ExtractionContext {
    pub fn new(subject_id: impl Into<String>, subject_display_name: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            subject_display_name: subject_display_name.into(),
            messages_context: Vec::new(),
            messages_analyze: Vec::new(),
        }
    }

    pub fn with_context(mut self, messages: Vec<ConversationMessage>) -> Self {
        self.messages_context = messages;
        self
    }

    pub fn with_analyze(mut self, messages: Vec<ConversationMessage>) -> Self {
        self.messages_analyze = messages;
        self
    }
}

// ── Stage data ──────────────────────────────────────────────────────

/// A stage-1 finding: something that may be worth remembering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub type_hint: String,
    pub value_hint: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// A stage-2 answer pointing at an existing entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedItem {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// How stage 2 resolved a candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResolution {
    /// Nothing stored matches; stage 3 creates a new entity.
    New,
    /// The model named an existing entity.
    Matched(MatchedItem),
}

// ── Job payloads ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPayload {
    pub category: Category,
    pub context: ExtractionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPayload {
    pub category: Category,
    pub context: ExtractionContext,
    pub candidate: Candidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    /// Category the entity is stored under (may differ from where the
    /// candidate was detected).
    pub category: Category,
    pub context: ExtractionContext,
    pub candidate: Candidate,
    /// `None` when stage 3 creates a new entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_id: Option<String>,
}

impl UpdatePayload {
    pub fn is_new(&self) -> bool {
        self.existing_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub subject_id: String,
    /// Messages this reply answers.
    #[serde(default)]
    pub message_ids: Vec<String>,
    /// Prior turns sent to the model ahead of the prompt.
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

/// Stage-specific data a job carries to its handler.
///
/// The queue never looks inside beyond `next_step` and `subject_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum JobPayload {
    Scan(ScanPayload),
    ItemMatch(MatchPayload),
    ItemUpdate(UpdatePayload),
    SubjectResponse(ResponsePayload),
}

impl JobPayload {
    pub fn next_step(&self) -> NextStep {
        match self {
            Self::Scan(p) => p.category.scan_step(),
            Self::ItemMatch(_) => NextStep::ItemMatch,
            Self::ItemUpdate(_) => NextStep::ItemUpdate,
            Self::SubjectResponse(_) => NextStep::SubjectResponse,
        }
    }

    pub fn subject_id(&self) -> &str {
        match self {
            Self::Scan(p) => &p.context.subject_id,
            Self::ItemMatch(p) => &p.context.subject_id,
            Self::ItemUpdate(p) => &p.context.subject_id,
            Self::SubjectResponse(p) => &p.subject_id,
        }
    }

    /// Conversation turns to send ahead of the prompt.
    pub fn history(&self) -> &[ChatMessage] {
        match self {
            Self::SubjectResponse(p) => &p.history,
            _ => &[],
        }
    }

    /// Label for logs and mismatch errors.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Scan(_) => "scan",
            Self::ItemMatch(_) => "item_match",
            Self::ItemUpdate(_) => "item_update",
            Self::SubjectResponse(_) => "subject_response",
        }
    }
}
