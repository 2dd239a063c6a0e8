//! Job record and its lifecycle enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::types::JobPayload;

pub type JobId = Uuid;

/// Expected shape of the LLM response for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Content passed through unchanged.
    Raw,
    /// Content must parse as JSON.
    StructuredJson,
    /// Conversational reply; may be an intentional silence.
    Response,
}

/// Dispatch priority. Variant order is the claim order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        write!(f, "{s}")
    }
}

/// State of a job in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by the worker. At most one job is in this state.
    Processing,
    /// Failed permanently; outside the retry pool.
    DeadLettered,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::DeadLettered => "dead_lettered",
        };
        write!(f, "{s}")
    }
}

/// Which response handler consumes a job's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NextStep {
    FactScan,
    TraitScan,
    TopicScan,
    PersonScan,
    ItemMatch,
    ItemUpdate,
    SubjectResponse,
}

impl NextStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FactScan => "factScan",
            Self::TraitScan => "traitScan",
            Self::TopicScan => "topicScan",
            Self::PersonScan => "personScan",
            Self::ItemMatch => "itemMatch",
            Self::ItemUpdate => "itemUpdate",
            Self::SubjectResponse => "subjectResponse",
        }
    }
}

impl std::fmt::Display for NextStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NextStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "factScan" => Ok(Self::FactScan),
            "traitScan" => Ok(Self::TraitScan),
            "topicScan" => Ok(Self::TopicScan),
            "personScan" => Ok(Self::PersonScan),
            "itemMatch" => Ok(Self::ItemMatch),
            "itemUpdate" => Ok(Self::ItemUpdate),
            "subjectResponse" => Ok(Self::SubjectResponse),
            other => Err(format!("unknown next step '{other}'")),
        }
    }
}

/// Everything the caller decides about a job before it is enqueued.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    pub priority: Priority,
    pub system: String,
    pub user: String,
    pub payload: JobPayload,
}

impl JobSpec {
    /// A normal-priority job.
    pub fn new(
        kind: JobKind,
        system: impl Into<String>,
        user: impl Into<String>,
        payload: JobPayload,
    ) -> Self {
        Self {
            kind,
            priority: Priority::Normal,
            system: system.into(),
            user: user.into(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// One queued unit of LLM work. This is also the persisted snapshot shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub priority: Priority,
    pub system: String,
    pub user: String,
    pub next_step: NextStep,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    /// Most recent failure message, kept for DLQ inspection and replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    /// Materialize a spec as a fresh pending job.
    pub fn from_spec(spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: spec.kind,
            priority: spec.priority,
            system: spec.system,
            user: spec.user,
            next_step: spec.payload.next_step(),
            payload: spec.payload,
            state: JobState::Pending,
            attempts: 0,
            created_at: now,
            last_attempt_at: None,
            retry_after: None,
            last_error: None,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.state == JobState::DeadLettered
    }

    /// Subject (persona) this job works on behalf of.
    pub fn subject_id(&self) -> &str {
        self.payload.subject_id()
    }
}
