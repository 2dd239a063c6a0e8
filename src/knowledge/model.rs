//! Knowledge-base entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::Category;

/// Something true about the human (where they live, their job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub name: String,
    pub description: String,
    /// -1.0 (negative) ..= 1.0 (positive).
    pub sentiment: f32,
    #[serde(default)]
    pub confidence: Option<f32>,
    /// Subject whose conversation first produced this entity.
    #[serde(default)]
    pub learned_by: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// A personality trait or habit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trait {
    pub id: String,
    pub name: String,
    pub description: String,
    pub sentiment: f32,
    /// 0.0 ..= 1.0.
    #[serde(default)]
    pub strength: Option<f32>,
    #[serde(default)]
    pub learned_by: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Something the human talks about or cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub name: String,
    pub description: String,
    pub sentiment: f32,
    #[serde(default)]
    pub category: Option<String>,
    pub exposure_current: f32,
    pub exposure_desired: f32,
    #[serde(default)]
    pub learned_by: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Someone in the human's life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub description: String,
    pub sentiment: f32,
    #[serde(default)]
    pub relationship: String,
    pub exposure_current: f32,
    pub exposure_desired: f32,
    #[serde(default)]
    pub learned_by: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Any knowledge-base entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Fact(Fact),
    Trait(Trait),
    Topic(Topic),
    Person(Person),
}

impl Entity {
    pub fn category(&self) -> Category {
        match self {
            Self::Fact(_) => Category::Fact,
            Self::Trait(_) => Category::Trait,
            Self::Topic(_) => Category::Topic,
            Self::Person(_) => Category::Person,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Fact(e) => &e.id,
            Self::Trait(e) => &e.id,
            Self::Topic(e) => &e.id,
            Self::Person(e) => &e.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Fact(e) => &e.name,
            Self::Trait(e) => &e.name,
            Self::Topic(e) => &e.name,
            Self::Person(e) => &e.name,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Fact(e) => &e.description,
            Self::Trait(e) => &e.description,
            Self::Topic(e) => &e.description,
            Self::Person(e) => &e.description,
        }
    }

    pub fn learned_by(&self) -> Option<&str> {
        match self {
            Self::Fact(e) => e.learned_by.as_deref(),
            Self::Trait(e) => e.learned_by.as_deref(),
            Self::Topic(e) => e.learned_by.as_deref(),
            Self::Person(e) => e.learned_by.as_deref(),
        }
    }

    /// Case-insensitive, whitespace-trimmed name comparison.
    pub fn has_name(&self, name: &str) -> bool {
        self.name().trim().eq_ignore_ascii_case(name.trim())
    }
}

/// A reply (or deliberate silence) produced for a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub subject_id: String,
    /// `None` when the model chose to stay silent.
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}
