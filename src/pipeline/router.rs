//! Response router: hands each completed job to the handler named by its
//! `next_step`.
//!
//! Scan results fan out into match jobs, match results into update jobs, and
//! update results are written to the knowledge base. Malformed model output
//! is logged and skipped; only prompt or knowledge-base failures are errors.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::knowledge::{Entity, Fact, Person, Topic, Trait};
use crate::queue::{Job, NextStep};
use crate::worker::executor::{JobOutcome, JobResponse};

use super::orchestrator::ExtractionOrchestrator;
use super::types::{Candidate, Category, JobPayload, MatchResolution, MatchedItem, UpdatePayload};

/// Names a match response uses to say "nothing stored matches".
const NO_MATCH_NAMES: [&str; 2] = ["not found", "none"];

/// Exposure applied when the model gives no (or an unknown) impact level.
const DEFAULT_EXPOSURE_IMPACT: f32 = 0.5;

/// Desired exposure for a newly created topic or person.
const DEFAULT_EXPOSURE_DESIRED: f32 = 0.5;

pub struct ResponseRouter {
    orchestrator: ExtractionOrchestrator,
}

impl ResponseRouter {
    pub fn new(orchestrator: ExtractionOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Dispatch a successful response to its handler.
    ///
    /// Failed and cancelled responses are the driver's business and are
    /// ignored here.
    pub async fn route(&self, response: &JobResponse) -> Result<(), PipelineError> {
        let JobOutcome::Success { content, parsed } = &response.outcome else {
            debug!(job_id = %response.job.id, "Ignoring unsuccessful response");
            return Ok(());
        };
        let job = &response.job;
        let parsed = parsed.as_ref().unwrap_or(&Value::Null);

        match job.next_step {
            NextStep::FactScan | NextStep::TraitScan | NextStep::TopicScan | NextStep::PersonScan => {
                self.handle_scan(job, parsed).await
            }
            NextStep::ItemMatch => self.handle_match(job, parsed).await,
            NextStep::ItemUpdate => self.handle_update(job, parsed).await,
            NextStep::SubjectResponse => self.handle_subject_response(job, content.clone()).await,
        }
    }

    async fn handle_scan(&self, job: &Job, parsed: &Value) -> Result<(), PipelineError> {
        let JobPayload::Scan(payload) = &job.payload else {
            return Err(mismatch(job, "scan"));
        };
        let category = payload.category;

        let Some(items) = parsed.get(category.plural()).and_then(Value::as_array) else {
            debug!(job_id = %job.id, category = %category, "Scan returned no candidate list");
            return Ok(());
        };

        let mut queued = 0usize;
        for item in items {
            match serde_json::from_value::<Candidate>(item.clone()) {
                Ok(candidate) if !candidate.value_hint.trim().is_empty() => {
                    self.orchestrator
                        .queue_item_match(category, payload.context.clone(), candidate)
                        .await?;
                    queued += 1;
                }
                Ok(_) => debug!(job_id = %job.id, "Skipping candidate with empty value"),
                Err(e) => debug!(job_id = %job.id, error = %e, "Skipping malformed candidate"),
            }
        }

        info!(
            job_id = %job.id,
            category = %category,
            found = items.len(),
            queued,
            "Scan complete"
        );
        Ok(())
    }

    async fn handle_match(&self, job: &Job, parsed: &Value) -> Result<(), PipelineError> {
        let JobPayload::ItemMatch(payload) = &job.payload else {
            return Err(mismatch(job, "item_match"));
        };

        let resolution = match_resolution(parsed);
        debug!(
            job_id = %job.id,
            value = %payload.candidate.value_hint,
            matched = matches!(resolution, MatchResolution::Matched(_)),
            "Match resolved"
        );

        self.orchestrator
            .queue_item_update(
                payload.category,
                payload.context.clone(),
                payload.candidate.clone(),
                resolution,
            )
            .await?;
        Ok(())
    }

    async fn handle_update(&self, job: &Job, parsed: &Value) -> Result<(), PipelineError> {
        let JobPayload::ItemUpdate(payload) = &job.payload else {
            return Err(mismatch(job, "item_update"));
        };

        if parsed.as_object().is_some_and(|o| o.is_empty()) {
            debug!(job_id = %job.id, "Update returned no changes");
            return Ok(());
        }

        let fields = match serde_json::from_value::<UpdateFields>(parsed.clone()) {
            Ok(fields) => fields,
            Err(e) => {
                debug!(job_id = %job.id, error = %e, "Skipping malformed update");
                return Ok(());
            }
        };
        let Some(required) = fields.required() else {
            debug!(job_id = %job.id, "Update missing name, description or sentiment, skipping");
            return Ok(());
        };

        let kb = self.orchestrator.knowledge();
        let existing = match &payload.existing_id {
            Some(id) => kb.get(payload.category, id).await?,
            None => None,
        };
        if payload.existing_id.is_some() && existing.is_none() {
            debug!(job_id = %job.id, "Matched entity no longer stored, creating it");
        }

        let created = existing.is_none();
        let entity = materialize(payload, existing, required, &fields, Utc::now());
        info!(
            job_id = %job.id,
            category = %entity.category(),
            name = %entity.name(),
            created,
            "Knowledge updated"
        );
        kb.upsert(entity).await?;
        Ok(())
    }

    async fn handle_subject_response(
        &self,
        job: &Job,
        content: Option<String>,
    ) -> Result<(), PipelineError> {
        let JobPayload::SubjectResponse(payload) = &job.payload else {
            return Err(mismatch(job, "subject_response"));
        };

        match &content {
            Some(reply) => info!(job_id = %job.id, subject_id = %payload.subject_id, chars = reply.len(), "Reply ready"),
            None => info!(job_id = %job.id, subject_id = %payload.subject_id, "Subject chose silence"),
        }
        self.orchestrator
            .knowledge()
            .record_reply(&payload.subject_id, content)
            .await?;
        Ok(())
    }
}

fn mismatch(job: &Job, expected: &str) -> PipelineError {
    PipelineError::PayloadMismatch {
        id: job.id,
        expected: expected.to_string(),
        actual: job.payload.label().to_string(),
    }
}

/// Read a match response, recognizing the "no match" sentinels.
fn match_resolution(parsed: &Value) -> MatchResolution {
    let name = parsed
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() || NO_MATCH_NAMES.iter().any(|s| name.eq_ignore_ascii_case(s)) {
        return MatchResolution::New;
    }

    MatchResolution::Matched(MatchedItem {
        name: name.to_string(),
        description: parsed
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        confidence: parsed
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|c| c as f32),
    })
}

/// Fields a stage-3 response may carry. Which optional ones apply depends
/// on the category.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateFields {
    name: Option<String>,
    description: Option<String>,
    sentiment: Option<f32>,
    confidence: Option<f32>,
    strength: Option<f32>,
    relationship: Option<String>,
    category: Option<String>,
    exposure_impact: Option<String>,
}

struct Required {
    name: String,
    description: String,
    sentiment: f32,
}

impl UpdateFields {
    fn required(&self) -> Option<Required> {
        let name = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())?;
        Some(Required {
            name: name.to_string(),
            description: self.description.clone()?,
            sentiment: self.sentiment?.clamp(-1.0, 1.0),
        })
    }

    fn impact(&self) -> f32 {
        exposure_impact(self.exposure_impact.as_deref())
    }
}

/// Map an exposure level to the amount it adds to current exposure.
pub fn exposure_impact(level: Option<&str>) -> f32 {
    match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
        Some("high") => 0.9,
        Some("medium") => 0.6,
        Some("low") => 0.3,
        Some("none") => 0.1,
        _ => DEFAULT_EXPOSURE_IMPACT,
    }
}

/// Build the entity to store: `existing` with the response applied, or a new
/// entity credited to the payload's subject.
fn materialize(
    payload: &UpdatePayload,
    existing: Option<Entity>,
    required: Required,
    fields: &UpdateFields,
    now: DateTime<Utc>,
) -> Entity {
    let Required {
        name,
        description,
        sentiment,
    } = required;
    let learned_by = Some(payload.context.subject_id.clone());
    let new_id = || Uuid::new_v4().to_string();
    let unit = |v: f32| v.clamp(0.0, 1.0);

    match (payload.category, existing) {
        (Category::Fact, Some(Entity::Fact(mut e))) => {
            e.name = name;
            e.description = description;
            e.sentiment = sentiment;
            e.confidence = fields.confidence.map(unit).or(e.confidence);
            e.last_updated = now;
            Entity::Fact(e)
        }
        (Category::Fact, _) => Entity::Fact(Fact {
            id: new_id(),
            name,
            description,
            sentiment,
            confidence: fields.confidence.map(unit),
            learned_by,
            last_updated: now,
        }),

        (Category::Trait, Some(Entity::Trait(mut e))) => {
            e.name = name;
            e.description = description;
            e.sentiment = sentiment;
            e.strength = fields.strength.map(unit).or(e.strength);
            e.last_updated = now;
            Entity::Trait(e)
        }
        (Category::Trait, _) => Entity::Trait(Trait {
            id: new_id(),
            name,
            description,
            sentiment,
            strength: fields.strength.map(unit),
            learned_by,
            last_updated: now,
        }),

        (Category::Topic, Some(Entity::Topic(mut e))) => {
            e.name = name;
            e.description = description;
            e.sentiment = sentiment;
            e.category = fields.category.clone().or(e.category);
            e.exposure_current = (e.exposure_current + fields.impact()).min(1.0);
            e.last_updated = now;
            Entity::Topic(e)
        }
        (Category::Topic, _) => Entity::Topic(Topic {
            id: new_id(),
            name,
            description,
            sentiment,
            category: fields.category.clone(),
            exposure_current: fields.impact(),
            exposure_desired: DEFAULT_EXPOSURE_DESIRED,
            learned_by,
            last_updated: now,
        }),

        (Category::Person, Some(Entity::Person(mut e))) => {
            e.name = name;
            e.description = description;
            e.sentiment = sentiment;
            if let Some(relationship) = &fields.relationship {
                e.relationship = relationship.clone();
            }
            e.exposure_current = (e.exposure_current + fields.impact()).min(1.0);
            e.last_updated = now;
            Entity::Person(e)
        }
        (Category::Person, _) => Entity::Person(Person {
            id: new_id(),
            name,
            description,
            sentiment,
            relationship: fields.relationship.clone().unwrap_or_default(),
            exposure_current: fields.impact(),
            exposure_desired: DEFAULT_EXPOSURE_DESIRED,
            learned_by,
            last_updated: now,
        }),
    }
}
