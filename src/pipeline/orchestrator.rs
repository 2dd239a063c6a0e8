//! Extraction orchestrators: turn pipeline state into queued jobs.
//!
//! Stage 1 (scan) is queued from outside; stages 2 and 3 are queued by the
//! response router as earlier stages complete.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::PipelineError;
use crate::knowledge::KnowledgeBase;
use crate::llm::ChatMessage;
use crate::queue::{JobId, JobKind, JobQueue, JobSpec, NextStep, Priority};

use super::prompts::{build_match_prompt, build_scan_prompt, build_update_prompt};
use super::types::{
    Candidate, Category, ExtractionContext, JobPayload, MatchPayload, MatchResolution,
    ResponsePayload, ScanPayload, UpdatePayload,
};

/// Builds prompts and enqueues the jobs for each extraction stage.
#[derive(Clone)]
pub struct ExtractionOrchestrator {
    queue: Arc<JobQueue>,
    kb: Arc<dyn KnowledgeBase>,
}

impl ExtractionOrchestrator {
    pub fn new(queue: Arc<JobQueue>, kb: Arc<dyn KnowledgeBase>) -> Self {
        Self { queue, kb }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn knowledge(&self) -> &Arc<dyn KnowledgeBase> {
        &self.kb
    }

    /// Queue a stage-1 scan for one category.
    pub async fn queue_scan(
        &self,
        category: Category,
        ctx: ExtractionContext,
    ) -> Result<JobId, PipelineError> {
        let spec = scan_spec(category, ctx)?;
        let id = self.queue.enqueue(spec).await;
        debug!(job_id = %id, category = %category, "Queued scan");
        Ok(id)
    }

    /// Queue a scan for every category in one batch.
    pub async fn queue_all_scans(&self, ctx: ExtractionContext) -> Result<Vec<JobId>, PipelineError> {
        let specs = Category::ALL
            .iter()
            .map(|category| scan_spec(*category, ctx.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let ids = self.queue.enqueue_batch(specs).await;
        info!(
            subject_id = %ctx.subject_id,
            messages = ctx.messages_analyze.len(),
            "Queued extraction scans"
        );
        Ok(ids)
    }

    /// Queue stage 2 for a detected candidate.
    pub async fn queue_item_match(
        &self,
        category: Category,
        ctx: ExtractionContext,
        candidate: Candidate,
    ) -> Result<JobId, PipelineError> {
        let existing = self.kb.list(category).await?;
        let prompt = build_match_prompt(category, &ctx, &candidate, &existing)?;

        let payload = JobPayload::ItemMatch(MatchPayload {
            category,
            context: ctx,
            candidate,
        });
        let spec = JobSpec::new(JobKind::StructuredJson, prompt.system, prompt.user, payload);
        let id = self.queue.enqueue(spec).await;
        debug!(job_id = %id, category = %category, known = existing.len(), "Queued item match");
        Ok(id)
    }

    /// Queue stage 3 for a candidate resolved by stage 2.
    ///
    /// A matched name is looked up in `category` first and then in every
    /// category; when it lives elsewhere the update targets that category.
    /// A name that cannot be found falls back to creating a new entity.
    pub async fn queue_item_update(
        &self,
        category: Category,
        ctx: ExtractionContext,
        candidate: Candidate,
        resolution: MatchResolution,
    ) -> Result<JobId, PipelineError> {
        let (target, existing) = match resolution {
            MatchResolution::New => (category, None),
            MatchResolution::Matched(item) => {
                if let Some(entity) = self.kb.find_by_name(category, &item.name).await? {
                    (category, Some(entity))
                } else if let Some((found, id)) =
                    self.kb.find_by_name_across_categories(&item.name).await?
                {
                    debug!(name = %item.name, from = %category, to = %found, "Match lives in another category");
                    (found, self.kb.get(found, &id).await?)
                } else {
                    debug!(name = %item.name, category = %category, "Matched name not stored, treating as new");
                    (category, None)
                }
            }
        };

        let prompt = build_update_prompt(target, &ctx, &candidate, existing.as_ref())?;
        let payload = JobPayload::ItemUpdate(UpdatePayload {
            category: target,
            context: ctx,
            candidate,
            existing_id: existing.as_ref().map(|e| e.id().to_string()),
        });
        let spec = JobSpec::new(JobKind::StructuredJson, prompt.system, prompt.user, payload);
        let id = self.queue.enqueue(spec).await;
        debug!(job_id = %id, category = %target, new = existing.is_none(), "Queued item update");
        Ok(id)
    }

    /// Queue a conversational reply for a subject.
    ///
    /// Replies already waiting for the same subject are superseded and
    /// removed first.
    pub async fn queue_subject_response(
        &self,
        subject_id: &str,
        message_ids: Vec<String>,
        system: impl Into<String>,
        user: impl Into<String>,
        history: Vec<ChatMessage>,
    ) -> JobId {
        let cleared = self
            .queue
            .clear_by_tag_and_subject(subject_id, NextStep::SubjectResponse)
            .await;
        if !cleared.is_empty() {
            debug!(subject_id, superseded = cleared.len(), "Superseded queued responses");
        }

        let payload = JobPayload::SubjectResponse(ResponsePayload {
            subject_id: subject_id.to_string(),
            message_ids,
            history,
        });
        let spec = JobSpec::new(JobKind::Response, system, user, payload).with_priority(Priority::High);
        self.queue.enqueue(spec).await
    }
}

fn scan_spec(category: Category, ctx: ExtractionContext) -> Result<JobSpec, PipelineError> {
    let prompt = build_scan_prompt(category, &ctx)?;
    let payload = JobPayload::Scan(ScanPayload {
        category,
        context: ctx,
    });
    Ok(
        JobSpec::new(JobKind::StructuredJson, prompt.system, prompt.user, payload)
            .with_priority(Priority::Low),
    )
}
