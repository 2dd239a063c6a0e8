//! Worker loop: the single task that claims jobs and drives them through the
//! executor and response router.
//!
//! Exactly one loop runs per queue, which together with the executor's busy
//! check keeps at most one LLM call in flight.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pipeline::ResponseRouter;
use crate::queue::{Job, JobQueue, NextStep};

use super::executor::{Executor, JobOutcome};

pub struct WorkerLoop {
    queue: Arc<JobQueue>,
    executor: Arc<Executor>,
    router: ResponseRouter,
    shutdown: watch::Sender<bool>,
}

impl WorkerLoop {
    pub fn new(queue: Arc<JobQueue>, executor: Arc<Executor>, router: ResponseRouter) -> Arc<Self> {
        let (shutdown, _rx) = watch::channel(false);
        Arc::new(Self {
            queue,
            executor,
            router,
            shutdown,
        })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Spawn the loop on the runtime.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Ask the loop to stop. The in-flight call, if any, is aborted and its
    /// job returned to the pool.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.executor.abort();
    }

    /// Cancel the in-flight call. Its job goes back to the pool.
    pub fn abort_current(&self) -> bool {
        self.executor.abort()
    }

    /// Drop all reply work for a subject: queued replies are removed and an
    /// in-flight one is aborted.
    pub async fn cancel_subject_responses(&self, subject_id: &str) -> usize {
        let in_flight = self
            .queue
            .processing()
            .await
            .filter(|j| j.next_step == NextStep::SubjectResponse && j.subject_id() == subject_id);

        let cleared = self
            .queue
            .clear_by_tag_and_subject(subject_id, NextStep::SubjectResponse)
            .await;

        if let Some(job) = in_flight
            && self.executor.current_job() == Some(job.id)
        {
            info!(job_id = %job.id, subject_id, "Aborting in-flight reply");
            self.executor.abort();
        }
        cleared.len()
    }

    /// Run until `shutdown` is called.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        info!("Worker loop started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            if let Some(ready_at) = self.queue.next_ready_at().await {
                let wait = (ready_at - Utc::now()).to_std().unwrap_or_default();
                if !wait.is_zero() {
                    debug!(wait_ms = wait.as_millis() as u64, "Waiting for backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.queue.changed() => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            }

            match self.queue.claim_highest().await {
                Some(job) => self.run_job(job).await,
                None => {
                    tokio::select! {
                        _ = self.queue.changed() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!("Worker loop stopped");
    }

    async fn run_job(&self, job: Job) {
        info!(
            job_id = %job.id,
            next_step = %job.next_step,
            priority = %job.priority,
            attempts = job.attempts,
            "Running job"
        );

        let response = match self.executor.start(&job).await {
            Ok(response) => response,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Executor refused job");
                self.queue.fail(job.id, None, false).await;
                return;
            }
        };

        let cleared = matches!(response.outcome, JobOutcome::Success { .. })
            && self.queue.get(job.id).await.is_none();

        match &response.outcome {
            JobOutcome::Success { .. } if cleared => {
                debug!(job_id = %job.id, "Job cleared while running, result dropped");
            }
            JobOutcome::Success { .. } => match self.router.route(&response).await {
                Ok(()) => {
                    self.queue.complete(job.id).await;
                    debug!(job_id = %job.id, "Job complete");
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Handler failed, dead-lettering job");
                    self.queue.fail(job.id, Some(&e.to_string()), true).await;
                }
            },
            JobOutcome::Failure { error } => {
                match self.queue.fail(job.id, Some(error), false).await {
                    Some(outcome) if outcome.dropped => {
                        warn!(job_id = %job.id, error = %error, "Job dead-lettered");
                    }
                    Some(outcome) => {
                        info!(
                            job_id = %job.id,
                            retry_ms = outcome.retry_delay.map(|d| d.as_millis() as u64),
                            "Job will retry"
                        );
                    }
                    None => debug!(job_id = %job.id, "Failed job no longer queued"),
                }
            }
            JobOutcome::Cancelled => {
                info!(job_id = %job.id, "Job cancelled");
                self.queue.fail(job.id, None, false).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::ExecutorConfig;
    use crate::error::LlmError;
    use crate::knowledge::InMemoryKnowledgeBase;
    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::pipeline::ExtractionOrchestrator;

    /// Pops scripted replies in order; an `Err` is an HTTP status.
    struct ScriptedLlm {
        replies: Mutex<Vec<Result<String, u16>>>,
        delay: Duration,
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(self.delay).await;
            let next = {
                let mut replies = self.replies.lock().unwrap();
                if replies.is_empty() {
                    Ok("no message".to_string())
                } else {
                    replies.remove(0)
                }
            };
            match next {
                Ok(content) => Ok(CompletionResponse {
                    content,
                    input_tokens: 0,
                    output_tokens: 0,
                    finish_reason: FinishReason::Stop,
                }),
                Err(status) => Err(LlmError::Http {
                    provider: "scripted".into(),
                    status,
                    body: "scripted failure".into(),
                }),
            }
        }
    }

    fn setup(
        replies: Vec<Result<String, u16>>,
        delay: Duration,
    ) -> (Arc<JobQueue>, Arc<InMemoryKnowledgeBase>, ExtractionOrchestrator, Arc<WorkerLoop>) {
        let queue = JobQueue::new();
        let kb = InMemoryKnowledgeBase::new();
        let orch = ExtractionOrchestrator::new(queue.clone(), kb.clone());
        let llm = Arc::new(ScriptedLlm {
            replies: Mutex::new(replies),
            delay,
        });
        let executor = Arc::new(Executor::new(llm, ExecutorConfig::default()));
        let worker = WorkerLoop::new(queue.clone(), executor, ResponseRouter::new(orch.clone()));
        (queue, kb, orch, worker)
    }

    async fn wait_for(mut check: impl AsyncFnMut() -> bool) {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn permanent_failure_lands_in_dlq() {
        let (queue, _kb, orch, worker) = setup(vec![Err(401)], Duration::ZERO);
        orch.queue_subject_response("ei", vec![], "sys", "hi", Vec::new()).await;
        let handle = worker.clone().spawn();

        wait_for(async || { queue.dlq_len().await == 1 }).await;
        let dead = queue.list_dead_lettered().await;
        assert_eq!(dead[0].attempts, 1);
        assert!(dead[0].last_error.as_deref().unwrap().contains("(401)"));

        worker.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn transient_failure_is_retried_after_backoff() {
        let (queue, kb, orch, worker) = setup(vec![Err(503), Ok("Hello!".into())], Duration::ZERO);
        let id = orch.queue_subject_response("ei", vec![], "sys", "hi", Vec::new()).await;
        let handle = worker.clone().spawn();

        wait_for(async || { queue.get(id).await.is_some_and(|j| j.retry_after.is_some()) }).await;
        assert!(kb.replies("ei").await.is_empty());

        // first backoff is 2s
        tokio::time::sleep(Duration::from_millis(2100)).await;
        wait_for(async || { queue.is_empty().await }).await;
        let replies = kb.replies("ei").await;
        assert_eq!(replies[0].content.as_deref(), Some("Hello!"));

        worker.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_subject_responses_aborts_in_flight_reply() {
        let (queue, kb, orch, worker) = setup(vec![Ok("late".into())], Duration::from_secs(30));
        orch.queue_subject_response("ei", vec![], "sys", "hi", Vec::new()).await;
        let handle = worker.clone().spawn();

        wait_for(async || { queue.processing().await.is_some() }).await;
        assert_eq!(worker.cancel_subject_responses("ei").await, 1);

        wait_for(async || { worker.executor().current_job().is_none() }).await;
        assert!(queue.is_empty().await);
        assert!(kb.replies("ei").await.is_empty());

        worker.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn result_of_cleared_job_is_dropped() {
        let (queue, kb, orch, worker) = setup(vec![Ok("stale".into())], Duration::from_millis(200));
        orch.queue_subject_response("ei", vec![], "sys", "hi", Vec::new()).await;
        let handle = worker.clone().spawn();

        wait_for(async || { queue.processing().await.is_some() }).await;
        queue
            .clear_by_tag_and_subject("ei", NextStep::SubjectResponse)
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        wait_for(async || { worker.executor().current_job().is_none() }).await;
        assert!(kb.replies("ei").await.is_empty());
        assert!(queue.is_empty().await);

        worker.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn abort_returns_job_to_pool() {
        let (queue, _kb, orch, worker) = setup(vec![], Duration::from_secs(30));
        let id = orch.queue_subject_response("ei", vec![], "sys", "hi", Vec::new()).await;
        queue.pause().await;
        let handle = worker.clone().spawn();
        assert!(!worker.abort_current());

        queue.resume().await;
        wait_for(async || { worker.executor().current_job() == Some(id) }).await;
        queue.pause().await;
        assert!(worker.abort_current());

        wait_for(async || { queue.processing().await.is_none() }).await;
        let job = queue.get(id).await.unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.is_none());

        worker.shutdown();
        handle.await.unwrap();
    }
}
