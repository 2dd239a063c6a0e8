//! Single-flight LLM executor.
//!
//! Runs one job at a time against the transport and turns the raw completion
//! into a `JobResponse` according to the job's kind. Failures are ordinary
//! results; only starting while busy is an error.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use crate::llm::json::parse_embedded;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::queue::{Job, JobId, JobKind};

/// Replies meaning "say nothing", compared case-insensitively.
const SILENCE_SENTINELS: [&str; 2] = ["no message", "[no message]"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    Idle,
    Busy,
}

/// What came of running a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success {
        /// `None` for an intentional silence.
        content: Option<String>,
        /// Parsed body of a `structured_json` job.
        parsed: Option<serde_json::Value>,
    },
    Failure { error: String },
    Cancelled,
}

/// A job together with its outcome.
#[derive(Debug, Clone)]
pub struct JobResponse {
    pub job: Job,
    pub outcome: JobOutcome,
}

struct Running {
    job_id: JobId,
    /// Taken by the first `abort`.
    cancel: Option<oneshot::Sender<()>>,
}

pub struct Executor {
    llm: Arc<dyn LlmProvider>,
    config: ExecutorConfig,
    current: Mutex<Option<Running>>,
}

impl Executor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: ExecutorConfig) -> Self {
        Self {
            llm,
            config,
            current: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ExecutorState {
        if self.lock().is_some() {
            ExecutorState::Busy
        } else {
            ExecutorState::Idle
        }
    }

    /// Id of the job currently running, if any.
    pub fn current_job(&self) -> Option<JobId> {
        self.lock().as_ref().map(|r| r.job_id)
    }

    /// Cancel the in-flight call. Returns `false` when idle.
    pub fn abort(&self) -> bool {
        let mut current = self.lock();
        let Some(running) = current.as_mut() else {
            return false;
        };
        if let Some(cancel) = running.cancel.take() {
            debug!(job_id = %running.job_id, "Aborting in-flight job");
            // receiver gone means the call already finished
            let _ = cancel.send(());
        }
        true
    }

    /// Run `job` to completion (or cancellation).
    pub async fn start(&self, job: &Job) -> Result<JobResponse, ExecutorError> {
        let cancelled = {
            let mut current = self.lock();
            if let Some(running) = current.as_ref() {
                return Err(ExecutorError::Busy {
                    current: running.job_id,
                });
            }
            let (tx, rx) = oneshot::channel();
            *current = Some(Running {
                job_id: job.id,
                cancel: Some(tx),
            });
            rx
        };
        let _idle = IdleGuard(self);

        let request = self.request_for(job);
        let outcome = tokio::select! {
            result = self.llm.complete(request) => match result {
                Ok(response) => {
                    debug!(
                        job_id = %job.id,
                        finish_reason = ?response.finish_reason,
                        input_tokens = response.input_tokens,
                        output_tokens = response.output_tokens,
                        "Model responded"
                    );
                    interpret(job.kind, &response.content)
                }
                Err(e) => JobOutcome::Failure { error: e.to_string() },
            },
            _ = cancelled => JobOutcome::Cancelled,
        };

        if let JobOutcome::Failure { error } = &outcome {
            warn!(job_id = %job.id, next_step = %job.next_step, error = %error, "Job failed");
        }
        Ok(JobResponse {
            job: job.clone(),
            outcome,
        })
    }

    fn request_for(&self, job: &Job) -> CompletionRequest {
        let history = job.payload.history();
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&job.system));
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(&job.user));

        let mut request = CompletionRequest::new(messages);
        if let Some(model) = &self.config.model {
            request = request.with_model(model.clone());
        }
        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the executor to idle however `start` exits.
struct IdleGuard<'a>(&'a Executor);

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

/// Shape raw completion text according to the job kind.
fn interpret(kind: JobKind, content: &str) -> JobOutcome {
    if content.trim().is_empty() {
        return JobOutcome::Failure {
            error: "Empty response from model".into(),
        };
    }

    match kind {
        JobKind::Raw => JobOutcome::Success {
            content: Some(content.to_string()),
            parsed: None,
        },
        JobKind::StructuredJson => match parse_embedded(content) {
            Ok(value) => JobOutcome::Success {
                content: Some(content.to_string()),
                parsed: Some(value),
            },
            Err(e) => JobOutcome::Failure {
                error: format!("JSON parse failed: {e}"),
            },
        },
        JobKind::Response => {
            let reply = unquote(content.trim());
            let silent = SILENCE_SENTINELS
                .iter()
                .any(|s| reply.eq_ignore_ascii_case(s));
            JobOutcome::Success {
                content: (!silent).then(|| reply.to_string()),
                parsed: None,
            }
        }
    }
}

fn unquote(text: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = text
            .strip_prefix(quote)
            .and_then(|t| t.strip_suffix(quote))
        {
            return inner.trim();
        }
    }
    text
}
