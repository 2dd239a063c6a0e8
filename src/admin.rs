//! Admin HTTP API: queue inspection, DLQ management and a live event stream.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DlqConfig;
use crate::queue::{Job, JobId, JobQueue, JobState, NextStep, Priority, RecoverOptions};
use crate::worker::WorkerLoop;

/// Shared state for the admin routes.
#[derive(Clone)]
pub struct AdminState {
    pub queue: Arc<JobQueue>,
    pub worker: Arc<WorkerLoop>,
    /// Defaults for `POST /api/dlq/trim`.
    pub dlq: DlqConfig,
}

/// Job listing without prompts or payload.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub next_step: NextStep,
    pub priority: Priority,
    pub state: JobState,
    pub subject_id: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            next_step: job.next_step,
            priority: job.priority,
            state: job.state,
            subject_id: job.subject_id().to_string(),
            attempts: job.attempts,
            created_at: job.created_at,
            retry_after: job.retry_after,
            last_error: job.last_error.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RecoverRequest {
    reset_attempts: Option<bool>,
    priority: Option<Priority>,
}

#[derive(Debug, Default, Deserialize)]
struct TrimRequest {
    max_age_days: Option<u32>,
    max_count: Option<usize>,
}

/// Build the admin router.
pub fn admin_routes(state: AdminState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/queue", get(queue_status))
        .route("/api/queue/pause", post(pause))
        .route("/api/queue/resume", post(resume))
        .route("/api/dlq", get(list_dlq))
        .route("/api/dlq/trim", post(trim_dlq))
        .route("/api/dlq/{id}/recover", post(recover_job))
        .route("/api/worker/abort", post(abort_current))
        .route("/api/subjects/{subject_id}/cancel", post(cancel_subject))
        .layer(cors)
        .with_state(state)
}

/// Bind `addr` and serve the admin API until the process exits.
pub async fn serve(addr: SocketAddr, state: AdminState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Admin API listening");
    axum::serve(listener, admin_routes(state)).await
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "memoria"
    }))
}

// ── Queue ───────────────────────────────────────────────────────────────

async fn queue_status(State(state): State<AdminState>) -> impl IntoResponse {
    let stats = state.queue.stats().await;
    let pending: Vec<JobSummary> = state.queue.list_pending().await.iter().map(JobSummary::from).collect();
    let processing = state.queue.processing().await.as_ref().map(JobSummary::from);
    Json(json!({
        "stats": stats,
        "executor": state.worker.executor().state(),
        "processing": processing,
        "pending": pending,
    }))
}

async fn pause(State(state): State<AdminState>) -> impl IntoResponse {
    state.queue.pause().await;
    info!("Queue paused via admin API");
    Json(state.queue.stats().await)
}

async fn resume(State(state): State<AdminState>) -> impl IntoResponse {
    state.queue.resume().await;
    info!("Queue resumed via admin API");
    Json(state.queue.stats().await)
}

// ── Dead-letter queue ───────────────────────────────────────────────────

async fn list_dlq(State(state): State<AdminState>) -> impl IntoResponse {
    let jobs: Vec<JobSummary> = state
        .queue
        .list_dead_lettered()
        .await
        .iter()
        .map(JobSummary::from)
        .collect();
    Json(jobs)
}

async fn recover_job(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let job_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid job ID"})),
            );
        }
    };
    let request: RecoverRequest = match parse_optional_body(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({"error": e}))),
    };

    let defaults = RecoverOptions::default();
    let options = RecoverOptions {
        reset_attempts: request.reset_attempts.unwrap_or(defaults.reset_attempts),
        priority: request.priority,
    };
    if state.queue.recover(job_id, options).await {
        info!(job_id = %job_id, "Job recovered via admin API");
        (StatusCode::OK, Json(json!({"recovered": job_id})))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Job not found or not dead-lettered"})),
        )
    }
}

async fn trim_dlq(State(state): State<AdminState>, body: Bytes) -> impl IntoResponse {
    let request: TrimRequest = match parse_optional_body(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({"error": e}))),
    };
    let max_age_days = request.max_age_days.unwrap_or(state.dlq.max_age_days);
    let max_count = request.max_count.unwrap_or(state.dlq.max_count);

    let removed = state.queue.trim_dead_lettered(max_age_days, max_count).await;
    (
        StatusCode::OK,
        Json(json!({
            "removed": removed,
            "remaining": state.queue.dlq_len().await,
        })),
    )
}

// ── Worker ──────────────────────────────────────────────────────────────

async fn abort_current(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({"aborted": state.worker.abort_current()}))
}

async fn cancel_subject(
    State(state): State<AdminState>,
    Path(subject_id): Path<String>,
) -> impl IntoResponse {
    let cleared = state.worker.cancel_subject_responses(&subject_id).await;
    Json(json!({"cleared": cleared}))
}

// ── Event stream ────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AdminState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| stream_events(socket, state.queue))
}

async fn stream_events(mut socket: WebSocket, queue: Arc<JobQueue>) {
    info!("Admin event stream connected");

    if let Ok(json) = serde_json::to_string(&queue.stats().await)
        && socket.send(Message::Text(json.into())).await.is_err()
    {
        return;
    }

    let mut rx = queue.subscribe();
    loop {
        tokio::select! {
            result = rx.recv() => match result {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event)
                        && socket.send(Message::Text(json.into())).await.is_err()
                    {
                        debug!("Event stream client disconnected during send");
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "Event stream client lagged behind");
                }
                Err(RecvError::Closed) => break,
            },
            result = socket.recv() => match result {
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            },
        }
    }

    info!("Admin event stream closed");
}

/// Parse a JSON body that may be omitted entirely.
fn parse_optional_body<T>(body: &[u8]) -> Result<T, String>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| format!("Invalid request body: {e}"))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::ExecutorConfig;
    use crate::error::LlmError;
    use crate::knowledge::InMemoryKnowledgeBase;
    use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::pipeline::types::{JobPayload, ResponsePayload};
    use crate::pipeline::{ExtractionOrchestrator, ResponseRouter};
    use crate::queue::{JobKind, JobSpec};
    use crate::worker::Executor;

    struct UnreachableLlm;

    #[async_trait]
    impl LlmProvider for UnreachableLlm {
        fn model_name(&self) -> &str {
            "unreachable"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::RequestFailed {
                provider: "unreachable".into(),
                reason: "not wired in tests".into(),
            })
        }
    }

    fn state() -> AdminState {
        let queue = JobQueue::new();
        let kb = InMemoryKnowledgeBase::new();
        let executor = Arc::new(Executor::new(Arc::new(UnreachableLlm), ExecutorConfig::default()));
        let router = ResponseRouter::new(ExtractionOrchestrator::new(queue.clone(), kb));
        AdminState {
            worker: WorkerLoop::new(queue.clone(), executor, router),
            queue,
            dlq: DlqConfig::default(),
        }
    }

    fn reply_spec(subject: &str) -> JobSpec {
        JobSpec::new(
            JobKind::Response,
            "s",
            "u",
            JobPayload::SubjectResponse(ResponsePayload {
                subject_id: subject.into(),
                message_ids: Vec::new(),
                history: Vec::new(),
            }),
        )
    }

    async fn dead_letter(queue: &JobQueue) -> JobId {
        let id = queue.enqueue(reply_spec("ei")).await;
        queue.claim_highest().await.unwrap();
        queue.fail(id, Some("HTTP error (401): bad key"), false).await.unwrap();
        id
    }

    async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_check() {
        let (status, body) = call(admin_routes(state()), "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn queue_status_lists_pending() {
        let state = state();
        state.queue.enqueue(reply_spec("ei")).await;
        let (status, body) = call(admin_routes(state), "GET", "/api/queue", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["pending"], 1);
        assert_eq!(body["executor"], "idle");
        assert_eq!(body["pending"][0]["next_step"], "subjectResponse");
        assert_eq!(body["pending"][0]["subject_id"], "ei");
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let state = state();
        let (_, body) = call(admin_routes(state.clone()), "POST", "/api/queue/pause", "").await;
        assert_eq!(body["paused"], true);
        assert!(state.queue.is_paused().await);
        let (_, body) = call(admin_routes(state), "POST", "/api/queue/resume", "").await;
        assert_eq!(body["paused"], false);
    }

    #[tokio::test]
    async fn dlq_listing_and_recovery() {
        let state = state();
        let id = dead_letter(&state.queue).await;

        let (status, body) = call(admin_routes(state.clone()), "GET", "/api/dlq", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], id.to_string());
        assert!(body[0]["last_error"].as_str().unwrap().contains("(401)"));

        let uri = format!("/api/dlq/{id}/recover");
        let (status, _) = call(admin_routes(state.clone()), "POST", &uri, r#"{"priority":"low"}"#).await;
        assert_eq!(status, StatusCode::OK);
        let job = state.queue.get(id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.priority, Priority::Low);
        assert_eq!(job.attempts, 0);

        let (status, _) = call(admin_routes(state.clone()), "POST", &uri, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(admin_routes(state), "POST", "/api/dlq/nope/recover", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trim_uses_request_overrides() {
        let state = state();
        dead_letter(&state.queue).await;
        dead_letter(&state.queue).await;

        let (status, body) =
            call(admin_routes(state.clone()), "POST", "/api/dlq/trim", r#"{"max_count":1}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 1);
        assert_eq!(body["remaining"], 1);

        let (status, _) = call(admin_routes(state), "POST", "/api/dlq/trim", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_subject_clears_queued_replies() {
        let state = state();
        state.queue.enqueue(reply_spec("ei")).await;
        state.queue.enqueue(reply_spec("bob")).await;

        let (_, body) = call(admin_routes(state.clone()), "POST", "/api/subjects/ei/cancel", "").await;
        assert_eq!(body["cleared"], 1);
        assert_eq!(state.queue.len().await, 1);

        let (_, body) = call(admin_routes(state), "POST", "/api/worker/abort", "").await;
        assert_eq!(body["aborted"], false);
    }
}
