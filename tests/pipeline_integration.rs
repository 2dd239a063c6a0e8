//! Integration tests for the extraction pipeline.
//!
//! A stub LLM answers each stage by recognizing its system prompt, so the
//! real queue, executor, router and knowledge base run end to end.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::timeout;

use memoria::config::ExecutorConfig;
use memoria::error::LlmError;
use memoria::knowledge::{Entity, InMemoryKnowledgeBase, KnowledgeBase, Topic};
use memoria::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use memoria::pipeline::types::JobPayload;
use memoria::pipeline::{
    Category, ConversationMessage, ExtractionContext, ExtractionOrchestrator, ResponseRouter,
};
use memoria::queue::persistence::{JsonFileSnapshot, SnapshotStore, flush};
use memoria::queue::{JobQueue, JobState, NextStep};
use memoria::worker::{Executor, JobOutcome, WorkerLoop};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type ReplyFn = dyn Fn(&str) -> String + Send + Sync;

/// Stub LLM provider that answers based on the request's system prompt.
struct StubLlm {
    reply: Box<ReplyFn>,
    calls: AtomicUsize,
}

impl StubLlm {
    fn new(reply: impl Fn(&str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            reply: Box::new(reply),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let system = request.system_prompt().unwrap_or_default();
        Ok(CompletionResponse {
            content: (self.reply)(system),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Answers for a conversation that mentions moving to Chicago.
fn chicago_llm() -> Arc<StubLlm> {
    StubLlm::new(|system| {
        if system.contains("\"facts\": [") {
            json!({"facts": [{"typeHint": "Location", "valueHint": "Chicago", "reason": "said they moved"}]})
                .to_string()
        } else if system.contains("\"traits\": [") {
            "```json\n{\"traits\": []}\n```".to_string()
        } else if system.contains("\"topics\": [") || system.contains("\"people\": [") {
            "Nothing to report: {}".to_string()
        } else if system.starts_with("You decide whether") {
            r#"{"name": "Not Found"}"#.to_string()
        } else if system.starts_with("You maintain a knowledge base") {
            json!({"name": "Location", "description": "Lives in Chicago", "sentiment": 0.3}).to_string()
        } else {
            "[no message]".to_string()
        }
    })
}

struct Harness {
    queue: Arc<JobQueue>,
    kb: Arc<InMemoryKnowledgeBase>,
    orchestrator: ExtractionOrchestrator,
    executor: Arc<Executor>,
    router: ResponseRouter,
}

fn harness(llm: Arc<StubLlm>, queue: Arc<JobQueue>) -> Harness {
    let kb = InMemoryKnowledgeBase::new();
    let orchestrator = ExtractionOrchestrator::new(queue.clone(), kb.clone());
    Harness {
        executor: Arc::new(Executor::new(llm, ExecutorConfig::default())),
        router: ResponseRouter::new(orchestrator.clone()),
        queue,
        kb,
        orchestrator,
    }
}

impl Harness {
    /// Claim, execute and route one job, completing it on success.
    async fn step(&self) -> NextStep {
        let job = self.queue.claim_highest().await.expect("a claimable job");
        let response = self.executor.start(&job).await.unwrap();
        assert!(
            matches!(response.outcome, JobOutcome::Success { .. }),
            "job {} failed: {:?}",
            job.next_step,
            response.outcome
        );
        self.router.route(&response).await.unwrap();
        self.queue.complete(job.id).await;
        job.next_step
    }
}

fn chicago_context() -> ExtractionContext {
    ExtractionContext::new("ei", "Ei").with_analyze(vec![ConversationMessage::new(
        "m1",
        "human",
        "I just moved to Chicago!",
    )])
}

#[tokio::test]
async fn scan_result_chains_into_a_single_match_job() {
    let h = harness(chicago_llm(), JobQueue::new());
    h.orchestrator
        .queue_scan(Category::Fact, chicago_context())
        .await
        .unwrap();

    assert_eq!(h.step().await, NextStep::FactScan);

    let pending = h.queue.list_pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].next_step, NextStep::ItemMatch);
    match &pending[0].payload {
        JobPayload::ItemMatch(p) => {
            assert_eq!(p.candidate.value_hint, "Chicago");
            assert_eq!(p.category, Category::Fact);
        }
        other => panic!("unexpected payload {}", other.label()),
    }
}

#[tokio::test]
async fn stepping_all_scans_creates_one_fact() {
    let h = harness(chicago_llm(), JobQueue::new());
    h.orchestrator.queue_all_scans(chicago_context()).await.unwrap();

    let mut steps = Vec::new();
    while !h.queue.is_empty().await {
        steps.push(h.step().await);
    }

    // scans run in category order, then match and update are normal
    // priority and jump ahead of the remaining low-priority scans
    assert_eq!(
        steps,
        vec![
            NextStep::FactScan,
            NextStep::ItemMatch,
            NextStep::ItemUpdate,
            NextStep::TraitScan,
            NextStep::TopicScan,
            NextStep::PersonScan,
        ]
    );

    let facts = h.kb.list(Category::Fact).await.unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].name(), "Location");
    assert_eq!(facts[0].learned_by(), Some("ei"));
}

#[tokio::test]
async fn silence_sentinel_is_recorded_as_no_content() {
    let h = harness(chicago_llm(), JobQueue::new());
    h.orchestrator
        .queue_subject_response("ei", vec!["m1".into()], "You are Ei", "hello", Vec::new())
        .await;

    let job = h.queue.claim_highest().await.unwrap();
    let response = h.executor.start(&job).await.unwrap();
    assert_eq!(
        response.outcome,
        JobOutcome::Success {
            content: None,
            parsed: None
        }
    );
    h.router.route(&response).await.unwrap();

    let replies = h.kb.replies("ei").await;
    assert_eq!(replies.len(), 1);
    assert!(replies[0].content.is_none());
}

#[tokio::test]
async fn medium_exposure_on_new_topic() {
    let llm = StubLlm::new(|system| {
        if system.contains("\"topics\": [") {
            json!({"topics": [{"typeHint": "Hobby", "valueHint": "Chess", "reason": "plays every week"}]})
                .to_string()
        } else if system.starts_with("You decide whether") {
            r#"{"name": ""}"#.to_string()
        } else {
            json!({
                "name": "Chess",
                "description": "Plays every week",
                "sentiment": 0.8,
                "category": "hobby",
                "exposureImpact": "medium"
            })
            .to_string()
        }
    });
    let h = harness(llm, JobQueue::new());
    h.orchestrator
        .queue_scan(Category::Topic, chicago_context())
        .await
        .unwrap();
    for _ in 0..3 {
        h.step().await;
    }

    let topics = h.kb.list(Category::Topic).await.unwrap();
    match &topics[..] {
        [Entity::Topic(Topic {
            name,
            exposure_current,
            category,
            ..
        })] => {
            assert_eq!(name, "Chess");
            assert_eq!(*exposure_current, 0.6);
            assert_eq!(category.as_deref(), Some("hobby"));
        }
        other => panic!("unexpected topics {other:?}"),
    }
}

#[tokio::test]
async fn worker_loop_drains_queue_end_to_end() {
    let llm = chicago_llm();
    let h = harness(llm.clone(), JobQueue::new());
    let worker = WorkerLoop::new(h.queue.clone(), h.executor.clone(), ResponseRouter::new(h.orchestrator.clone()));
    let handle = worker.clone().spawn();

    h.orchestrator.queue_all_scans(chicago_context()).await.unwrap();
    h.orchestrator
        .queue_subject_response("ei", vec!["m1".into()], "You are Ei", "hello", Vec::new())
        .await;

    timeout(TEST_TIMEOUT, async {
        while !(h.queue.is_empty().await && h.kb.total().await == 1) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue never drained");

    assert_eq!(llm.calls.load(Ordering::SeqCst), 7);
    assert_eq!(h.kb.replies("ei").await.len(), 1);
    assert_eq!(h.queue.dlq_len().await, 0);

    worker.shutdown();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn restored_snapshot_resumes_interrupted_work() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileSnapshot::new(dir.path().join("queue.json"));

    // a crash while the first scan was in flight
    let first = harness(chicago_llm(), JobQueue::new());
    first.orchestrator.queue_all_scans(chicago_context()).await.unwrap();
    let claimed = first.queue.claim_highest().await.unwrap();
    flush(&first.queue, &store).await.unwrap();

    let jobs = store.load().await.unwrap();
    assert!(jobs.iter().any(|j| j.id == claimed.id && j.state == JobState::Processing));

    let h = harness(chicago_llm(), JobQueue::from_snapshot(jobs));
    assert_eq!(h.queue.get(claimed.id).await.unwrap().state, JobState::Pending);
    while !h.queue.is_empty().await {
        h.step().await;
    }
    assert_eq!(h.kb.list(Category::Fact).await.unwrap().len(), 1);
}
