use std::net::SocketAddr;
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;

use anyhow::Context;
use futures::{Stream, StreamExt, stream};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use memoria::admin::{self, AdminState};
use memoria::config::AppConfig;
use memoria::knowledge::InMemoryKnowledgeBase;
use memoria::llm::{LlmProvider, create_provider};
use memoria::pipeline::{ExtractionOrchestrator, ResponseRouter};
use memoria::queue::JobQueue;
use memoria::queue::persistence::{
    self, JsonFileSnapshot, SnapshotStore, spawn_dlq_trim_task, spawn_snapshot_task,
};
use memoria::session::Session;
use memoria::worker::{Executor, WorkerLoop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;

    eprintln!("🧠 Memoria v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm.model_name());
    eprintln!("   Subject: {} ({})", config.subject_name, config.subject_id);
    eprintln!("   Snapshot: {}", config.snapshot_path.display());
    match config.admin_port {
        Some(port) => eprintln!("   Admin API: http://0.0.0.0:{port}/api/queue"),
        None => eprintln!("   Admin API: disabled"),
    }
    eprintln!("   Type a message and press Enter. Ctrl+C to exit.\n");

    // ── Queue ────────────────────────────────────────────────────────────
    let snapshots: Arc<dyn SnapshotStore> = Arc::new(JsonFileSnapshot::new(&config.snapshot_path));
    let jobs = snapshots
        .load()
        .await
        .context("Failed to load queue snapshot")?;
    if !jobs.is_empty() {
        info!(jobs = jobs.len(), "Restored queue snapshot");
    }
    let queue = JobQueue::from_snapshot(jobs);

    let snapshot_handle = spawn_snapshot_task(queue.clone(), snapshots.clone(), config.snapshot_debounce);
    let trim_handle = spawn_dlq_trim_task(queue.clone(), config.dlq.clone());

    // ── Pipeline + worker ────────────────────────────────────────────────
    let kb = InMemoryKnowledgeBase::new();
    let orchestrator = ExtractionOrchestrator::new(queue.clone(), kb.clone());
    let executor = Arc::new(Executor::new(llm, config.executor.clone()));
    let worker = WorkerLoop::new(
        queue.clone(),
        executor,
        ResponseRouter::new(orchestrator.clone()),
    );
    let worker_handle = worker.clone().spawn();

    // ── Admin API ────────────────────────────────────────────────────────
    if let Some(port) = config.admin_port {
        let state = AdminState {
            queue: queue.clone(),
            worker: worker.clone(),
            dlq: config.dlq.clone(),
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tokio::spawn(async move {
            if let Err(e) = admin::serve(addr, state).await {
                error!(error = %e, port, "Admin API failed");
            }
        });
    }

    // ── Conversation loop ────────────────────────────────────────────────
    let mut session = Session::new(
        &config.subject_id,
        &config.subject_name,
        orchestrator,
        worker.clone(),
    );
    let mut replies = kb.subscribe_replies();
    let mut lines = pin!(stdin_lines());
    let mut ctrl_c = pin!(tokio::signal::ctrl_c());
    let mut stdin_open = true;

    loop {
        tokio::select! {
            biased;
            _ = &mut ctrl_c => {
                info!("Ctrl+C received, shutting down...");
                break;
            }
            reply = replies.recv() => match reply {
                Ok(reply) => {
                    if let Some(content) = &reply.content {
                        println!("\n{}: {}\n", config.subject_name, content);
                    }
                    session.on_reply(&reply);
                }
                Err(RecvError::Lagged(n)) => warn!(missed = n, "Reply stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next(), if stdin_open => match line {
                Some(line) => {
                    let line = line.trim();
                    if !line.is_empty()
                        && let Err(e) = session.on_human_message(line).await
                    {
                        warn!(error = %e, "Failed to queue message");
                    }
                }
                None => {
                    info!("stdin closed, still processing queued jobs");
                    stdin_open = false;
                }
            },
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────
    worker.shutdown();
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Worker loop panicked");
    }
    snapshot_handle.abort();
    trim_handle.abort();
    persistence::flush(&queue, snapshots.as_ref())
        .await
        .context("Failed to save final queue snapshot")?;
    info!(pending = queue.len().await, "Queue saved, bye");

    Ok(())
}

/// Install the stderr subscriber, plus a daily rolling file when `log_dir`
/// is set. The returned guard must live until exit to flush the file.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "memoria.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

/// Lines typed on stdin, ending at EOF.
fn stdin_lines() -> impl Stream<Item = String> {
    let lines = BufReader::new(tokio::io::stdin()).lines();
    stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((line, lines)),
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "Error reading stdin");
                None
            }
        }
    })
}
