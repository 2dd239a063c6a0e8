//! Snapshot persistence and the queue's background maintenance tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, error, info, warn};

use super::JobQueue;
use super::job::Job;
use crate::config::DlqConfig;
use crate::error::PersistenceError;

const MIN_TRIM_INTERVAL: Duration = Duration::from_secs(1);

/// Where queue snapshots live.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, jobs: &[Job]) -> Result<(), PersistenceError>;

    /// Load the last snapshot; an absent snapshot is an empty queue.
    async fn load(&self) -> Result<Vec<Job>, PersistenceError>;
}

/// JSON file snapshot, written via temp file + rename so a crash mid-write
/// never leaves a torn file behind.
pub struct JsonFileSnapshot {
    path: PathBuf,
}

impl JsonFileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "queue.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshot {
    async fn save(&self, jobs: &[Job]) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(jobs)?;
        let tmp = self.temp_path();
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), jobs = jobs.len(), "Queue snapshot saved");
        Ok(())
    }

    async fn load(&self) -> Result<Vec<Job>, PersistenceError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No queue snapshot found, starting empty");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Save the queue's current contents now.
pub async fn flush(queue: &JobQueue, store: &dyn SnapshotStore) -> Result<(), PersistenceError> {
    let jobs = queue.snapshot().await;
    store.save(&jobs).await
}

/// Spawn a task that saves a snapshot after queue changes, coalescing bursts
/// of events that arrive within `debounce` of each other.
pub fn spawn_snapshot_task(
    queue: Arc<JobQueue>,
    store: Arc<dyn SnapshotStore>,
    debounce: Duration,
) -> tokio::task::JoinHandle<()> {
    let mut rx = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    debug!(missed = n, "Snapshot writer lagged, saving anyway");
                }
                Err(RecvError::Closed) => break,
            }

            tokio::time::sleep(debounce).await;
            loop {
                match rx.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Closed) => return,
                }
            }

            if let Err(e) = flush(&queue, store.as_ref()).await {
                error!(error = %e, "Failed to save queue snapshot");
            }
        }
    })
}

/// Spawn a task that periodically trims the dead-letter queue.
///
/// The first pass runs immediately. Intervals below one second are raised to
/// one second.
pub fn spawn_dlq_trim_task(queue: Arc<JobQueue>, config: DlqConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.trim_interval.max(MIN_TRIM_INTERVAL));
        loop {
            interval.tick().await;
            let removed = queue
                .trim_dead_lettered(config.max_age_days, config.max_count)
                .await;
            let remaining = queue.dlq_len().await;
            if remaining >= config.max_count {
                warn!(remaining, "Dead-letter queue is at capacity");
            } else if removed > 0 {
                debug!(removed, remaining, "Dead-letter trim pass");
            }
        }
    })
}
