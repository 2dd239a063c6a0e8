//! Job store — the queue's state machine.
//!
//! Pure data plus transition operations; no I/O and no locking. `JobQueue`
//! wraps a store behind a lock and is what the rest of the crate talks to.
//!
//! Lifecycle:
//!
//! ```text
//! enqueue ─▶ pending ─claim─▶ processing ─complete─▶ (removed)
//!               ▲                 │
//!               ├──── transient ──┤ fail
//!               │                 ▼
//!               └──── recover ── dead_lettered ──trim──▶ (removed)
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::classify::is_permanent_error;
use super::job::{Job, JobId, JobSpec, JobState, NextStep, Priority};

/// First retry delay.
pub const BACKOFF_BASE_MS: u64 = 2_000;

/// Retry delays never exceed this.
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// Delay before the next attempt after `attempts` consecutive failures:
/// `min(2s * 2^(attempts-1), 30s)`.
pub fn backoff_delay(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1);
    let ms = 2u64
        .checked_pow(exponent)
        .map(|factor| BACKOFF_BASE_MS.saturating_mul(factor))
        .unwrap_or(u64::MAX)
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}

/// Result of `JobStore::fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailOutcome {
    /// The job was dead-lettered.
    pub dropped: bool,
    /// Backoff applied to a transient failure.
    pub retry_delay: Option<Duration>,
}

/// How a dead-lettered job re-enters the pool.
#[derive(Debug, Clone, Copy)]
pub struct RecoverOptions {
    pub reset_attempts: bool,
    pub priority: Option<Priority>,
}

impl Default for RecoverOptions {
    fn default() -> Self {
        Self {
            reset_attempts: true,
            priority: None,
        }
    }
}

/// In-memory job store. Insertion order is preserved and breaks priority ties.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Vec<Job>,
    paused: bool,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a persisted snapshot.
    ///
    /// A job persisted as `processing` belonged to a process that no longer
    /// exists; it goes back to `pending` so it can be claimed again.
    pub fn from_snapshot(jobs: Vec<Job>) -> Self {
        let mut store = Self { jobs, paused: false };
        let mut orphaned = 0;
        for job in store.jobs.iter_mut() {
            if job.state == JobState::Processing {
                job.state = JobState::Pending;
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            warn!(count = orphaned, "Reset orphaned processing jobs to pending");
        }
        info!(
            jobs = store.jobs.len(),
            dead_lettered = store.dlq_len(),
            "Job store restored from snapshot"
        );
        store
    }

    /// All jobs in insertion order, for persistence.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.clone()
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// The job currently claimed by the worker, if any.
    pub fn processing(&self) -> Option<&Job> {
        self.jobs.iter().find(|j| j.state == JobState::Processing)
    }

    // ── Enqueue ─────────────────────────────────────────────────────────

    pub fn enqueue(&mut self, spec: JobSpec) -> JobId {
        self.enqueue_at(spec, Utc::now())
    }

    pub fn enqueue_at(&mut self, spec: JobSpec, now: DateTime<Utc>) -> JobId {
        let job = Job::from_spec(spec, now);
        let id = job.id;
        debug!(
            job_id = %id,
            next_step = %job.next_step,
            priority = %job.priority,
            "Job enqueued"
        );
        self.jobs.push(job);
        id
    }

    /// Append several jobs in one step.
    pub fn enqueue_batch(&mut self, specs: Vec<JobSpec>) -> Vec<JobId> {
        let now = Utc::now();
        specs
            .into_iter()
            .map(|spec| self.enqueue_at(spec, now))
            .collect()
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Index of the best pending job: highest priority, then oldest insertion.
    fn best_pending(&self) -> Option<usize> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.state == JobState::Pending)
            // min_by_key keeps the first of equal keys, so ties go to insertion order
            .min_by_key(|(_, j)| j.priority)
            .map(|(i, _)| i)
    }

    /// Claim the best pending job and mark it `processing`.
    ///
    /// Does not look at `retry_after`; callers check `next_ready_at` first so
    /// they can sleep instead of polling. Returns `None` while paused, while
    /// another job is already processing, or when nothing is pending.
    pub fn claim_highest(&mut self) -> Option<Job> {
        if self.paused {
            return None;
        }
        if let Some(current) = self.processing() {
            debug!(job_id = %current.id, "Claim refused: a job is already processing");
            return None;
        }
        let idx = self.best_pending()?;
        let job = &mut self.jobs[idx];
        job.state = JobState::Processing;
        Some(job.clone())
    }

    /// When the best pending job becomes eligible.
    ///
    /// `None` means either "ready now" (no backoff on the best job) or "nothing
    /// to do" (empty or paused); `claim_highest` tells the two apart.
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        if self.paused {
            return None;
        }
        let idx = self.best_pending()?;
        self.jobs[idx].retry_after
    }

    // ── Completion ──────────────────────────────────────────────────────

    /// Remove a job. Returns whether it existed.
    pub fn complete(&mut self, id: JobId) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.id != id);
        before != self.jobs.len()
    }

    pub fn fail(&mut self, id: JobId, error: Option<&str>, permanent: bool) -> Option<FailOutcome> {
        self.fail_at(id, error, permanent, Utc::now())
    }

    /// Record a failed attempt and reclassify the job.
    ///
    /// With neither an error nor the permanent flag the job simply returns to
    /// `pending` (a claimed-but-unexecuted job going back to the pool).
    /// Otherwise permanent failures are dead-lettered and transient ones are
    /// rescheduled with exponential backoff. Returns `None` for unknown ids.
    pub fn fail_at(
        &mut self,
        id: JobId,
        error: Option<&str>,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> Option<FailOutcome> {
        let job = self.get_mut(id)?;

        job.attempts += 1;
        job.last_attempt_at = Some(now);
        if let Some(message) = error {
            job.last_error = Some(message.to_string());
        }

        if error.is_none() && !permanent {
            job.state = JobState::Pending;
            debug!(job_id = %id, attempts = job.attempts, "Job returned to pool");
            return Some(FailOutcome {
                dropped: false,
                retry_delay: None,
            });
        }

        if permanent || error.is_some_and(is_permanent_error) {
            job.state = JobState::DeadLettered;
            job.retry_after = None;
            warn!(
                job_id = %id,
                next_step = %job.next_step,
                attempts = job.attempts,
                error = error.unwrap_or("(flagged permanent)"),
                "Job dead-lettered"
            );
            return Some(FailOutcome {
                dropped: true,
                retry_delay: None,
            });
        }

        let delay = backoff_delay(job.attempts);
        job.state = JobState::Pending;
        job.retry_after = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d));
        info!(
            job_id = %id,
            next_step = %job.next_step,
            attempts = job.attempts,
            retry_in_ms = delay.as_millis() as u64,
            "Job failed, will retry"
        );
        Some(FailOutcome {
            dropped: false,
            retry_delay: Some(delay),
        })
    }

    // ── Pause ───────────────────────────────────────────────────────────

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // ── Counts ──────────────────────────────────────────────────────────

    /// Pending plus processing jobs; dead-lettered jobs don't count.
    pub fn len(&self) -> usize {
        self.jobs.iter().filter(|j| !j.is_dead_lettered()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending jobs in claim order.
    pub fn list_pending(&self) -> Vec<&Job> {
        let mut pending: Vec<&Job> = self
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Pending)
            .collect();
        pending.sort_by_key(|j| j.priority);
        pending
    }

    /// Remove live jobs for `subject_id` with the given next step.
    ///
    /// Used to drop superseded work, e.g. a reply draft made stale by a newer
    /// message. Dead-lettered jobs are kept for inspection.
    pub fn clear_by_tag_and_subject(&mut self, subject_id: &str, next_step: NextStep) -> Vec<JobId> {
        let mut removed = Vec::new();
        self.jobs.retain(|j| {
            let matches = !j.is_dead_lettered()
                && j.next_step == next_step
                && j.subject_id() == subject_id;
            if matches {
                removed.push(j.id);
            }
            !matches
        });
        if !removed.is_empty() {
            info!(
                subject_id,
                next_step = %next_step,
                count = removed.len(),
                "Cleared superseded jobs"
            );
        }
        removed
    }

    // ── Dead-letter queue ───────────────────────────────────────────────

    pub fn dlq_len(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_dead_lettered()).count()
    }

    pub fn list_dead_lettered(&self) -> Vec<&Job> {
        self.jobs.iter().filter(|j| j.is_dead_lettered()).collect()
    }

    /// Move a dead-lettered job back to `pending`. Returns false if the id is
    /// unknown or the job isn't dead-lettered.
    pub fn recover(&mut self, id: JobId, options: RecoverOptions) -> bool {
        let Some(job) = self.get_mut(id) else {
            return false;
        };
        if !job.is_dead_lettered() {
            warn!(job_id = %id, state = %job.state, "Cannot recover a job that isn't dead-lettered");
            return false;
        }
        job.state = JobState::Pending;
        job.retry_after = None;
        if options.reset_attempts {
            job.attempts = 0;
        }
        if let Some(priority) = options.priority {
            job.priority = priority;
        }
        info!(job_id = %id, next_step = %job.next_step, "Recovered dead-lettered job");
        true
    }

    pub fn trim_dead_lettered(&mut self, max_age_days: u32, max_count: usize) -> usize {
        self.trim_dead_lettered_at(max_age_days, max_count, Utc::now())
    }

    /// Drop dead-lettered jobs older than `max_age_days`, then the oldest
    /// survivors until at most `max_count` remain. Returns how many went.
    pub fn trim_dead_lettered_at(
        &mut self,
        max_age_days: u32,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> usize {
        // an age past chrono's range means nothing is too old
        let cutoff = chrono::Duration::try_days(i64::from(max_age_days))
            .and_then(|max_age| now.checked_sub_signed(max_age));
        let before = self.jobs.len();
        if let Some(cutoff) = cutoff {
            self.jobs
                .retain(|j| !(j.is_dead_lettered() && j.created_at < cutoff));
        }
        let aged_out = before - self.jobs.len();

        let mut survivors: Vec<(DateTime<Utc>, JobId)> = self
            .jobs
            .iter()
            .filter(|j| j.is_dead_lettered())
            .map(|j| (j.created_at, j.id))
            .collect();
        let mut over_count = 0;
        if survivors.len() > max_count {
            survivors.sort_by_key(|(created_at, _)| *created_at);
            let excess: Vec<JobId> = survivors[..survivors.len() - max_count]
                .iter()
                .map(|(_, id)| *id)
                .collect();
            self.jobs.retain(|j| !excess.contains(&j.id));
            over_count = excess.len();
        }

        let removed = aged_out + over_count;
        if removed > 0 {
            info!(aged_out, over_count, "Trimmed dead-letter queue");
        }
        removed
    }
}
