// Forward queue: background retries of forwards that failed in transit.
//
// Jobs flow through a small state machine:
//   pending → in_flight → forwarded        (happy path)
//   pending → in_flight → pending          (transport failure, with backoff)
//   pending → in_flight → dead             (after max_attempts, or unrecoverable)
//
// At most one live job exists per branch: the coordinator refuses pushes to
// a branch whose previous forward is still queued. Capacity counts live jobs
// only; a full queue makes the coordinator roll back instead.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gitmirror_common::protocol::api::{ForwardJobEntry, ForwardJobState};
use gitmirror_common::types::{CommitHash, RepositoryId};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetrySettings;
use crate::lock::BranchKey;

/// Terminal jobs kept for the operator view.
const FINISHED_HISTORY: usize = 256;

/// Worker wake-up when nothing is scheduled.
const IDLE_POLL: Duration = Duration::from_secs(60);

// ── Backoff ─────────────────────────────────────────────────────────

/// Exponential backoff for a 0-based retry number.
pub fn backoff_delay(settings: &RetrySettings, attempt: u32) -> Duration {
    let exp = attempt.min(7); // cap exponent to avoid overflow
    settings.base_delay.saturating_mul(1u32 << exp).min(settings.max_delay)
}

// ── Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardJob {
    pub id: Uuid,
    /// Push operation that produced the commit.
    pub operation_id: Uuid,
    pub key: BranchKey,
    pub commit: CommitHash,
    /// Upstream tip the forward must replace (`None` = must not exist).
    pub expected_upstream: Option<CommitHash>,
    /// Failed attempts so far, including the coordinator's own.
    pub attempts: u32,
    pub state: ForwardJobState,
    pub next_attempt_at: Instant,
    pub next_attempt_wall: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl ForwardJob {
    pub fn to_entry(&self) -> ForwardJobEntry {
        ForwardJobEntry {
            id: self.id,
            branch: self.key.branch.clone(),
            commit: self.commit.clone(),
            expected_upstream: self.expected_upstream.clone(),
            attempts: self.attempts,
            state: self.state,
            next_attempt_at: (self.state == ForwardJobState::Pending).then_some(self.next_attempt_wall),
            last_error: self.last_error.clone(),
        }
    }
}

/// The queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull {
    pub capacity: usize,
}

#[derive(Default)]
struct QueueState {
    live: Vec<ForwardJob>,
    finished: VecDeque<ForwardJob>,
}

impl QueueState {
    fn job_mut(&mut self, id: Uuid) -> Option<&mut ForwardJob> {
        self.live.iter_mut().find(|job| job.id == id)
    }

    fn finish(&mut self, id: Uuid, state: ForwardJobState, error: Option<String>) -> Option<ForwardJob> {
        let index = self.live.iter().position(|job| job.id == id)?;
        let mut job = self.live.remove(index);
        job.state = state;
        if error.is_some() {
            job.last_error = error;
        }
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back(job.clone());
        Some(job)
    }
}

// ── Queue ───────────────────────────────────────────────────────────

/// Shared in-memory forward queue. Cloning shares the queue.
#[derive(Clone)]
pub struct ForwardQueue {
    state: Arc<Mutex<QueueState>>,
    wake: Arc<Notify>,
    settings: RetrySettings,
}

impl ForwardQueue {
    pub fn new(settings: RetrySettings) -> Self {
        Self { state: Arc::default(), wake: Arc::new(Notify::new()), settings }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a forward whose first attempt already failed.
    pub fn enqueue(
        &self,
        key: BranchKey,
        operation_id: Uuid,
        commit: CommitHash,
        expected_upstream: Option<CommitHash>,
        error: impl Into<String>,
    ) -> Result<ForwardJob, QueueFull> {
        let mut state = self.state();
        if state.live.len() >= self.settings.capacity {
            warn!(key = %key, capacity = self.settings.capacity, "forward queue full");
            return Err(QueueFull { capacity: self.settings.capacity });
        }

        let delay = backoff_delay(&self.settings, 0);
        let job = ForwardJob {
            id: Uuid::new_v4(),
            operation_id,
            key,
            commit,
            expected_upstream,
            attempts: 1,
            state: ForwardJobState::Pending,
            next_attempt_at: Instant::now() + delay,
            next_attempt_wall: wall_clock_after(delay),
            last_error: Some(error.into()),
        };
        info!(
            job_id = %job.id,
            key = %job.key,
            commit = %job.commit,
            operation_id = %job.operation_id,
            "forward queued for retry"
        );
        state.live.push(job.clone());
        drop(state);
        self.wake.notify_one();
        Ok(job)
    }

    /// True while `key` has a job that is not yet forwarded or dead.
    pub fn has_pending(&self, key: &BranchKey) -> bool {
        self.state().live.iter().any(|job| &job.key == key)
    }

    /// Claim every pending job that is due at `now`.
    pub fn take_due(&self, now: Instant) -> Vec<ForwardJob> {
        let mut state = self.state();
        state
            .live
            .iter_mut()
            .filter(|job| job.state == ForwardJobState::Pending && job.next_attempt_at <= now)
            .map(|job| {
                job.state = ForwardJobState::InFlight;
                job.clone()
            })
            .collect()
    }

    /// Earliest scheduled attempt among pending jobs.
    pub fn next_due(&self) -> Option<Instant> {
        self.state()
            .live
            .iter()
            .filter(|job| job.state == ForwardJobState::Pending)
            .map(|job| job.next_attempt_at)
            .min()
    }

    pub fn complete(&self, id: Uuid) -> Option<ForwardJob> {
        let job = self.state().finish(id, ForwardJobState::Forwarded, None);
        if let Some(job) = &job {
            info!(job_id = %id, key = %job.key, commit = %job.commit, "queued forward delivered");
        }
        job
    }

    /// Record a failed attempt. Schedules the next one with backoff, or
    /// marks the job dead once `max_attempts` is reached.
    pub fn reschedule(&self, id: Uuid, error: impl Into<String>) -> Option<ForwardJob> {
        let error = error.into();
        let max_attempts = self.settings.max_attempts;
        let mut state = self.state();
        let job = state.job_mut(id)?;
        job.attempts += 1;
        if job.attempts >= max_attempts {
            warn!(job_id = %id, attempts = job.attempts, error = %error, "forward retries exhausted");
            return state.finish(id, ForwardJobState::Dead, Some(error));
        }

        let delay = backoff_delay(&self.settings, job.attempts - 1);
        job.state = ForwardJobState::Pending;
        job.next_attempt_at = Instant::now() + delay;
        job.next_attempt_wall = wall_clock_after(delay);
        job.last_error = Some(error);
        debug!(job_id = %id, attempts = job.attempts, delay_ms = delay.as_millis() as u64, "forward rescheduled");
        let job = job.clone();
        drop(state);
        self.wake.notify_one();
        Some(job)
    }

    /// Put a claimed job back without counting an attempt.
    pub fn defer(&self, id: Uuid, delay: Duration) -> Option<ForwardJob> {
        let mut state = self.state();
        let job = state.job_mut(id)?;
        job.state = ForwardJobState::Pending;
        job.next_attempt_at = Instant::now() + delay;
        job.next_attempt_wall = wall_clock_after(delay);
        Some(job.clone())
    }

    pub fn mark_dead(&self, id: Uuid, reason: impl Into<String>) -> Option<ForwardJob> {
        self.state().finish(id, ForwardJobState::Dead, Some(reason.into()))
    }

    pub fn get(&self, id: Uuid) -> Option<ForwardJob> {
        let state = self.state();
        state.live.iter().chain(state.finished.iter()).find(|job| job.id == id).cloned()
    }

    /// Live jobs first, then recently finished ones, for one repository.
    pub fn list(&self, repository_id: &RepositoryId) -> Vec<ForwardJob> {
        let state = self.state();
        state
            .live
            .iter()
            .chain(state.finished.iter().rev())
            .filter(|job| &job.key.repository_id == repository_id)
            .cloned()
            .collect()
    }

    async fn woken(&self) {
        self.wake.notified().await;
    }
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

// ── Worker ──────────────────────────────────────────────────────────

/// Runs one claimed job to a decision: complete, reschedule, defer or dead.
pub trait ForwardRetrier: Clone + Send + Sync + 'static {
    fn retry(&self, job: ForwardJob) -> impl Future<Output = ()> + Send;
}

/// Start the background worker. Jobs for different branches run
/// concurrently; each job serializes on its own branch lock.
pub fn start_forward_worker<R: ForwardRetrier>(queue: ForwardQueue, retrier: R) -> ForwardWorkerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(worker_loop(queue, retrier, shutdown_rx));
    ForwardWorkerHandle { task: Some(task), shutdown_tx }
}

/// Handle for the forward worker. Dropping it stops the loop.
pub struct ForwardWorkerHandle {
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ForwardWorkerHandle {
    /// Stop claiming jobs and wait for in-flight attempts to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(error = %error, "forward worker ended abnormally");
            }
        }
    }
}

impl Drop for ForwardWorkerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn worker_loop<R: ForwardRetrier>(
    queue: ForwardQueue,
    retrier: R,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();
    loop {
        for job in queue.take_due(Instant::now()) {
            debug!(job_id = %job.id, key = %job.key, attempts = job.attempts, "retrying forward");
            let retrier = retrier.clone();
            in_flight.spawn(async move { retrier.retry(job).await });
        }

        let wake_at = queue.next_due().unwrap_or_else(|| Instant::now() + IDLE_POLL);
        tokio::select! {
            _ = tokio::time::sleep_until(wake_at) => {},
            _ = queue.woken() => {},
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(error) = joined {
                    warn!(error = %error, "forward retry task failed");
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("forward worker shutting down");
                break;
            }
        }
    }
    while let Some(joined) = in_flight.join_next().await {
        if let Err(error) = joined {
            warn!(error = %error, "forward retry task failed");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
