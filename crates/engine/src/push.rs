// Push coordinator.
//
// One inbound push, start to finish, under the locks of every branch it
// names:
//
//   Idle → PreSyncing → Received → Diffed → Forwarding → Forwarded
//                                                      ↘ ForwardFailed → RolledBack | Retrying | GaveUp
//
// What moved is learned by diffing the ref table around the receive step.
// Notifications carry exactly that diffed commit, never a re-read tip.

use std::collections::BTreeSet;
use std::future::Future;

use chrono::Utc;
use gitmirror_common::protocol::api::{ForwardJobState, ForwardStatus, PromoteResponse, PushResponse, PushedBranch};
use gitmirror_common::protocol::pktline::{parse_receive_request, RefUpdateCommand};
use gitmirror_common::types::{diff_refs, BranchName, CommitHash, RefChange, RefSnapshot, RepositoryId};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{EngineSettings, ForwardPolicy};
use crate::error::MirrorError;
use crate::lock::{BranchKey, LockPurpose, LockedBranches};
use crate::mirror::{MirrorBackend, MirrorService, RepositoryMirror};
use crate::notify::{BranchPushed, ForwardAbandoned};
use crate::receive::LocalReceiver;
use crate::refs::{CommitGraph, RefStore};
use crate::retry::{backoff_delay, ForwardJob, ForwardRetrier};
use crate::sync::{BranchSync, BranchSyncOutcome, SkipReason};
use crate::upstream::{UpstreamClient, UpstreamError};

// ── Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Idle,
    PreSyncing,
    Received,
    Diffed,
    Forwarding,
    Forwarded,
    ForwardFailed,
    RolledBack,
    Retrying,
    GaveUp,
}

impl PushState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PreSyncing => "pre_syncing",
            Self::Received => "received",
            Self::Diffed => "diffed",
            Self::Forwarding => "forwarding",
            Self::Forwarded => "forwarded",
            Self::ForwardFailed => "forward_failed",
            Self::RolledBack => "rolled_back",
            Self::Retrying => "retrying",
            Self::GaveUp => "gave_up",
        }
    }
}

/// Bookkeeping for one inbound push. Discarded once forwarding resolves.
#[derive(Debug, Clone)]
pub struct PushOperation {
    pub id: Uuid,
    pub repository_id: RepositoryId,
    /// Parsed from the request; used for lock scope and the old-value check.
    pub commands: Vec<RefUpdateCommand>,
    pub refs_before: RefSnapshot,
    pub refs_after: RefSnapshot,
    /// Locked branches where before != after.
    pub pushed: Vec<RefChange>,
    /// Upstream tips seen during pre-sync.
    pub upstream_observed: RefSnapshot,
    state: PushState,
}

impl PushOperation {
    fn new(repository_id: RepositoryId) -> Self {
        Self {
            id: Uuid::new_v4(),
            repository_id,
            commands: Vec::new(),
            refs_before: RefSnapshot::new(),
            refs_after: RefSnapshot::new(),
            pushed: Vec::new(),
            upstream_observed: RefSnapshot::new(),
            state: PushState::Idle,
        }
    }

    pub fn state(&self) -> PushState {
        self.state
    }

    fn transition(&mut self, next: PushState) {
        debug!(
            operation_id = %self.id,
            repository_id = %self.repository_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "push state"
        );
        self.state = next;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchForward {
    pub branch: BranchName,
    pub commit: CommitHash,
    pub status: ForwardStatus,
}

impl BranchForward {
    pub fn to_pushed(&self) -> PushedBranch {
        PushedBranch { branch: self.branch.clone(), commit: self.commit.clone(), status: self.status }
    }
}

#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub operation_id: Uuid,
    pub repository_id: RepositoryId,
    /// receive-pack response bytes for the client.
    pub response: Vec<u8>,
    pub branches: Vec<BranchForward>,
}

impl PushOutcome {
    pub fn to_response(&self) -> PushResponse {
        PushResponse {
            operation_id: self.operation_id,
            repository_id: self.repository_id.clone(),
            branches: self.branches.iter().map(BranchForward::to_pushed).collect(),
        }
    }
}

#[derive(Debug, Error)]
#[error("push {operation_id} failed: {error}")]
pub struct PushFailure {
    pub operation_id: Uuid,
    #[source]
    pub error: MirrorError,
    /// Branches that were resolved before the failure; they stay resolved.
    pub completed: Vec<BranchForward>,
    /// receive-pack response, when the receive step ran.
    pub response: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromoteOutcome {
    pub operation_id: Uuid,
    pub target: BranchName,
    pub commit: CommitHash,
    pub status: ForwardStatus,
}

impl PromoteOutcome {
    pub fn to_response(&self) -> PromoteResponse {
        PromoteResponse {
            operation_id: self.operation_id,
            target: self.target.clone(),
            commit: self.commit.clone(),
            status: self.status,
        }
    }
}

/// A forward that did not land, with the upstream tip last believed current.
#[derive(Debug, Clone)]
pub(crate) struct ForwardFailure {
    pub error: UpstreamError,
    pub expected: Option<CommitHash>,
}

#[derive(Default)]
struct PushProgress {
    completed: Vec<BranchForward>,
    response: Option<Vec<u8>>,
}

// ── Coordinator ─────────────────────────────────────────────────────

pub struct PushCoordinator<B: MirrorBackend> {
    service: MirrorService<B>,
}

impl<B: MirrorBackend> Clone for PushCoordinator<B> {
    fn clone(&self) -> Self {
        Self { service: self.service.clone() }
    }
}

impl<B: MirrorBackend> PushCoordinator<B> {
    pub fn new(service: MirrorService<B>) -> Self {
        Self { service }
    }

    /// Accept a receive-pack request body for `repository_id`.
    pub async fn push(&self, repository_id: &RepositoryId, body: &[u8]) -> Result<PushOutcome, PushFailure> {
        let mut op = PushOperation::new(repository_id.clone());
        let mut progress = PushProgress::default();

        match self.run(&mut op, &mut progress, body).await {
            Ok(()) => {
                info!(
                    operation_id = %op.id,
                    repository_id = %repository_id,
                    branches = progress.completed.len(),
                    "push accepted"
                );
                Ok(PushOutcome {
                    operation_id: op.id,
                    repository_id: op.repository_id,
                    response: progress.response.unwrap_or_default(),
                    branches: progress.completed,
                })
            }
            Err(failure) => {
                log_failure(op.id, repository_id, &failure);
                Err(PushFailure {
                    operation_id: op.id,
                    error: failure,
                    completed: progress.completed,
                    response: progress.response,
                })
            }
        }
    }

    async fn run(&self, op: &mut PushOperation, progress: &mut PushProgress, body: &[u8]) -> Result<(), MirrorError> {
        let settings = self.service.settings();
        let deadline = Instant::now() + settings.push_deadline;
        let repository_id = op.repository_id.clone();
        let mirror = self.service.mirror(&repository_id)?;

        let request = parse_receive_request(body).map_err(|e| MirrorError::InvalidPush(e.to_string()))?;
        let branches = validate_commands(&request.commands)?;
        op.commands = request.commands;
        self.ensure_not_quarantined(&repository_id, &branches)?;

        // ── PreSyncing
        op.transition(PushState::PreSyncing);
        let mut locked = self.acquire_with_retry(&repository_id, &branches, LockPurpose::Push).await?;
        self.ensure_not_quarantined(&repository_id, &branches)?;
        self.ensure_no_pending_forward(&repository_id, &branches)?;

        let presync = self.service.sync_engine().sync_locked(&mirror, &locked, false).await?;
        for branch in &branches {
            check_presync(&repository_id, branch, presync.branch(branch))?;
        }
        for command in &op.commands {
            let branch = command.branch().map_err(|e| MirrorError::InvalidPush(e.to_string()))?;
            let local = presync.branch(&branch).and_then(|sync| sync.local.as_ref());
            if command.old.as_ref() != local {
                return Err(MirrorError::stale(
                    &repository_id,
                    &branch,
                    format!("push expected {} but the mirror has {}", show(command.old.as_ref()), show(local)),
                    local,
                    presync.branch(&branch).and_then(|sync| sync.upstream.as_ref()),
                ));
            }
        }
        op.upstream_observed = presync.upstream_heads();

        // ── Received
        op.refs_before = mirror.repo().get_all().await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let received = mirror.receiver().receive_pack(body, remaining).await;
        op.refs_after = mirror.repo().get_all().await?;
        op.transition(PushState::Received);

        let response = match received {
            Ok(response) => response,
            Err(receive_error) => {
                // Undo whatever the interrupted receive step applied.
                let changes = locked_changes(op, &locked);
                self.rollback_all(&mirror, op.id, &changes).await?;
                return Err(MirrorError::Receive(receive_error));
            }
        };
        progress.response = Some(response);

        // ── Diffed
        op.pushed = locked_changes(op, &locked);
        op.transition(PushState::Diffed);
        for change in &op.pushed {
            let fast_forward = match (&change.before, &change.after) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(before), Some(after)) => mirror.repo().is_ancestor(before, after).await?,
            };
            if !fast_forward {
                self.rollback_all(&mirror, op.id, &op.pushed).await?;
                return Err(MirrorError::stale(
                    &repository_id,
                    &change.branch,
                    "non-fast-forward update refused; fetch and rebase",
                    change.before.as_ref(),
                    op.upstream_observed.get(&change.branch),
                ));
            }
        }

        // ── Forwarding
        op.transition(PushState::Forwarding);
        let pushed = op.pushed.clone();
        let mut queued = false;
        for (index, change) in pushed.iter().enumerate() {
            let Some(commit) = change.after.as_ref() else { continue };
            let expected = op.upstream_observed.get(&change.branch).cloned();

            match self.forward(&mirror, &change.branch, expected, commit, deadline).await {
                Ok(()) => {
                    self.notify_pushed(&repository_id, &change.branch, commit, op.id);
                    progress.completed.push(BranchForward {
                        branch: change.branch.clone(),
                        commit: commit.clone(),
                        status: ForwardStatus::Forwarded,
                    });
                    locked.release(&change.branch);
                }
                Err(failure) => {
                    op.transition(PushState::ForwardFailed);
                    match self.apply_failure_policy(&mirror, op.id, change, commit, failure).await {
                        Ok(_job) => {
                            op.transition(PushState::Retrying);
                            queued = true;
                            progress.completed.push(BranchForward {
                                branch: change.branch.clone(),
                                commit: commit.clone(),
                                status: ForwardStatus::Queued,
                            });
                            locked.release(&change.branch);
                        }
                        Err(failure) => {
                            op.transition(match failure {
                                MirrorError::RollbackInconsistency { .. } => PushState::GaveUp,
                                _ => PushState::RolledBack,
                            });
                            // Accepted locally but never attempted upstream.
                            if let Err(rollback_error) = self.rollback_all(&mirror, op.id, &pushed[index + 1..]).await {
                                error!(
                                    operation_id = %op.id,
                                    error = %rollback_error,
                                    "rollback of unforwarded branches failed"
                                );
                            }
                            return Err(failure);
                        }
                    }
                }
            }
        }

        if !queued {
            op.transition(PushState::Forwarded);
        }
        Ok(())
    }

    /// Fast-forward `target` to the tip of `source` and forward it.
    pub async fn promote(
        &self,
        repository_id: &RepositoryId,
        source: &BranchName,
        target: &BranchName,
    ) -> Result<PromoteOutcome, MirrorError> {
        if source == target {
            return Err(MirrorError::InvalidPush("source and target are the same branch".to_string()));
        }
        let settings = self.service.settings();
        let deadline = Instant::now() + settings.push_deadline;
        let operation_id = Uuid::new_v4();
        let mirror = self.service.mirror(repository_id)?;

        let branches: BTreeSet<BranchName> = [source.clone(), target.clone()].into();
        self.ensure_not_quarantined(repository_id, &branches)?;
        let locked = self.acquire_with_retry(repository_id, &branches, LockPurpose::Promote).await?;
        self.ensure_not_quarantined(repository_id, &branches)?;
        self.ensure_no_pending_forward(repository_id, &[target.clone()].into())?;

        let presync = self.service.sync_engine().sync_locked(&mirror, &locked, false).await?;
        let target_sync = presync.branch(target);
        check_presync(repository_id, target, target_sync)?;

        let source_tip = presync
            .branch(source)
            .and_then(|sync| sync.local.clone())
            .ok_or_else(|| MirrorError::InvalidPush(format!("source branch {source} does not exist")))?;
        let target_tip = target_sync.and_then(|sync| sync.local.clone());
        let upstream_tip = target_sync.and_then(|sync| sync.upstream.clone());

        if target_tip.as_ref() == Some(&source_tip) && upstream_tip.as_ref() == Some(&source_tip) {
            debug!(repository_id = %repository_id, target = %target, "target already at source tip");
            return Ok(PromoteOutcome {
                operation_id,
                target: target.clone(),
                commit: source_tip,
                status: ForwardStatus::Forwarded,
            });
        }
        if let Some(tip) = &target_tip {
            if !mirror.repo().is_ancestor(tip, &source_tip).await? {
                return Err(MirrorError::stale(
                    repository_id,
                    target,
                    format!("{source} does not contain {target}; rebase onto {target}"),
                    Some(tip),
                    upstream_tip.as_ref(),
                ));
            }
        }
        if !mirror.repo().compare_and_swap(target, target_tip.as_ref(), Some(&source_tip)).await? {
            return Err(MirrorError::stale(repository_id, target, "target moved during promotion", None, None));
        }
        info!(
            operation_id = %operation_id,
            repository_id = %repository_id,
            source = %source,
            target = %target,
            commit = %source_tip,
            "promoting branch"
        );

        let status = match self.forward(&mirror, target, upstream_tip, &source_tip, deadline).await {
            Ok(()) => {
                self.notify_pushed(repository_id, target, &source_tip, operation_id);
                ForwardStatus::Forwarded
            }
            Err(failure) => {
                let change =
                    RefChange { branch: target.clone(), before: target_tip, after: Some(source_tip.clone()) };
                self.apply_failure_policy(&mirror, operation_id, &change, &source_tip, failure).await?;
                ForwardStatus::Queued
            }
        };
        Ok(PromoteOutcome { operation_id, target: target.clone(), commit: source_tip, status })
    }

    // ── Forwarding ──────────────────────────────────────────────────

    /// Push `commit` upstream with a lease on `expected`. A stale lease is
    /// re-checked against a fresh fetch and retried while upstream is still
    /// an ancestor of `commit`.
    pub(crate) async fn forward(
        &self,
        mirror: &RepositoryMirror<B>,
        branch: &BranchName,
        mut expected: Option<CommitHash>,
        commit: &CommitHash,
        deadline: Instant,
    ) -> Result<(), ForwardFailure> {
        let settings = self.service.settings();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let pushed = bounded(settings, deadline, mirror.upstream().push_branch(branch, expected.as_ref(), commit)).await;
            let error = match pushed {
                Ok(()) => {
                    debug!(repository_id = %mirror.id(), branch = %branch, commit = %commit, attempt, "forwarded");
                    return Ok(());
                }
                Err(error) => error,
            };
            if error.is_transport() && self.landed_upstream(mirror, branch, commit).await {
                info!(
                    repository_id = %mirror.id(),
                    branch = %branch,
                    commit = %commit,
                    error = %error,
                    "push answer was lost but upstream has the commit"
                );
                return Ok(());
            }
            if !matches!(error, UpstreamError::Stale { .. }) || attempt >= settings.forward_attempts {
                return Err(ForwardFailure { error, expected });
            }

            let fetched = match bounded(settings, deadline, mirror.upstream().fetch_branches(false)).await {
                Ok(fetched) => fetched,
                Err(fetch_error) => return Err(ForwardFailure { error: fetch_error, expected }),
            };
            let current = fetched.head(branch).cloned();
            if let Some(tip) = &current {
                if tip == commit {
                    info!(repository_id = %mirror.id(), branch = %branch, commit = %commit, "upstream already at pushed commit");
                    return Ok(());
                }
                let contained = match mirror.repo().is_ancestor(tip, commit).await {
                    Ok(contained) => contained,
                    Err(graph_error) => {
                        return Err(ForwardFailure { error: UpstreamError::transport(graph_error.to_string()), expected })
                    }
                };
                if !contained {
                    return Err(ForwardFailure {
                        error: UpstreamError::stale(format!(
                            "upstream moved to {} which {} does not contain",
                            tip.short(),
                            commit.short()
                        )),
                        expected: current,
                    });
                }
            }
            debug!(
                repository_id = %mirror.id(),
                branch = %branch,
                attempt,
                upstream = ?current.as_ref().map(CommitHash::short),
                "upstream moved forward; retrying forward"
            );
            expected = current;
        }
    }

    /// After an ambiguous push failure: did upstream apply it anyway? Runs
    /// on its own `upstream_timeout` so a push that used up the operation
    /// deadline can still be confirmed.
    async fn landed_upstream(&self, mirror: &RepositoryMirror<B>, branch: &BranchName, commit: &CommitHash) -> bool {
        let limit = self.service.settings().upstream_timeout;
        match tokio::time::timeout(limit, mirror.upstream().list_branches()).await {
            Ok(Ok(heads)) => heads.get(branch) == Some(commit),
            Ok(Err(error)) => {
                debug!(repository_id = %mirror.id(), branch = %branch, error = %error, "could not confirm forward");
                false
            }
            Err(_) => false,
        }
    }

    /// Decide what a failed forward leaves behind: a queued retry, or a
    /// rolled-back local ref and the matching error.
    pub(crate) async fn apply_failure_policy(
        &self,
        mirror: &RepositoryMirror<B>,
        operation_id: Uuid,
        change: &RefChange,
        commit: &CommitHash,
        failure: ForwardFailure,
    ) -> Result<ForwardJob, MirrorError> {
        let repository_id = mirror.id();
        let branch = &change.branch;
        let settings = self.service.settings();

        if failure.error.is_transport() && settings.forward_policy == ForwardPolicy::RetryQueue {
            match self.service.forward_queue().enqueue(
                BranchKey::new(repository_id, branch),
                operation_id,
                commit.clone(),
                failure.expected.clone(),
                failure.error.message(),
            ) {
                Ok(job) => return Ok(job),
                Err(full) => {
                    warn!(
                        operation_id = %operation_id,
                        branch = %branch,
                        capacity = full.capacity,
                        "forward queue full; rolling back instead"
                    );
                }
            }
        }

        self.rollback(mirror, Some(operation_id), branch, Some(commit), change.before.as_ref()).await?;
        Err(forward_error(repository_id, branch, operation_id, change.before.as_ref(), failure))
    }

    /// Move `branch` from `current` back to `restore`. A mismatch means
    /// something wrote the ref under our lock: quarantine the branch.
    pub(crate) async fn rollback(
        &self,
        mirror: &RepositoryMirror<B>,
        operation_id: Option<Uuid>,
        branch: &BranchName,
        current: Option<&CommitHash>,
        restore: Option<&CommitHash>,
    ) -> Result<(), MirrorError> {
        let repo = mirror.repo();
        match repo.compare_and_swap(branch, current, restore).await {
            Ok(true) => {
                info!(
                    operation_id = ?operation_id,
                    repository_id = %mirror.id(),
                    branch = %branch,
                    restored = %show(restore),
                    "local branch rolled back"
                );
                return Ok(());
            }
            Ok(false) => {}
            Err(store_error) => {
                warn!(branch = %branch, error = %store_error, "rollback compare-and-swap failed");
            }
        }

        let found = repo.get(branch).await.ok().flatten();
        self.service.quarantine().quarantine(
            &BranchKey::new(mirror.id(), branch),
            format!("rollback to {} failed", show(restore)),
            found.clone(),
            current.cloned(),
        );
        Err(MirrorError::RollbackInconsistency {
            repository_id: mirror.id().clone(),
            branch: branch.clone(),
            operation_id,
            expected: current.cloned(),
            restore_to: restore.cloned(),
            found,
        })
    }

    async fn rollback_all(
        &self,
        mirror: &RepositoryMirror<B>,
        operation_id: Uuid,
        changes: &[RefChange],
    ) -> Result<(), MirrorError> {
        let mut first_error = None;
        for change in changes {
            let result = self
                .rollback(mirror, Some(operation_id), &change.branch, change.after.as_ref(), change.before.as_ref())
                .await;
            if let Err(rollback_error) = result {
                first_error.get_or_insert(rollback_error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn notify_pushed(
        &self,
        repository_id: &RepositoryId,
        branch: &BranchName,
        commit: &CommitHash,
        operation_id: Uuid,
    ) {
        self.service.notifier().on_branch_pushed(&BranchPushed {
            repository_id: repository_id.clone(),
            branch: branch.clone(),
            commit: commit.clone(),
            operation_id,
            forwarded_at: Utc::now(),
        });
    }

    // ── Guards ──────────────────────────────────────────────────────

    /// `acquire_many` with up to `lock_attempts` bounded waits.
    pub(crate) async fn acquire_with_retry(
        &self,
        repository_id: &RepositoryId,
        branches: &BTreeSet<BranchName>,
        purpose: LockPurpose,
    ) -> Result<LockedBranches, MirrorError> {
        let settings = self.service.settings();
        let mut attempt = 1;
        loop {
            match self.service.locks().acquire_many(repository_id, branches, purpose, settings.lock_wait).await {
                Ok(locked) => return Ok(locked),
                Err(expired) if attempt < settings.lock_attempts => {
                    warn!(key = %expired.key, attempt, "lock wait expired; waiting again");
                    attempt += 1;
                }
                Err(expired) => return Err(expired.into()),
            }
        }
    }

    fn ensure_not_quarantined(
        &self,
        repository_id: &RepositoryId,
        branches: &BTreeSet<BranchName>,
    ) -> Result<(), MirrorError> {
        for branch in branches {
            if let Some(record) = self.service.quarantine().get(&BranchKey::new(repository_id, branch)) {
                return Err(MirrorError::BranchQuarantined {
                    repository_id: repository_id.clone(),
                    branch: branch.clone(),
                    reason: record.reason,
                });
            }
        }
        Ok(())
    }

    fn ensure_no_pending_forward(
        &self,
        repository_id: &RepositoryId,
        branches: &BTreeSet<BranchName>,
    ) -> Result<(), MirrorError> {
        for branch in branches {
            if self.service.forward_queue().has_pending(&BranchKey::new(repository_id, branch)) {
                return Err(MirrorError::stale(
                    repository_id,
                    branch,
                    "a previous push to this branch is still queued for forwarding",
                    None,
                    None,
                ));
            }
        }
        Ok(())
    }

    // ── Queued forwards ─────────────────────────────────────────────

    /// One attempt at a queued forward, under the branch lock. Upstream is
    /// re-validated first; anything but "still where we left it" ends the job.
    pub async fn retry_forward(&self, job: ForwardJob) {
        let settings = self.service.settings();
        let queue = self.service.forward_queue();
        let key = job.key.clone();
        let branch = &key.branch;

        let mirror = match self.service.mirror(&key.repository_id) {
            Ok(mirror) => mirror,
            Err(_) => {
                self.abandon(&job, "repository detached".to_string(), None);
                return;
            }
        };
        let _guard = match self.service.locks().acquire(&key, LockPurpose::ForwardRetry, settings.lock_wait).await {
            Ok(guard) => guard,
            Err(_) => {
                queue.defer(job.id, backoff_delay(queue.settings(), job.attempts));
                return;
            }
        };

        match mirror.repo().get(branch).await {
            Ok(Some(tip)) if tip == job.commit => {}
            Ok(found) => {
                let reason = format!("local branch moved to {} while its forward was queued", show(found.as_ref()));
                self.abandon(&job, reason, found);
                return;
            }
            Err(store_error) => {
                self.record_retry_failure(&job, &store_error.to_string());
                return;
            }
        }

        let deadline = Instant::now() + settings.push_deadline;
        let fetched = match bounded(settings, deadline, mirror.upstream().fetch_branches(false)).await {
            Ok(fetched) => fetched,
            Err(fetch_error) => {
                self.record_retry_failure(&job, fetch_error.message());
                return;
            }
        };
        let current = fetched.head(branch);
        if current == Some(&job.commit) {
            queue.complete(job.id);
            self.notify_pushed(&key.repository_id, branch, &job.commit, job.operation_id);
            return;
        }
        if current != job.expected_upstream.as_ref() {
            let reason = format!("upstream moved to {} while the forward was queued", show(current));
            self.abandon(&job, reason, Some(job.commit.clone()));
            return;
        }

        let pushed = bounded(
            settings,
            deadline,
            mirror.upstream().push_branch(branch, job.expected_upstream.as_ref(), &job.commit),
        )
        .await;
        match pushed {
            Ok(()) => {
                queue.complete(job.id);
                self.notify_pushed(&key.repository_id, branch, &job.commit, job.operation_id);
            }
            Err(upstream_error) if upstream_error.is_transport() => {
                self.record_retry_failure(&job, upstream_error.message());
            }
            Err(upstream_error) => {
                self.abandon(&job, upstream_error.to_string(), Some(job.commit.clone()));
            }
        }
    }

    fn record_retry_failure(&self, job: &ForwardJob, message: &str) {
        let updated = self.service.forward_queue().reschedule(job.id, message);
        if let Some(updated) = updated {
            if updated.state == ForwardJobState::Dead {
                let reason = format!("gave up after {} attempts: {message}", updated.attempts);
                self.abandon(&updated, reason, Some(job.commit.clone()));
            }
        }
    }

    /// End a queued forward for good: dead job, quarantined branch, and an
    /// abandonment event for the agent that was told "queued".
    fn abandon(&self, job: &ForwardJob, reason: String, local: Option<CommitHash>) {
        self.service.forward_queue().mark_dead(job.id, reason.clone());
        error!(
            job_id = %job.id,
            operation_id = %job.operation_id,
            key = %job.key,
            commit = %job.commit,
            reason = %reason,
            "queued forward abandoned"
        );
        self.service.quarantine().quarantine(&job.key, reason.clone(), local, job.expected_upstream.clone());
        self.service.notifier().on_forward_abandoned(&ForwardAbandoned {
            repository_id: job.key.repository_id.clone(),
            branch: job.key.branch.clone(),
            commit: job.commit.clone(),
            operation_id: job.operation_id,
            reason,
        });
    }
}

impl<B: MirrorBackend> ForwardRetrier for PushCoordinator<B> {
    async fn retry(&self, job: ForwardJob) {
        self.retry_forward(job).await;
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Bound an upstream call by `upstream_timeout` and the operation deadline.
pub(crate) async fn bounded<T>(
    settings: &EngineSettings,
    deadline: Instant,
    call: impl Future<Output = Result<T, UpstreamError>>,
) -> Result<T, UpstreamError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(UpstreamError::transport("operation deadline exceeded"));
    }
    let limit = (deadline - now).min(settings.upstream_timeout);
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::transport(format!("no answer from upstream within {}s", limit.as_secs()))),
    }
}

fn validate_commands(commands: &[RefUpdateCommand]) -> Result<BTreeSet<BranchName>, MirrorError> {
    if commands.is_empty() {
        return Err(MirrorError::InvalidPush("push contains no ref updates".to_string()));
    }
    let mut branches = BTreeSet::new();
    for command in commands {
        let branch = command
            .branch()
            .map_err(|_| MirrorError::InvalidPush(format!("{} is not a branch", command.refname)))?;
        if command.is_delete() {
            return Err(MirrorError::InvalidPush(format!("deleting {branch} is not allowed")));
        }
        if !branches.insert(branch.clone()) {
            return Err(MirrorError::InvalidPush(format!("{branch} is updated more than once")));
        }
    }
    Ok(branches)
}

/// Refuse to delegate when pre-sync left a named branch out of step with
/// upstream.
fn check_presync(
    repository_id: &RepositoryId,
    branch: &BranchName,
    sync: Option<&BranchSync>,
) -> Result<(), MirrorError> {
    let Some(sync) = sync else { return Ok(()) };
    let reason = match sync.outcome {
        BranchSyncOutcome::LocalAhead => "mirror has commits upstream does not".to_string(),
        BranchSyncOutcome::Diverged { ahead, behind } => {
            format!("mirror and upstream diverged ({ahead} ahead, {behind} behind)")
        }
        BranchSyncOutcome::LocalOnly => {
            return match &sync.local {
                Some(local) => Err(MirrorError::BranchNotUpstream {
                    repository_id: repository_id.clone(),
                    branch: branch.clone(),
                    local: local.clone(),
                }),
                None => Ok(()),
            };
        }
        BranchSyncOutcome::Raced => "branch moved during pre-sync".to_string(),
        BranchSyncOutcome::Skipped(SkipReason::Quarantined) => {
            return Err(MirrorError::BranchQuarantined {
                repository_id: repository_id.clone(),
                branch: branch.clone(),
                reason: "quarantined".to_string(),
            })
        }
        _ => return Ok(()),
    };
    Err(MirrorError::stale(repository_id, branch, reason, sync.local.as_ref(), sync.upstream.as_ref()))
}

/// Changes between the snapshots, restricted to branches this push holds.
fn locked_changes(op: &PushOperation, locked: &LockedBranches) -> Vec<RefChange> {
    diff_refs(&op.refs_before, &op.refs_after)
        .into_iter()
        .filter(|change| {
            let ours = locked.contains(&change.branch);
            if !ours {
                warn!(
                    operation_id = %op.id,
                    branch = %change.branch,
                    "branch outside the push's lock set changed during receive; ignored"
                );
            }
            ours
        })
        .collect()
}

pub(crate) fn forward_error(
    repository_id: &RepositoryId,
    branch: &BranchName,
    operation_id: Uuid,
    local: Option<&CommitHash>,
    failure: ForwardFailure,
) -> MirrorError {
    match failure.error {
        UpstreamError::Stale { message } => MirrorError::stale(
            repository_id,
            branch,
            format!("upstream moved while forwarding: {message}"),
            local,
            failure.expected.as_ref(),
        ),
        UpstreamError::Rejected { message } => MirrorError::ForwardRejected {
            repository_id: repository_id.clone(),
            branch: branch.clone(),
            operation_id: Some(operation_id),
            message,
        },
        UpstreamError::Transport { message } => MirrorError::ForwardTransport {
            repository_id: repository_id.clone(),
            branch: branch.clone(),
            operation_id: Some(operation_id),
            message,
        },
    }
}

fn log_failure(operation_id: Uuid, repository_id: &RepositoryId, failure: &MirrorError) {
    match failure {
        MirrorError::ForwardRejected { .. } | MirrorError::RollbackInconsistency { .. } => {
            error!(operation_id = %operation_id, repository_id = %repository_id, error = %failure, "push failed");
        }
        _ => {
            warn!(
                operation_id = %operation_id,
                repository_id = %repository_id,
                kind = failure.kind(),
                error = %failure,
                "push refused"
            );
        }
    }
}

pub(crate) fn show(hash: Option<&CommitHash>) -> &str {
    hash.map_or("nothing", CommitHash::short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, MemoryReceiver, MemoryRemote};
    use crate::notify::{ChannelNotifier, MirrorEvent};
    use gitmirror_common::protocol::pktline::encode_commands;
    use tokio::sync::mpsc;

    struct Fixture {
        service: MirrorService<MemoryBackend>,
        remote: MemoryRemote,
        events: mpsc::Receiver<MirrorEvent>,
        id: RepositoryId,
    }

    fn fixture_with(settings: EngineSettings) -> Fixture {
        let (notifier, events) = ChannelNotifier::new(64);
        let service = MirrorService::<MemoryBackend>::with_notifier(settings, notifier);
        let remote = MemoryRemote::new();
        let id = RepositoryId::new("acme").unwrap();
        service.attach(remote.mirror(&id, Some(service.locks()))).unwrap();
        Fixture { service, remote, events, id }
    }

    fn fixture() -> Fixture {
        fixture_with(EngineSettings::default())
    }

    fn branch(name: &str) -> BranchName {
        BranchName::new(name).unwrap()
    }

    fn update(name: &str, old: Option<&CommitHash>, new: Option<&CommitHash>) -> RefUpdateCommand {
        RefUpdateCommand { old: old.cloned(), new: new.cloned(), refname: format!("refs/heads/{name}") }
    }

    fn body(commands: &[RefUpdateCommand]) -> Vec<u8> {
        encode_commands(commands, &["report-status"])
    }

    impl Fixture {
        /// Same commit on both sides of `name`.
        fn in_sync(&self, name: &str) -> CommitHash {
            let commit = self.remote.objects().commit(&[]);
            self.remote.set_head(&branch(name), &commit);
            self.service.mirror(&self.id).unwrap().repo().seed(&branch(name), &commit);
            commit
        }

        fn local(&self, name: &str) -> Option<CommitHash> {
            self.service.mirror(&self.id).unwrap().repo().snapshot().get(&branch(name)).cloned()
        }

        fn pushed_events(&mut self) -> Vec<BranchPushed> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let MirrorEvent::BranchPushed(pushed) = event {
                    out.push(pushed);
                }
            }
            out
        }
    }

    #[tokio::test]
    async fn push_is_forwarded_and_notified_with_the_received_commit() {
        let mut f = fixture();
        let base = f.in_sync("main");
        let next = f.remote.objects().commit(&[&base]);

        let outcome = f
            .service
            .coordinator()
            .push(&f.id, &body(&[update("main", Some(&base), Some(&next))]))
            .await
            .unwrap();

        assert_eq!(outcome.branches.len(), 1);
        assert_eq!(outcome.branches[0].status, ForwardStatus::Forwarded);
        assert!(String::from_utf8_lossy(&outcome.response).contains("ok refs/heads/main"));
        assert_eq!(f.remote.head(&branch("main")), Some(next.clone()));
        assert_eq!(f.local("main"), Some(next.clone()));

        let events = f.pushed_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].commit, next);
        assert_eq!(events[0].operation_id, outcome.operation_id);
    }

    #[tokio::test]
    async fn new_branch_is_created_upstream() {
        let mut f = fixture();
        let root = f.remote.objects().commit(&[]);

        f.service.coordinator().push(&f.id, &body(&[update("feature", None, Some(&root))])).await.unwrap();
        assert_eq!(f.remote.head(&branch("feature")), Some(root));
        assert_eq!(f.pushed_events().len(), 1);
    }

    #[tokio::test]
    async fn push_based_on_an_old_tip_is_refused_after_presync() {
        let mut f = fixture();
        let base = f.in_sync("main");
        let theirs = f.remote.objects().commit(&[&base]);
        let ours = f.remote.objects().commit(&[&base]);
        f.remote.set_head(&branch("main"), &theirs);

        let failure = f
            .service
            .coordinator()
            .push(&f.id, &body(&[update("main", Some(&base), Some(&ours))]))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, MirrorError::StaleRefConflict { .. }));
        assert!(failure.error.is_retryable());
        assert_eq!(f.service.mirror(&f.id).unwrap().receiver().calls(), 0);
        // Pre-sync still brought the mirror up to date.
        assert_eq!(f.local("main"), Some(theirs.clone()));
        assert_eq!(f.remote.head(&branch("main")), Some(theirs));
        assert!(f.pushed_events().is_empty());
    }

    #[tokio::test]
    async fn local_ahead_of_upstream_fails_fast() {
        let f = fixture();
        let base = f.in_sync("main");
        let stray = f.remote.objects().commit(&[&base]);
        let next = f.remote.objects().commit(&[&stray]);
        f.service.mirror(&f.id).unwrap().repo().seed(&branch("main"), &stray);

        let failure = f
            .service
            .coordinator()
            .push(&f.id, &body(&[update("main", Some(&stray), Some(&next))]))
            .await
            .unwrap_err();

        match failure.error {
            MirrorError::StaleRefConflict { reason, .. } => assert!(reason.contains("upstream does not")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.remote.push_count(), 0);
    }

    #[tokio::test]
    async fn transport_failure_rolls_back_under_the_rollback_policy() {
        let mut f = fixture();
        let base = f.in_sync("main");
        let next = f.remote.objects().commit(&[&base]);
        f.remote.fail_next_push(UpstreamError::transport("connection reset"));

        let failure = f
            .service
            .coordinator()
            .push(&f.id, &body(&[update("main", Some(&base), Some(&next))]))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, MirrorError::ForwardTransport { .. }));
        assert_eq!(failure.error.operation_id(), Some(failure.operation_id));
        assert_eq!(f.local("main"), Some(base.clone()));
        assert_eq!(f.remote.head(&branch("main")), Some(base));
        assert!(f.pushed_events().is_empty());
    }

    #[tokio::test]
    async fn lost_push_answer_is_confirmed_against_upstream() {
        let mut f = fixture();
        let base = f.in_sync("main");
        let next = f.remote.objects().commit(&[&base]);
        f.remote.lose_next_push_response(UpstreamError::transport("connection reset after send"));

        let outcome = f
            .service
            .coordinator()
            .push(&f.id, &body(&[update("main", Some(&base), Some(&next))]))
            .await
            .unwrap();

        assert_eq!(outcome.branches[0].status, ForwardStatus::Forwarded);
        assert_eq!(f.local("main"), Some(next.clone()));
        assert_eq!(f.remote.head(&branch("main")), Some(next.clone()));
        let events = f.pushed_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].commit, next);
        assert_eq!(events[0].operation_id, outcome.operation_id);
    }

    #[tokio::test]
    async fn branch_missing_upstream_is_refused_without_retry() {
        let f = fixture();
        let scratch = f.remote.objects().commit(&[]);
        f.service.mirror(&f.id).unwrap().repo().seed(&branch("scratch"), &scratch);
        let next = f.remote.objects().commit(&[&scratch]);

        let failure = f
            .service
            .coordinator()
            .push(&f.id, &body(&[update("scratch", Some(&scratch), Some(&next))]))
            .await
            .unwrap_err();

        match &failure.error {
            MirrorError::BranchNotUpstream { branch: refused, local, .. } => {
                assert_eq!(refused, &branch("scratch"));
                assert_eq!(local, &scratch);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!failure.error.is_retryable());
        assert_eq!(f.local("scratch"), Some(scratch));
        assert_eq!(f.remote.head(&branch("scratch")), None);
        assert!(f.remote.push_log().is_empty());
    }

    #[tokio::test]
    async fn unconfirmed_transport_failure_still_rolls_back() {
        let f = fixture();
        let base = f.in_sync("main");
        let next = f.remote.objects().commit(&[&base]);
        f.remote.fail_next_push(UpstreamError::transport("connection reset"));
        f.remote.fail_next_list(UpstreamError::transport("connection refused"));

        let failure = f
            .service
            .coordinator()
            .push(&f.id, &body(&[update("main", Some(&base), Some(&next))]))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, MirrorError::ForwardTransport { .. }));
        assert_eq!(f.local("main"), Some(base));
    }

    #[tokio::test]
    async fn rejection_rolls_back_regardless_of_policy() {
        let f = fixture_with(EngineSettings { forward_policy: ForwardPolicy::RetryQueue, ..EngineSettings::default() });
        let base = f.in_sync("main");
        let next = f.remote.objects().commit(&[&base]);
        f.remote.fail_next_push(UpstreamError::rejected("protected branch hook declined"));

        let failure = f
            .service
            .coordinator()
            .push(&f.id, &body(&[update("main", Some(&base), Some(&next))]))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, MirrorError::ForwardRejected { .. }));
        assert!(!failure.error.is_retryable());
        assert_eq!(f.local("main"), Some(base));
        assert!(f.service.forward_queue().list(&f.id).is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_queued_under_the_retry_policy() {
        let mut f =
            fixture_with(EngineSettings { forward_policy: ForwardPolicy::RetryQueue, ..EngineSettings::default() });
        let base = f.in_sync("main");
        let next = f.remote.objects().commit(&[&base]);
        f.remote.fail_next_push(UpstreamError::transport("timed out"));

        let coordinator = f.service.coordinator();
        let outcome = coordinator.push(&f.id, &body(&[update("main", Some(&base), Some(&next))])).await.unwrap();
        assert_eq!(outcome.branches[0].status, ForwardStatus::Queued);
        assert_eq!(f.local("main"), Some(next.clone()));
        assert!(f.pushed_events().is_empty());

        let jobs = f.service.forward_queue().list(&f.id);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].expected_upstream, Some(base.clone()));

        // A second push to the branch must wait for the queued forward.
        let later = f.remote.objects().commit(&[&next]);
        let failure = coordinator.push(&f.id, &body(&[update("main", Some(&next), Some(&later))])).await.unwrap_err();
        assert!(matches!(failure.error, MirrorError::StaleRefConflict { .. }));

        coordinator.retry_forward(jobs[0].clone()).await;
        assert_eq!(f.remote.head(&branch("main")), Some(next.clone()));
        let events = f.pushed_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation_id, outcome.operation_id);
        assert!(!f.service.forward_queue().has_pending(&BranchKey::new(&f.id, &branch("main"))));
    }

    #[tokio::test]
    async fn queued_forward_is_abandoned_when_upstream_moves() {
        let mut f =
            fixture_with(EngineSettings { forward_policy: ForwardPolicy::RetryQueue, ..EngineSettings::default() });
        let base = f.in_sync("main");
        let next = f.remote.objects().commit(&[&base]);
        f.remote.fail_next_push(UpstreamError::transport("timed out"));

        let coordinator = f.service.coordinator();
        coordinator.push(&f.id, &body(&[update("main", Some(&base), Some(&next))])).await.unwrap();
        let job = f.service.forward_queue().list(&f.id).remove(0);

        let elsewhere = f.remote.objects().commit(&[&base]);
        f.remote.set_head(&branch("main"), &elsewhere);
        coordinator.retry_forward(job.clone()).await;

        assert_eq!(f.service.forward_queue().get(job.id).map(|j| j.state), Some(ForwardJobState::Dead));
        assert!(f.service.quarantine().is_quarantined(&job.key));
        let abandoned = std::iter::from_fn(|| f.events.try_recv().ok())
            .any(|event| matches!(event, MirrorEvent::ForwardAbandoned(a) if a.commit == next));
        assert!(abandoned);
    }

    #[tokio::test]
    async fn forward_succeeds_when_upstream_already_has_the_commit() {
        let mut f = fixture();
        let base = f.in_sync("main");
        let next = f.remote.objects().commit(&[&base]);
        let same = next.clone();
        f.remote.before_next_push(move |remote| remote.set_head(&BranchName::new("main").unwrap(), &same));

        f.service.coordinator().push(&f.id, &body(&[update("main", Some(&base), Some(&next))])).await.unwrap();
        assert_eq!(f.remote.head(&branch("main")), Some(next));
        assert_eq!(f.pushed_events().len(), 1);
    }

    #[tokio::test]
    async fn failed_rollback_quarantines_the_branch() {
        let f = fixture();
        let base = f.in_sync("main");
        let next = f.remote.objects().commit(&[&base]);
        let intruder = f.remote.objects().commit(&[&base]);
        let repo = f.service.mirror(&f.id).unwrap().repo().clone();
        let moved = intruder.clone();
        f.remote.before_next_push(move |_| repo.seed(&BranchName::new("main").unwrap(), &moved));
        f.remote.fail_next_push(UpstreamError::transport("connection reset"));

        let coordinator = f.service.coordinator();
        let failure = coordinator.push(&f.id, &body(&[update("main", Some(&base), Some(&next))])).await.unwrap_err();
        match &failure.error {
            MirrorError::RollbackInconsistency { expected, found, restore_to, .. } => {
                assert_eq!(expected.as_ref(), Some(&next));
                assert_eq!(found.as_ref(), Some(&intruder));
                assert_eq!(restore_to.as_ref(), Some(&base));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.service.quarantine().is_quarantined(&BranchKey::new(&f.id, &branch("main"))));

        let later = f.remote.objects().commit(&[&intruder]);
        let refused = coordinator.push(&f.id, &body(&[update("main", Some(&intruder), Some(&later))])).await.unwrap_err();
        assert!(matches!(refused.error, MirrorError::BranchQuarantined { .. }));
    }

    #[tokio::test]
    async fn non_fast_forward_receive_is_undone() {
        let service = MirrorService::<MemoryBackend>::new(EngineSettings::default());
        let remote = MemoryRemote::new();
        let id = RepositoryId::new("acme").unwrap();
        let repo = crate::memory::MemoryRepository::new(id.clone(), remote.objects().clone())
            .with_lock_audit(service.locks().clone());
        let receiver = MemoryReceiver::new(repo.clone()).allow_non_fast_forward(true);
        let upstream = remote.client(&repo);
        service.attach(RepositoryMirror::new(id.clone(), "memory://acme", repo.clone(), upstream, receiver)).unwrap();

        let base = remote.objects().commit(&[]);
        let rewrite = remote.objects().commit(&[]);
        remote.set_head(&branch("main"), &base);
        repo.seed(&branch("main"), &base);

        let failure = service
            .coordinator()
            .push(&id, &body(&[update("main", Some(&base), Some(&rewrite))]))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, MirrorError::StaleRefConflict { .. }));
        assert_eq!(repo.snapshot().get(&branch("main")), Some(&base));
        assert_eq!(remote.push_count(), 0);
    }

    #[tokio::test]
    async fn malformed_requests_are_invalid() {
        let f = fixture();
        let base = f.in_sync("main");
        let next = f.remote.objects().commit(&[&base]);
        let coordinator = f.service.coordinator();

        let cases = [
            body(&[update("main", Some(&base), None)]),
            body(&[update("main", Some(&base), Some(&next)), update("main", Some(&base), Some(&next))]),
            body(&[RefUpdateCommand { old: None, new: Some(next.clone()), refname: "refs/tags/v1".into() }]),
            b"0000".to_vec(),
            b"zzzz".to_vec(),
        ];
        for case in cases {
            let failure = coordinator.push(&f.id, &case).await.unwrap_err();
            assert!(matches!(failure.error, MirrorError::InvalidPush(_)), "{}", failure.error);
        }
        assert_eq!(f.service.mirror(&f.id).unwrap().receiver().calls(), 0);
    }

    #[tokio::test]
    async fn promote_fast_forwards_target_to_source() {
        let mut f = fixture();
        let base = f.in_sync("main");
        let feature = f.remote.objects().commit(&[&base]);
        f.remote.set_head(&branch("feature"), &feature);
        f.service.mirror(&f.id).unwrap().repo().seed(&branch("feature"), &feature);

        let outcome = f.service.coordinator().promote(&f.id, &branch("feature"), &branch("main")).await.unwrap();
        assert_eq!(outcome.status, ForwardStatus::Forwarded);
        assert_eq!(outcome.commit, feature);
        assert_eq!(f.remote.head(&branch("main")), Some(feature.clone()));
        assert_eq!(f.local("main"), Some(feature));
        assert_eq!(f.pushed_events().len(), 1);
    }

    #[tokio::test]
    async fn promote_refuses_a_source_that_does_not_contain_target() {
        let f = fixture();
        let base = f.in_sync("main");
        let main_next = f.remote.objects().commit(&[&base]);
        let feature = f.remote.objects().commit(&[&base]);
        f.remote.set_head(&branch("main"), &main_next);
        f.service.mirror(&f.id).unwrap().repo().seed(&branch("feature"), &feature);
        f.remote.set_head(&branch("feature"), &feature);

        let error = f.service.coordinator().promote(&f.id, &branch("feature"), &branch("main")).await.unwrap_err();
        assert!(matches!(error, MirrorError::StaleRefConflict { .. }));
        assert_eq!(f.remote.head(&branch("main")), Some(main_next));
    }
}
