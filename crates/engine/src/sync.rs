// Sync engine: make local branches reflect upstream.
//
// One pass per call: pick the branch set, lock it, fetch once, then decide
// each branch from (local, upstream, ancestry). Only fast-forwards, creates
// and explicit force syncs write the local ref; nothing is ever deleted.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use gitmirror_common::protocol::api::{BranchSyncEntry, SyncResponse, SyncStatus};
use gitmirror_common::types::{BranchName, CommitHash, RefSnapshot, RepositoryId};
use tracing::{debug, info, warn};

use crate::error::MirrorError;
use crate::lock::{BranchKey, LockPurpose, LockedBranches};
use crate::mirror::{MirrorBackend, MirrorService, RepositoryMirror};
use crate::refs::{ancestry, Ancestry, CommitGraph, RefStore};
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// Every local branch plus every upstream branch.
    All,
    Only(BTreeSet<BranchName>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Wait (bounded) for each branch lock.
    Foreground,
    /// Never wait; contended branches are skipped.
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Quarantined,
    MultiWriterForceRefused,
    PendingForward,
    Contended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSyncOutcome {
    Unchanged,
    Created,
    FastForwarded,
    Forced,
    /// Local has commits upstream lacks; left alone.
    LocalAhead,
    /// Upstream has no such branch; the local one is kept.
    LocalOnly,
    Diverged { ahead: usize, behind: usize },
    /// The compare-and-swap lost against a concurrent writer.
    Raced,
    Skipped(SkipReason),
}

impl BranchSyncOutcome {
    pub fn status(self) -> SyncStatus {
        match self {
            Self::Unchanged => SyncStatus::Unchanged,
            Self::Created => SyncStatus::Created,
            Self::FastForwarded => SyncStatus::FastForwarded,
            Self::Forced => SyncStatus::Forced,
            Self::LocalAhead => SyncStatus::LocalAhead,
            Self::LocalOnly => SyncStatus::LocalOnly,
            Self::Diverged { .. } => SyncStatus::Diverged,
            Self::Raced => SyncStatus::Raced,
            Self::Skipped(SkipReason::Quarantined) => SyncStatus::SkippedQuarantined,
            Self::Skipped(SkipReason::MultiWriterForceRefused) => SyncStatus::SkippedMultiWriter,
            Self::Skipped(SkipReason::PendingForward) => SyncStatus::SkippedPendingForward,
            Self::Skipped(SkipReason::Contended) => SyncStatus::SkippedContended,
        }
    }

    /// Local now matches upstream (or upstream had nothing to offer).
    pub fn is_clean(self) -> bool {
        matches!(self, Self::Unchanged | Self::Created | Self::FastForwarded | Self::Forced)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSync {
    pub outcome: BranchSyncOutcome,
    /// Local tip after the pass.
    pub local: Option<CommitHash>,
    /// Upstream tip seen by the pass.
    pub upstream: Option<CommitHash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub repository_id: RepositoryId,
    pub synced_at: DateTime<Utc>,
    pub branches: BTreeMap<BranchName, BranchSync>,
}

impl SyncReport {
    fn new(repository_id: RepositoryId) -> Self {
        Self { repository_id, synced_at: Utc::now(), branches: BTreeMap::new() }
    }

    pub fn branch(&self, branch: &BranchName) -> Option<&BranchSync> {
        self.branches.get(branch)
    }

    pub fn outcome(&self, branch: &BranchName) -> Option<BranchSyncOutcome> {
        self.branches.get(branch).map(|b| b.outcome)
    }

    /// Upstream tips observed for the synced branches.
    pub fn upstream_heads(&self) -> RefSnapshot {
        self.branches
            .iter()
            .filter_map(|(branch, sync)| sync.upstream.clone().map(|tip| (branch.clone(), tip)))
            .collect()
    }

    pub fn to_response(&self) -> SyncResponse {
        SyncResponse {
            repository_id: self.repository_id.clone(),
            synced_at: self.synced_at,
            branches: self
                .branches
                .iter()
                .map(|(branch, sync)| {
                    let (ahead, behind) = match sync.outcome {
                        BranchSyncOutcome::Diverged { ahead, behind } => (Some(ahead), Some(behind)),
                        _ => (None, None),
                    };
                    BranchSyncEntry {
                        branch: branch.clone(),
                        status: sync.outcome.status(),
                        local: sync.local.clone(),
                        upstream: sync.upstream.clone(),
                        ahead,
                        behind,
                    }
                })
                .collect(),
        }
    }
}

pub struct SyncEngine<B: MirrorBackend> {
    service: MirrorService<B>,
}

impl<B: MirrorBackend> Clone for SyncEngine<B> {
    fn clone(&self) -> Self {
        Self { service: self.service.clone() }
    }
}

impl<B: MirrorBackend> SyncEngine<B> {
    pub fn new(service: MirrorService<B>) -> Self {
        Self { service }
    }

    /// Lock, fetch and reconcile the branches in `scope`.
    pub async fn sync(
        &self,
        repository_id: &RepositoryId,
        scope: SyncScope,
        force: bool,
        mode: SyncMode,
    ) -> Result<SyncReport, MirrorError> {
        let mirror = self.service.mirror(repository_id)?;

        let branches = match &scope {
            SyncScope::Only(branches) => {
                if force {
                    if let Some(branch) = branches.iter().find(|b| mirror.is_multi_writer(b)) {
                        return Err(MirrorError::ForceSyncForbidden {
                            repository_id: repository_id.clone(),
                            branch: branch.clone(),
                        });
                    }
                }
                branches.clone()
            }
            SyncScope::All => {
                let mut branches: BTreeSet<BranchName> =
                    mirror.repo().get_all().await?.into_keys().collect();
                let listed = mirror
                    .upstream()
                    .list_branches()
                    .await
                    .map_err(|e| MirrorError::upstream(repository_id, e))?;
                branches.extend(listed.into_keys());
                branches
            }
        };

        let locks = self.service.locks();
        let (locked, contended) = match mode {
            SyncMode::Foreground => {
                let locked = locks
                    .acquire_many(repository_id, &branches, LockPurpose::Sync, self.service.settings().lock_wait)
                    .await?;
                (locked, BTreeSet::new())
            }
            SyncMode::Background => locks.try_acquire_many(repository_id, &branches, LockPurpose::BackgroundSync),
        };

        let mut report = self.sync_locked(&mirror, &locked, force).await?;
        drop(locked);

        for branch in contended {
            debug!(repository_id = %repository_id, branch = %branch, "branch busy; background sync skipped");
            let local = mirror.repo().get(&branch).await?;
            report.branches.insert(
                branch,
                BranchSync { outcome: BranchSyncOutcome::Skipped(SkipReason::Contended), local, upstream: None },
            );
        }

        if scope == SyncScope::All {
            mirror.record_full_sync(report.synced_at);
        }
        Ok(report)
    }

    /// The sync pass for callers that already hold the branch locks.
    pub async fn sync_locked(
        &self,
        mirror: &RepositoryMirror<B>,
        locked: &LockedBranches,
        force: bool,
    ) -> Result<SyncReport, MirrorError> {
        let repository_id = mirror.id();
        let mut report = SyncReport::new(repository_id.clone());
        if locked.is_empty() {
            return Ok(report);
        }
        debug_assert_eq!(locked.repository_id(), repository_id);

        let fetch = mirror
            .upstream()
            .fetch_branches(force)
            .await
            .map_err(|e| MirrorError::upstream(repository_id, e))?;
        let local_refs = mirror.repo().get_all().await?;

        for branch in locked.branches() {
            let local = local_refs.get(branch);
            let upstream = fetch.head(branch);
            let reported_diverged = fetch.diverged.contains(branch);
            let outcome = self.reconcile(mirror, branch, local, upstream, force, reported_diverged).await?;

            let local_after = match outcome {
                BranchSyncOutcome::Created | BranchSyncOutcome::FastForwarded | BranchSyncOutcome::Forced => {
                    upstream.cloned()
                }
                BranchSyncOutcome::Raced => mirror.repo().get(branch).await?,
                _ => local.cloned(),
            };
            log_outcome(repository_id, branch, outcome);
            report
                .branches
                .insert(branch.clone(), BranchSync { outcome, local: local_after, upstream: upstream.cloned() });
        }
        Ok(report)
    }

    async fn reconcile(
        &self,
        mirror: &RepositoryMirror<B>,
        branch: &BranchName,
        local: Option<&CommitHash>,
        upstream: Option<&CommitHash>,
        force: bool,
        reported_diverged: bool,
    ) -> Result<BranchSyncOutcome, MirrorError> {
        let key = BranchKey::new(mirror.id(), branch);
        if self.service.quarantine().is_quarantined(&key) {
            return Ok(BranchSyncOutcome::Skipped(SkipReason::Quarantined));
        }
        if force && mirror.is_multi_writer(branch) {
            return Ok(BranchSyncOutcome::Skipped(SkipReason::MultiWriterForceRefused));
        }
        if force && self.service.forward_queue().has_pending(&key) {
            return Ok(BranchSyncOutcome::Skipped(SkipReason::PendingForward));
        }

        let repo = mirror.repo();
        let (local, upstream) = match (local, upstream) {
            (None, None) => return Ok(BranchSyncOutcome::Unchanged),
            (Some(_), None) => return Ok(BranchSyncOutcome::LocalOnly),
            (None, Some(upstream)) => {
                let created = repo.compare_and_swap(branch, None, Some(upstream)).await?;
                return Ok(if created { BranchSyncOutcome::Created } else { BranchSyncOutcome::Raced });
            }
            (Some(local), Some(upstream)) => (local, upstream),
        };

        if local == upstream {
            return Ok(BranchSyncOutcome::Unchanged);
        }
        if force {
            warn!(
                repository_id = %mirror.id(),
                branch = %branch,
                from = %local,
                to = %upstream,
                "force-syncing branch to upstream"
            );
            repo.force_set(branch, upstream).await?;
            return Ok(BranchSyncOutcome::Forced);
        }

        let relation = if reported_diverged { Ancestry::Diverged } else { ancestry(repo, local, upstream).await? };
        match relation {
            Ancestry::Equal => Ok(BranchSyncOutcome::Unchanged),
            Ancestry::LocalBehind => {
                let moved = repo.compare_and_swap(branch, Some(local), Some(upstream)).await?;
                Ok(if moved { BranchSyncOutcome::FastForwarded } else { BranchSyncOutcome::Raced })
            }
            Ancestry::LocalAhead => Ok(BranchSyncOutcome::LocalAhead),
            Ancestry::Diverged => {
                let (ahead, behind) = repo.divergence(local, upstream).await?;
                Ok(BranchSyncOutcome::Diverged { ahead, behind })
            }
        }
    }

    /// Read-triggered refresh: a background, non-forcing pass over every
    /// branch, at most once per `refresh_min_interval`. `Ok(None)` when
    /// throttled.
    pub async fn request_refresh(&self, repository_id: &RepositoryId) -> Result<Option<SyncReport>, MirrorError> {
        let mirror = self.service.mirror(repository_id)?;
        if !mirror.begin_refresh(self.service.settings().refresh_min_interval) {
            return Ok(None);
        }
        match self.sync(repository_id, SyncScope::All, false, SyncMode::Background).await {
            Ok(report) => {
                mirror.record_refresh_result(None);
                Ok(Some(report))
            }
            Err(error) => {
                warn!(repository_id = %repository_id, error = %error, "read-triggered refresh failed");
                mirror.record_refresh_result(Some(error.to_string()));
                Err(error)
            }
        }
    }
}

fn log_outcome(repository_id: &RepositoryId, branch: &BranchName, outcome: BranchSyncOutcome) {
    match outcome {
        BranchSyncOutcome::Created | BranchSyncOutcome::FastForwarded => {
            info!(repository_id = %repository_id, branch = %branch, outcome = ?outcome, "branch synced");
        }
        BranchSyncOutcome::Diverged { ahead, behind } => {
            warn!(repository_id = %repository_id, branch = %branch, ahead, behind, "branch diverged from upstream");
        }
        BranchSyncOutcome::Raced => {
            warn!(repository_id = %repository_id, branch = %branch, "branch moved during sync");
        }
        _ => debug!(repository_id = %repository_id, branch = %branch, outcome = ?outcome, "branch sync"),
    }
}
