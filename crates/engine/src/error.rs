// Engine error taxonomy.
//
// `is_retryable` is what lets a caller tell "resync and retry now" apart
// from "needs a human". ForwardRejected and RollbackInconsistency are never
// downgraded to warnings.

use std::time::Duration;

use gitmirror_common::types::{BranchName, CommitHash, RepositoryId};
use thiserror::Error;
use uuid::Uuid;

use crate::lock::LockWaitExpired;
use crate::receive::ReceiveError;
use crate::refs::RefStoreError;
use crate::upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("branch {branch} of {repository_id} is stale: {reason}; resync and retry")]
    StaleRefConflict {
        repository_id: RepositoryId,
        branch: BranchName,
        reason: String,
        local: Option<CommitHash>,
        upstream: Option<CommitHash>,
    },

    #[error("upstream rejected {branch} of {repository_id}: {message}")]
    ForwardRejected {
        repository_id: RepositoryId,
        branch: BranchName,
        operation_id: Option<Uuid>,
        message: String,
    },

    #[error("forwarding {branch} of {repository_id} failed: {message}; the local update was reverted")]
    ForwardTransport {
        repository_id: RepositoryId,
        branch: BranchName,
        operation_id: Option<Uuid>,
        message: String,
    },

    #[error("timed out after {}s waiting for the lock on {branch} of {repository_id}", .waited.as_secs())]
    LockTimeout {
        repository_id: RepositoryId,
        branch: BranchName,
        waited: Duration,
        holder: Option<String>,
    },

    #[error(
        "rollback of {branch} in {repository_id} failed: expected {}, found {}; branch quarantined",
        .expected.as_ref().map_or("nothing", CommitHash::as_str),
        .found.as_ref().map_or("nothing", CommitHash::as_str)
    )]
    RollbackInconsistency {
        repository_id: RepositoryId,
        branch: BranchName,
        operation_id: Option<Uuid>,
        expected: Option<CommitHash>,
        restore_to: Option<CommitHash>,
        found: Option<CommitHash>,
    },

    #[error("{branch} of {repository_id} was created with unrelated histories (local {local}, upstream {upstream})")]
    OrphanBranchRace {
        repository_id: RepositoryId,
        branch: BranchName,
        local: CommitHash,
        upstream: CommitHash,
    },

    #[error("{branch} of {repository_id} exists on the mirror (at {local}) but not upstream; publish it with ensure_branch")]
    BranchNotUpstream { repository_id: RepositoryId, branch: BranchName, local: CommitHash },

    #[error("branch {branch} of {repository_id} is quarantined: {reason}")]
    BranchQuarantined { repository_id: RepositoryId, branch: BranchName, reason: String },

    #[error("force sync of multi-writer branch {branch} of {repository_id} is not allowed")]
    ForceSyncForbidden { repository_id: RepositoryId, branch: BranchName },

    #[error("repository {0} is not attached")]
    RepositoryNotFound(RepositoryId),

    #[error("repository {0} is already attached")]
    RepositoryExists(RepositoryId),

    #[error("invalid push: {0}")]
    InvalidPush(String),

    #[error("forward queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    #[error("upstream unavailable for {repository_id}: {source}")]
    Upstream {
        repository_id: RepositoryId,
        #[source]
        source: UpstreamError,
    },

    #[error(transparent)]
    RefStore(#[from] RefStoreError),

    #[error(transparent)]
    Receive(#[from] ReceiveError),
}

impl MirrorError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StaleRefConflict { .. }
                | Self::ForwardTransport { .. }
                | Self::LockTimeout { .. }
                | Self::QueueFull { .. }
                | Self::Upstream { .. }
        )
    }

    /// Stable machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StaleRefConflict { .. } => "stale_ref_conflict",
            Self::ForwardRejected { .. } => "forward_rejected",
            Self::ForwardTransport { .. } => "forward_transport",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::RollbackInconsistency { .. } => "rollback_inconsistency",
            Self::OrphanBranchRace { .. } => "orphan_branch_race",
            Self::BranchNotUpstream { .. } => "branch_not_upstream",
            Self::BranchQuarantined { .. } => "branch_quarantined",
            Self::ForceSyncForbidden { .. } => "force_sync_forbidden",
            Self::RepositoryNotFound(_) => "repository_not_found",
            Self::RepositoryExists(_) => "repository_exists",
            Self::InvalidPush(_) => "invalid_push",
            Self::QueueFull { .. } => "queue_full",
            Self::Upstream { .. } => "upstream_unavailable",
            Self::RefStore(_) => "ref_store",
            Self::Receive(_) => "receive",
        }
    }

    pub fn branch(&self) -> Option<&BranchName> {
        match self {
            Self::StaleRefConflict { branch, .. }
            | Self::ForwardRejected { branch, .. }
            | Self::ForwardTransport { branch, .. }
            | Self::LockTimeout { branch, .. }
            | Self::RollbackInconsistency { branch, .. }
            | Self::OrphanBranchRace { branch, .. }
            | Self::BranchNotUpstream { branch, .. }
            | Self::BranchQuarantined { branch, .. }
            | Self::ForceSyncForbidden { branch, .. } => Some(branch),
            _ => None,
        }
    }

    pub fn operation_id(&self) -> Option<Uuid> {
        match self {
            Self::ForwardRejected { operation_id, .. }
            | Self::ForwardTransport { operation_id, .. }
            | Self::RollbackInconsistency { operation_id, .. } => *operation_id,
            _ => None,
        }
    }

    pub(crate) fn stale(
        repository_id: &RepositoryId,
        branch: &BranchName,
        reason: impl Into<String>,
        local: Option<&CommitHash>,
        upstream: Option<&CommitHash>,
    ) -> Self {
        Self::StaleRefConflict {
            repository_id: repository_id.clone(),
            branch: branch.clone(),
            reason: reason.into(),
            local: local.cloned(),
            upstream: upstream.cloned(),
        }
    }

    pub(crate) fn upstream(repository_id: &RepositoryId, source: UpstreamError) -> Self {
        Self::Upstream { repository_id: repository_id.clone(), source }
    }
}

impl From<LockWaitExpired> for MirrorError {
    fn from(expired: LockWaitExpired) -> Self {
        Self::LockTimeout {
            repository_id: expired.key.repository_id,
            branch: expired.key.branch,
            waited: expired.waited,
            holder: expired.holder.map(|holder| holder.purpose.as_str().to_string()),
        }
    }
}
