// Local ref table and commit graph of one mirror repository.
//
// Nothing here takes a BranchLock. Callers hold the lock across every
// read-then-write sequence; the store only guarantees that a single
// compare-and-swap is atomic.

use std::future::Future;

use gitmirror_common::types::{BranchName, CommitHash, RefSnapshot};
use thiserror::Error;

use crate::git::GitCommandError;

#[derive(Debug, Error)]
pub enum RefStoreError {
    #[error(transparent)]
    Git(#[from] GitCommandError),

    #[error("repository I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected git output: {0}")]
    Corrupt(String),
}

/// Branch table of a local repository.
pub trait RefStore: Send + Sync + 'static {
    /// Snapshot of every `refs/heads/*` entry.
    fn get_all(&self) -> impl Future<Output = Result<RefSnapshot, RefStoreError>> + Send;

    fn get(
        &self,
        branch: &BranchName,
    ) -> impl Future<Output = Result<Option<CommitHash>, RefStoreError>> + Send;

    /// Atomically move `branch` from `expected` to `new`.
    ///
    /// `expected = None` requires the branch to be absent; `new = None`
    /// deletes it. Returns `false` when the current value did not match.
    fn compare_and_swap(
        &self,
        branch: &BranchName,
        expected: Option<&CommitHash>,
        new: Option<&CommitHash>,
    ) -> impl Future<Output = Result<bool, RefStoreError>> + Send;

    /// Unconditionally point `branch` at `hash`.
    fn force_set(
        &self,
        branch: &BranchName,
        hash: &CommitHash,
    ) -> impl Future<Output = Result<(), RefStoreError>> + Send;

    fn delete(&self, branch: &BranchName) -> impl Future<Output = Result<(), RefStoreError>> + Send;
}

/// Object-graph questions the ref table cannot answer.
pub trait CommitGraph: Send + Sync + 'static {
    /// True when `ancestor` is reachable from `descendant` (or equal to it).
    fn is_ancestor(
        &self,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> impl Future<Output = Result<bool, RefStoreError>> + Send;

    /// Commits only in `local` and only in `upstream`, as `(ahead, behind)`.
    fn divergence(
        &self,
        local: &CommitHash,
        upstream: &CommitHash,
    ) -> impl Future<Output = Result<(usize, usize), RefStoreError>> + Send;

    /// Create a parentless commit with an empty tree.
    fn create_root_commit(
        &self,
        message: &str,
    ) -> impl Future<Output = Result<CommitHash, RefStoreError>> + Send;
}

/// Relationship between a local tip and an upstream tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ancestry {
    Equal,
    /// Local is behind: upstream contains it.
    LocalBehind,
    /// Local is ahead: local contains upstream.
    LocalAhead,
    Diverged,
}

/// Classify `local` against `upstream` with at most two graph queries.
pub async fn ancestry<G: CommitGraph>(
    graph: &G,
    local: &CommitHash,
    upstream: &CommitHash,
) -> Result<Ancestry, RefStoreError> {
    if local == upstream {
        return Ok(Ancestry::Equal);
    }
    if graph.is_ancestor(local, upstream).await? {
        return Ok(Ancestry::LocalBehind);
    }
    if graph.is_ancestor(upstream, local).await? {
        return Ok(Ancestry::LocalAhead);
    }
    Ok(Ancestry::Diverged)
}
