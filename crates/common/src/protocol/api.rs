// JSON payloads of the mirror's HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{BranchName, CommitHash, RepositoryId};

/// Response header listing the branches a smart-HTTP push moved.
pub const PUSHED_BRANCHES_HEADER: &str = "x-gitmirror-pushed";

// ── Push ────────────────────────────────────────────────────────────

/// How far a pushed branch got before the request returned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    /// Accepted locally and forwarded to the upstream host.
    Forwarded,
    /// Accepted locally; forwarding was queued for retry.
    Queued,
}

impl ForwardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forwarded => "forwarded",
            Self::Queued => "queued",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushedBranch {
    pub branch: BranchName,
    pub commit: CommitHash,
    pub status: ForwardStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushResponse {
    pub operation_id: Uuid,
    pub repository_id: RepositoryId,
    pub branches: Vec<PushedBranch>,
}

/// Render pushed branches for [`PUSHED_BRANCHES_HEADER`]:
/// `main=<hash>,docs=<hash>;queued`.
pub fn format_pushed_header(branches: &[PushedBranch]) -> String {
    branches
        .iter()
        .map(|b| match b.status {
            ForwardStatus::Forwarded => format!("{}={}", b.branch, b.commit),
            ForwardStatus::Queued => format!("{}={};queued", b.branch, b.commit),
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ── Sync ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncRequest {
    /// Branches to sync; all local and upstream branches when absent.
    pub branches: Option<Vec<BranchName>>,
    pub force: bool,
}

/// Per-branch result of a sync pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Unchanged,
    Created,
    FastForwarded,
    Forced,
    LocalAhead,
    LocalOnly,
    Diverged,
    Raced,
    SkippedQuarantined,
    SkippedMultiWriter,
    SkippedPendingForward,
    SkippedContended,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchSyncEntry {
    pub branch: BranchName,
    pub status: SyncStatus,
    pub local: Option<CommitHash>,
    pub upstream: Option<CommitHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ahead: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behind: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncResponse {
    pub repository_id: RepositoryId,
    pub synced_at: DateTime<Utc>,
    pub branches: Vec<BranchSyncEntry>,
}

// ── Branches ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchEntry {
    pub branch: BranchName,
    pub commit: CommitHash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchListResponse {
    pub repository_id: RepositoryId,
    pub branches: Vec<BranchEntry>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    /// Set when the read-triggered refresh failed; the list is then the
    /// last known local state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnsureBranchRequest {
    pub branch: BranchName,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStatus {
    /// Branch already existed locally and upstream.
    Existing,
    /// Branch existed upstream only and was adopted locally.
    Adopted,
    /// Branch existed locally only and was published upstream.
    Published,
    /// Neither side had it; a root commit was created and published.
    Created,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnsureBranchResponse {
    pub branch: BranchName,
    pub commit: CommitHash,
    pub status: BootstrapStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromoteRequest {
    pub source: BranchName,
    pub target: BranchName,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromoteResponse {
    pub operation_id: Uuid,
    pub target: BranchName,
    pub commit: CommitHash,
    pub status: ForwardStatus,
}

// ── Operator views ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuarantineEntry {
    pub branch: BranchName,
    pub reason: String,
    pub local: Option<CommitHash>,
    pub expected: Option<CommitHash>,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForwardJobState {
    Pending,
    InFlight,
    Forwarded,
    Dead,
}

impl ForwardJobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Forwarded => "forwarded",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Forwarded | Self::Dead)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardJobEntry {
    pub id: Uuid,
    pub branch: BranchName,
    pub commit: CommitHash,
    pub expected_upstream: Option<CommitHash>,
    pub attempts: u32,
    pub state: ForwardJobState,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
