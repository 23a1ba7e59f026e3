// JSON API for agents and operators.
//
// Push, sync, bootstrap and promote mirror the git endpoints for callers
// that are not git clients. The quarantine and forward-queue views are the
// operator's window into branches that need a human; the status view puts
// both next to each branch's local tip.

use std::collections::{BTreeMap, BTreeSet};

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Json, Path, State},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use gitmirror_common::protocol::api::{
    BranchEntry, BranchListResponse, EnsureBranchRequest, EnsureBranchResponse, ForwardJobEntry, ForwardJobState,
    PromoteRequest, PromoteResponse, PushResponse, QuarantineEntry, SyncRequest, SyncResponse,
};
use gitmirror_common::types::{BranchName, CommitHash, RepositoryId};
use gitmirror_engine::refs::RefStore;
use gitmirror_engine::{ForwardPolicy, MirrorBackend, MirrorError, SyncMode, SyncScope};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::{parse_repository_id, AppState};
use crate::error::{ErrorCode, ServerError};

#[derive(Debug, Serialize, Deserialize)]
pub struct RepositoryListResponse {
    pub repositories: Vec<RepositoryId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuarantineListResponse {
    pub repository_id: RepositoryId,
    pub branches: Vec<QuarantineEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuarantineReleaseResponse {
    pub repository_id: RepositoryId,
    pub released: QuarantineEntry,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForwardListResponse {
    pub repository_id: RepositoryId,
    pub jobs: Vec<ForwardJobEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RepositoryStatusResponse {
    pub repository_id: RepositoryId,
    pub forward_policy: ForwardPolicy,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    /// Failure of the most recent background refresh, cleared by the next
    /// successful one.
    pub last_refresh_error: Option<String>,
    pub branches: Vec<BranchStatusEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BranchStatusEntry {
    pub branch: BranchName,
    pub local: Option<CommitHash>,
    pub multi_writer: bool,
    pub quarantine: Option<QuarantineEntry>,
    /// Latest forward still waiting for (or being tried against) upstream.
    pub pending_forward: Option<ForwardJobEntry>,
}

impl BranchStatusEntry {
    fn new(branch: BranchName) -> Self {
        Self { branch, local: None, multi_writer: false, quarantine: None, pending_forward: None }
    }
}

pub fn router<B: MirrorBackend>(state: AppState<B>) -> Router {
    Router::new()
        .route("/api/repos", get(list_repositories::<B>))
        .route("/api/repos/{repository_id}/push", post(push::<B>))
        .route("/api/repos/{repository_id}/sync", post(sync::<B>))
        .route("/api/repos/{repository_id}/branches", get(list_branches::<B>))
        .route("/api/repos/{repository_id}/branches/ensure", post(ensure_branch::<B>))
        .route("/api/repos/{repository_id}/promote", post(promote::<B>))
        .route("/api/repos/{repository_id}/quarantine", get(list_quarantine::<B>))
        .route("/api/repos/{repository_id}/quarantine/{*branch}", delete(release_quarantine::<B>))
        .route("/api/repos/{repository_id}/forwards", get(list_forwards::<B>))
        .route("/api/repos/{repository_id}/status", get(repository_status::<B>))
        .with_state(state)
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServerError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ServerError::new(ErrorCode::ValidationFailed, rejection.body_text()))
}

async fn list_repositories<B: MirrorBackend>(State(state): State<AppState<B>>) -> Json<RepositoryListResponse> {
    Json(RepositoryListResponse { repositories: state.service.repository_ids() })
}

/// Body is a raw receive-pack request, same as the git endpoint.
async fn push<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
    body: Bytes,
) -> Result<Json<PushResponse>, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let outcome = state.push(repository_id, body.to_vec()).await?;
    Ok(Json(outcome.to_response()))
}

async fn sync<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncResponse>, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let request = json_body(payload)?;
    let scope = match request.branches {
        Some(branches) if branches.is_empty() => {
            return Err(ServerError::new(ErrorCode::ValidationFailed, "branches must not be empty when given"));
        }
        Some(branches) => SyncScope::Only(branches.into_iter().collect::<BTreeSet<_>>()),
        None => SyncScope::All,
    };

    let report =
        state.service.sync_engine().sync(&repository_id, scope, request.force, SyncMode::Foreground).await?;
    info!(
        repository_id = %repository_id,
        branches = report.branches.len(),
        force = request.force,
        "sync requested"
    );
    Ok(Json(report.to_response()))
}

async fn list_branches<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
) -> Result<Json<BranchListResponse>, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let mirror = state.service.mirror(&repository_id)?;
    if let Err(error) = state.service.sync_engine().request_refresh(&repository_id).await {
        debug!(repository_id = %repository_id, error = %error, "listing branches from local state");
    }

    let refs = mirror.repo().get_all().await.map_err(MirrorError::from)?;
    Ok(Json(BranchListResponse {
        repository_id,
        branches: refs.into_iter().map(|(branch, commit)| BranchEntry { branch, commit }).collect(),
        last_full_sync_at: mirror.last_full_sync_at(),
        refresh_error: mirror.last_refresh_error(),
    }))
}

async fn ensure_branch<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
    payload: Result<Json<EnsureBranchRequest>, JsonRejection>,
) -> Result<Json<EnsureBranchResponse>, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let request = json_body(payload)?;
    let outcome = state
        .service
        .bootstrap()
        .ensure_branch(&repository_id, &request.branch, request.message.as_deref())
        .await?;
    Ok(Json(outcome.to_response()))
}

async fn promote<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
    payload: Result<Json<PromoteRequest>, JsonRejection>,
) -> Result<Json<PromoteResponse>, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let request = json_body(payload)?;
    let outcome = state.service.coordinator().promote(&repository_id, &request.source, &request.target).await?;
    Ok(Json(outcome.to_response()))
}

async fn list_quarantine<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
) -> Result<Json<QuarantineListResponse>, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let branches = state.service.quarantined(&repository_id)?.iter().map(|record| record.to_entry()).collect();
    Ok(Json(QuarantineListResponse { repository_id, branches }))
}

async fn release_quarantine<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path((repository_id, branch)): Path<(String, String)>,
) -> Result<Json<QuarantineReleaseResponse>, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let branch = BranchName::new(branch)?;
    let released = state.service.release_quarantine(&repository_id, &branch)?.ok_or_else(|| {
        ServerError::new(ErrorCode::NotFound, format!("branch {branch} is not quarantined"))
    })?;

    info!(repository_id = %repository_id, branch = %branch, "quarantine released by operator");
    Ok(Json(QuarantineReleaseResponse { repository_id, released: released.to_entry() }))
}

async fn list_forwards<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
) -> Result<Json<ForwardListResponse>, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let jobs = state.service.forward_jobs(&repository_id)?.iter().map(|job| job.to_entry()).collect();
    Ok(Json(ForwardListResponse { repository_id, jobs }))
}

/// Local state only; unlike the branch listing this never contacts upstream.
async fn repository_status<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
) -> Result<Json<RepositoryStatusResponse>, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let mirror = state.service.mirror(&repository_id)?;
    let refs = mirror.repo().get_all().await.map_err(MirrorError::from)?;

    let mut branches: BTreeMap<BranchName, BranchStatusEntry> = BTreeMap::new();
    for (branch, commit) in refs {
        branches.entry(branch.clone()).or_insert_with(|| BranchStatusEntry::new(branch)).local = Some(commit);
    }
    for record in state.service.quarantined(&repository_id)? {
        let branch = record.key.branch.clone();
        branches.entry(branch.clone()).or_insert_with(|| BranchStatusEntry::new(branch)).quarantine =
            Some(record.to_entry());
    }
    for job in state.service.forward_jobs(&repository_id)? {
        if !matches!(job.state, ForwardJobState::Pending | ForwardJobState::InFlight) {
            continue;
        }
        let branch = job.key.branch.clone();
        branches.entry(branch.clone()).or_insert_with(|| BranchStatusEntry::new(branch)).pending_forward =
            Some(job.to_entry());
    }
    for branch in mirror.multi_writer_branches() {
        branches.entry(branch.clone()).or_insert_with(|| BranchStatusEntry::new(branch.clone())).multi_writer = true;
    }

    Ok(Json(RepositoryStatusResponse {
        repository_id,
        forward_policy: state.service.settings().forward_policy,
        last_full_sync_at: mirror.last_full_sync_at(),
        last_refresh_error: mirror.last_refresh_error(),
        branches: branches.into_values().collect(),
    }))
}
