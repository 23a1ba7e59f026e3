// Mirror registry.
//
// A `MirrorService` owns every attached repository mirror together with the
// state shared across them: the branch lock table, the quarantine, the
// forward queue and the post-push notifier. Sync, push, bootstrap and the
// retry worker are thin views over one service.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gitmirror_common::types::{BranchName, RepositoryId};
use tokio::time::Instant;
use tracing::info;

use crate::bootstrap::BranchBootstrap;
use crate::config::{EngineSettings, RepositorySpec};
use crate::error::MirrorError;
use crate::git::{GitReceivePack, GitRepository, GitUpstreamClient};
use crate::lock::{BranchKey, BranchLockTable};
use crate::notify::{PostPushNotifier, TracingNotifier};
use crate::push::PushCoordinator;
use crate::quarantine::{Quarantine, QuarantineRecord};
use crate::receive::LocalReceiver;
use crate::refs::{CommitGraph, RefStore, RefStoreError};
use crate::retry::{start_forward_worker, ForwardJob, ForwardQueue, ForwardWorkerHandle};
use crate::sync::SyncEngine;
use crate::upstream::UpstreamClient;

/// The three collaborators a mirror is built from.
pub trait MirrorBackend: Send + Sync + 'static {
    type Repo: RefStore + CommitGraph;
    type Upstream: UpstreamClient;
    type Receiver: LocalReceiver;
}

/// Git CLI over a bare repository on local disk.
pub struct GitBackend;

impl MirrorBackend for GitBackend {
    type Repo = GitRepository;
    type Upstream = GitUpstreamClient;
    type Receiver = GitReceivePack;
}

// ── Repository mirror ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct MirrorStatus {
    last_full_sync_at: Option<DateTime<Utc>>,
    last_refresh_started: Option<Instant>,
    last_refresh_error: Option<String>,
}

pub struct RepositoryMirror<B: MirrorBackend> {
    id: RepositoryId,
    endpoint: String,
    local_path: Option<PathBuf>,
    multi_writer: BTreeSet<BranchName>,
    repo: B::Repo,
    upstream: B::Upstream,
    receiver: B::Receiver,
    status: Mutex<MirrorStatus>,
}

impl<B: MirrorBackend> RepositoryMirror<B> {
    pub fn new(
        id: RepositoryId,
        endpoint: impl Into<String>,
        repo: B::Repo,
        upstream: B::Upstream,
        receiver: B::Receiver,
    ) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            local_path: None,
            multi_writer: BTreeSet::new(),
            repo,
            upstream,
            receiver,
            status: Mutex::new(MirrorStatus::default()),
        }
    }

    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn with_multi_writer_branches(mut self, branches: impl IntoIterator<Item = BranchName>) -> Self {
        self.multi_writer.extend(branches);
        self
    }

    pub fn id(&self) -> &RepositoryId {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    pub fn is_multi_writer(&self, branch: &BranchName) -> bool {
        self.multi_writer.contains(branch)
    }

    pub fn multi_writer_branches(&self) -> &BTreeSet<BranchName> {
        &self.multi_writer
    }

    pub fn repo(&self) -> &B::Repo {
        &self.repo
    }

    pub fn upstream(&self) -> &B::Upstream {
        &self.upstream
    }

    pub fn receiver(&self) -> &B::Receiver {
        &self.receiver
    }

    fn status(&self) -> std::sync::MutexGuard<'_, MirrorStatus> {
        match self.status.lock() {
            Ok(status) => status,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn last_full_sync_at(&self) -> Option<DateTime<Utc>> {
        self.status().last_full_sync_at
    }

    pub fn last_refresh_error(&self) -> Option<String> {
        self.status().last_refresh_error.clone()
    }

    pub(crate) fn record_full_sync(&self, at: DateTime<Utc>) {
        self.status().last_full_sync_at = Some(at);
    }

    /// Claim the next read-triggered refresh slot. False while the previous
    /// one started less than `min_interval` ago.
    pub(crate) fn begin_refresh(&self, min_interval: Duration) -> bool {
        let now = Instant::now();
        let mut status = self.status();
        if let Some(started) = status.last_refresh_started {
            if now.duration_since(started) < min_interval {
                return false;
            }
        }
        status.last_refresh_started = Some(now);
        true
    }

    pub(crate) fn record_refresh_result(&self, error: Option<String>) {
        self.status().last_refresh_error = error;
    }
}

impl RepositoryMirror<GitBackend> {
    /// Open (or initialize) the bare mirror repository described by `spec`.
    pub async fn open(spec: &RepositorySpec, settings: &EngineSettings) -> Result<Self, RefStoreError> {
        let repo = GitRepository::open_or_init(&spec.local_path).await?;
        let upstream = GitUpstreamClient::new(
            repo.clone(),
            spec.endpoint.clone(),
            spec.credentials.clone(),
            settings.upstream_timeout,
        );
        let receiver = GitReceivePack::new(repo.runner().clone());
        Ok(Self::new(spec.id.clone(), spec.endpoint.as_str(), repo, upstream, receiver)
            .with_local_path(&spec.local_path)
            .with_multi_writer_branches(spec.multi_writer_branches.iter().cloned()))
    }
}

// ── Service ────────────────────────────────────────────────────────

struct ServiceInner<B: MirrorBackend> {
    mirrors: RwLock<BTreeMap<RepositoryId, Arc<RepositoryMirror<B>>>>,
    locks: BranchLockTable,
    quarantine: Quarantine,
    queue: ForwardQueue,
    notifier: Arc<dyn PostPushNotifier>,
    settings: EngineSettings,
}

pub struct MirrorService<B: MirrorBackend> {
    inner: Arc<ServiceInner<B>>,
}

impl<B: MirrorBackend> Clone for MirrorService<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B: MirrorBackend> MirrorService<B> {
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_notifier(settings, TracingNotifier)
    }

    pub fn with_notifier(settings: EngineSettings, notifier: impl PostPushNotifier) -> Self {
        Self::with_lock_table(settings, notifier, BranchLockTable::new())
    }

    /// Use an existing lock table, e.g. one a lock-audited store also sees.
    pub fn with_lock_table(
        settings: EngineSettings,
        notifier: impl PostPushNotifier,
        locks: BranchLockTable,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                mirrors: RwLock::new(BTreeMap::new()),
                locks,
                quarantine: Quarantine::new(),
                queue: ForwardQueue::new(settings.retry),
                notifier: Arc::new(notifier),
                settings,
            }),
        }
    }

    fn mirrors_read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<RepositoryId, Arc<RepositoryMirror<B>>>> {
        match self.inner.mirrors.read() {
            Ok(mirrors) => mirrors,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mirrors_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<RepositoryId, Arc<RepositoryMirror<B>>>> {
        match self.inner.mirrors.write() {
            Ok(mirrors) => mirrors,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn attach(&self, mirror: RepositoryMirror<B>) -> Result<Arc<RepositoryMirror<B>>, MirrorError> {
        let mut mirrors = self.mirrors_write();
        if mirrors.contains_key(mirror.id()) {
            return Err(MirrorError::RepositoryExists(mirror.id().clone()));
        }
        info!(repository_id = %mirror.id(), endpoint = %mirror.endpoint(), "mirror attached");
        let mirror = Arc::new(mirror);
        mirrors.insert(mirror.id().clone(), Arc::clone(&mirror));
        Ok(mirror)
    }

    /// Remove a mirror. In-flight operations keep their handle and finish.
    pub fn detach(&self, repository_id: &RepositoryId) -> Result<Arc<RepositoryMirror<B>>, MirrorError> {
        let mirror = self
            .mirrors_write()
            .remove(repository_id)
            .ok_or_else(|| MirrorError::RepositoryNotFound(repository_id.clone()))?;
        self.inner.locks.forget_repository(repository_id);
        info!(repository_id = %repository_id, "mirror detached");
        Ok(mirror)
    }

    pub fn mirror(&self, repository_id: &RepositoryId) -> Result<Arc<RepositoryMirror<B>>, MirrorError> {
        self.mirrors_read()
            .get(repository_id)
            .cloned()
            .ok_or_else(|| MirrorError::RepositoryNotFound(repository_id.clone()))
    }

    pub fn repository_ids(&self) -> Vec<RepositoryId> {
        self.mirrors_read().keys().cloned().collect()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn locks(&self) -> &BranchLockTable {
        &self.inner.locks
    }

    pub fn quarantine(&self) -> &Quarantine {
        &self.inner.quarantine
    }

    pub fn forward_queue(&self) -> &ForwardQueue {
        &self.inner.queue
    }

    pub(crate) fn notifier(&self) -> &dyn PostPushNotifier {
        self.inner.notifier.as_ref()
    }

    pub fn sync_engine(&self) -> SyncEngine<B> {
        SyncEngine::new(self.clone())
    }

    pub fn coordinator(&self) -> PushCoordinator<B> {
        PushCoordinator::new(self.clone())
    }

    pub fn bootstrap(&self) -> BranchBootstrap<B> {
        BranchBootstrap::new(self.clone())
    }

    /// Start retrying queued forwards in the background.
    pub fn start_forward_worker(&self) -> ForwardWorkerHandle {
        start_forward_worker(self.inner.queue.clone(), self.coordinator())
    }

    pub fn quarantined(&self, repository_id: &RepositoryId) -> Result<Vec<QuarantineRecord>, MirrorError> {
        self.mirror(repository_id)?;
        Ok(self.inner.quarantine.list(repository_id))
    }

    /// Operator release after manual reconciliation. Refs are untouched.
    pub fn release_quarantine(
        &self,
        repository_id: &RepositoryId,
        branch: &BranchName,
    ) -> Result<Option<QuarantineRecord>, MirrorError> {
        self.mirror(repository_id)?;
        Ok(self.inner.quarantine.release(&BranchKey::new(repository_id, branch)))
    }

    pub fn forward_jobs(&self, repository_id: &RepositoryId) -> Result<Vec<ForwardJob>, MirrorError> {
        self.mirror(repository_id)?;
        Ok(self.inner.queue.list(repository_id))
    }
}
