// In-process backend: a shared commit graph, ref tables, a scripted remote
// host and a receiver that applies ref-update commands.
//
// Meant for embedding and for tests. Two checks turn concurrency bugs into
// panics: a repository built with a lock audit panics when a ref moves
// while its branch lock is not held, and the remote panics when two pushes
// to the same branch overlap.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use gitmirror_common::protocol::pktline::{encode_pkt_line, parse_receive_request, service_announcement, FLUSH_PKT};
use gitmirror_common::types::{BranchName, CommitHash, RefSnapshot, RepositoryId};

use crate::lock::{BranchKey, BranchLockTable};
use crate::mirror::{MirrorBackend, RepositoryMirror};
use crate::receive::{GitService, LocalReceiver, ReceiveError};
use crate::refs::{ancestry, Ancestry, CommitGraph, RefStore, RefStoreError};
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamFetch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct MemoryBackend;

impl MirrorBackend for MemoryBackend {
    type Repo = MemoryRepository;
    type Upstream = MemoryUpstream;
    type Receiver = MemoryReceiver;
}

// ── Objects ────────────────────────────────────────────────────────

/// Commit graph shared by every repository of one test world.
#[derive(Clone, Default)]
pub struct MemoryObjects {
    parents: Arc<Mutex<HashMap<CommitHash, Vec<CommitHash>>>>,
    next: Arc<AtomicU64>,
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new commit with the given parents.
    pub fn commit(&self, parents: &[&CommitHash]) -> CommitHash {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let hash = match CommitHash::new(format!("{n:040x}")) {
            Ok(hash) => hash,
            Err(error) => unreachable!("minted commit id is not valid hex: {error}"),
        };
        lock(&self.parents).insert(hash.clone(), parents.iter().map(|p| (*p).clone()).collect());
        hash
    }

    pub fn contains(&self, hash: &CommitHash) -> bool {
        lock(&self.parents).contains_key(hash)
    }

    /// Every commit reachable from `tip`, itself included.
    fn reachable(&self, tip: &CommitHash) -> BTreeSet<CommitHash> {
        let parents = lock(&self.parents);
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([tip.clone()]);
        while let Some(hash) = queue.pop_front() {
            if !seen.insert(hash.clone()) {
                continue;
            }
            if let Some(next) = parents.get(&hash) {
                queue.extend(next.iter().cloned());
            }
        }
        seen
    }

    pub fn is_ancestor(&self, ancestor: &CommitHash, descendant: &CommitHash) -> bool {
        self.reachable(descendant).contains(ancestor)
    }

    pub fn divergence(&self, local: &CommitHash, upstream: &CommitHash) -> (usize, usize) {
        let ours = self.reachable(local);
        let theirs = self.reachable(upstream);
        (ours.difference(&theirs).count(), theirs.difference(&ours).count())
    }
}

// ── Repository ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryRepository {
    id: RepositoryId,
    refs: Arc<Mutex<RefSnapshot>>,
    objects: MemoryObjects,
    audit: Option<BranchLockTable>,
}

impl MemoryRepository {
    pub fn new(id: RepositoryId, objects: MemoryObjects) -> Self {
        Self { id, refs: Arc::default(), objects, audit: None }
    }

    /// Panic on any ref mutation made without the branch lock held.
    pub fn with_lock_audit(mut self, locks: BranchLockTable) -> Self {
        self.audit = Some(locks);
        self
    }

    pub fn objects(&self) -> &MemoryObjects {
        &self.objects
    }

    /// Set a ref directly, bypassing the audit. Test setup only.
    pub fn seed(&self, branch: &BranchName, hash: &CommitHash) {
        lock(&self.refs).insert(branch.clone(), hash.clone());
    }

    pub fn snapshot(&self) -> RefSnapshot {
        lock(&self.refs).clone()
    }

    fn audit(&self, branch: &BranchName, action: &str) {
        if let Some(locks) = &self.audit {
            let key = BranchKey::new(&self.id, branch);
            if !locks.is_held(&key) {
                panic!("{action} of {key} without its branch lock held");
            }
        }
    }
}

impl RefStore for MemoryRepository {
    async fn get_all(&self) -> Result<RefSnapshot, RefStoreError> {
        Ok(self.snapshot())
    }

    async fn get(&self, branch: &BranchName) -> Result<Option<CommitHash>, RefStoreError> {
        Ok(lock(&self.refs).get(branch).cloned())
    }

    async fn compare_and_swap(
        &self,
        branch: &BranchName,
        expected: Option<&CommitHash>,
        new: Option<&CommitHash>,
    ) -> Result<bool, RefStoreError> {
        self.audit(branch, "compare-and-swap");
        let mut refs = lock(&self.refs);
        if refs.get(branch) != expected {
            return Ok(false);
        }
        match new {
            Some(hash) => refs.insert(branch.clone(), hash.clone()),
            None => refs.remove(branch),
        };
        Ok(true)
    }

    async fn force_set(&self, branch: &BranchName, hash: &CommitHash) -> Result<(), RefStoreError> {
        self.audit(branch, "force-set");
        lock(&self.refs).insert(branch.clone(), hash.clone());
        Ok(())
    }

    async fn delete(&self, branch: &BranchName) -> Result<(), RefStoreError> {
        self.audit(branch, "delete");
        lock(&self.refs).remove(branch);
        Ok(())
    }
}

impl CommitGraph for MemoryRepository {
    async fn is_ancestor(&self, ancestor: &CommitHash, descendant: &CommitHash) -> Result<bool, RefStoreError> {
        Ok(self.objects.is_ancestor(ancestor, descendant))
    }

    async fn divergence(&self, local: &CommitHash, upstream: &CommitHash) -> Result<(usize, usize), RefStoreError> {
        Ok(self.objects.divergence(local, upstream))
    }

    async fn create_root_commit(&self, _message: &str) -> Result<CommitHash, RefStoreError> {
        Ok(self.objects.commit(&[]))
    }
}

// ── Remote host ────────────────────────────────────────────────────

type PushHook = Box<dyn FnOnce(&MemoryRemote) + Send>;

#[derive(Default)]
struct RemoteState {
    heads: RefSnapshot,
    push_failures: VecDeque<UpstreamError>,
    lost_responses: VecDeque<UpstreamError>,
    fetch_failures: VecDeque<UpstreamError>,
    list_failures: VecDeque<UpstreamError>,
    before_push: VecDeque<PushHook>,
    push_log: Vec<(BranchName, CommitHash)>,
}

/// The external system-of-record, shared by every mirror of a test world.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
    objects: MemoryObjects,
    in_flight: Arc<Mutex<BTreeSet<BranchName>>>,
    push_delay: Arc<Mutex<Duration>>,
    fetches: Arc<AtomicUsize>,
    pushes: Arc<AtomicUsize>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::with_objects(MemoryObjects::new())
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects(objects: MemoryObjects) -> Self {
        Self {
            state: Arc::default(),
            objects,
            in_flight: Arc::default(),
            push_delay: Arc::default(),
            fetches: Arc::default(),
            pushes: Arc::default(),
        }
    }

    pub fn objects(&self) -> &MemoryObjects {
        &self.objects
    }

    /// A mirror of this remote with its own ref table.
    pub fn mirror(&self, id: &RepositoryId, audit: Option<&BranchLockTable>) -> RepositoryMirror<MemoryBackend> {
        let mut repo = MemoryRepository::new(id.clone(), self.objects.clone());
        if let Some(locks) = audit {
            repo = repo.with_lock_audit(locks.clone());
        }
        let upstream = self.client(&repo);
        let receiver = MemoryReceiver::new(repo.clone());
        RepositoryMirror::new(id.clone(), format!("memory://{id}"), repo, upstream, receiver)
    }

    /// Upstream client for a mirror whose local refs live in `local`.
    pub fn client(&self, local: &MemoryRepository) -> MemoryUpstream {
        MemoryUpstream { remote: self.clone(), local: local.clone() }
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        lock(&self.state)
    }

    pub fn head(&self, branch: &BranchName) -> Option<CommitHash> {
        self.state().heads.get(branch).cloned()
    }

    pub fn heads(&self) -> RefSnapshot {
        self.state().heads.clone()
    }

    /// Move an upstream branch behind the mirror's back.
    pub fn set_head(&self, branch: &BranchName, hash: &CommitHash) {
        self.state().heads.insert(branch.clone(), hash.clone());
    }

    pub fn fail_next_push(&self, error: UpstreamError) {
        self.state().push_failures.push_back(error);
    }

    /// Apply the next successful push, then answer it with `error` as if
    /// the response never reached the client.
    pub fn lose_next_push_response(&self, error: UpstreamError) {
        self.state().lost_responses.push_back(error);
    }

    pub fn fail_next_fetch(&self, error: UpstreamError) {
        self.state().fetch_failures.push_back(error);
    }

    pub fn fail_next_list(&self, error: UpstreamError) {
        self.state().list_failures.push_back(error);
    }

    /// Run `hook` at the start of the next push, before the lease check.
    pub fn before_next_push(&self, hook: impl FnOnce(&MemoryRemote) + Send + 'static) {
        self.state().before_push.push_back(Box::new(hook));
    }

    /// Hold every push open for `delay` to widen race windows.
    pub fn set_push_delay(&self, delay: Duration) {
        *lock(&self.push_delay) = delay;
    }

    /// Successful pushes in arrival order.
    pub fn push_log(&self) -> Vec<(BranchName, CommitHash)> {
        self.state().push_log.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    async fn push(&self, branch: &BranchName, expected: Option<&CommitHash>, new: &CommitHash) -> Result<(), UpstreamError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let _window = PushWindow::open(&self.in_flight, branch);

        let hook = self.state().before_push.pop_front();
        if let Some(hook) = hook {
            hook(self);
        }
        let delay = *lock(&self.push_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(error) = state.push_failures.pop_front() {
            return Err(error);
        }
        if !self.objects.contains(new) {
            return Err(UpstreamError::rejected(format!("unknown object {new}")));
        }
        if state.heads.get(branch) != expected {
            return Err(UpstreamError::stale(format!("! [rejected] {branch} (stale info)")));
        }
        state.heads.insert(branch.clone(), new.clone());
        state.push_log.push((branch.clone(), new.clone()));
        match state.lost_responses.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Panics when two pushes to one branch overlap.
struct PushWindow<'a> {
    in_flight: &'a Mutex<BTreeSet<BranchName>>,
    branch: BranchName,
}

impl<'a> PushWindow<'a> {
    fn open(in_flight: &'a Mutex<BTreeSet<BranchName>>, branch: &BranchName) -> Self {
        if !lock(in_flight).insert(branch.clone()) {
            panic!("overlapping upstream pushes to {branch}");
        }
        Self { in_flight, branch: branch.clone() }
    }
}

impl Drop for PushWindow<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.branch);
    }
}

/// One mirror's client of a [`MemoryRemote`].
#[derive(Clone)]
pub struct MemoryUpstream {
    remote: MemoryRemote,
    local: MemoryRepository,
}

impl MemoryUpstream {
    pub fn remote(&self) -> &MemoryRemote {
        &self.remote
    }
}

impl UpstreamClient for MemoryUpstream {
    async fn list_branches(&self) -> Result<RefSnapshot, UpstreamError> {
        let mut state = self.remote.state();
        if let Some(error) = state.list_failures.pop_front() {
            return Err(error);
        }
        Ok(state.heads.clone())
    }

    async fn fetch_branches(&self, force: bool) -> Result<UpstreamFetch, UpstreamError> {
        self.remote.fetches.fetch_add(1, Ordering::SeqCst);
        let heads = {
            let mut state = self.remote.state();
            if let Some(error) = state.fetch_failures.pop_front() {
                return Err(error);
            }
            state.heads.clone()
        };

        let mut diverged = BTreeSet::new();
        if !force {
            let local = self.local.snapshot();
            for (branch, upstream) in &heads {
                let Some(local) = local.get(branch) else { continue };
                let relation = ancestry(&self.local, local, upstream)
                    .await
                    .map_err(|e| UpstreamError::transport(e.to_string()))?;
                if relation == Ancestry::Diverged {
                    diverged.insert(branch.clone());
                }
            }
        }
        Ok(UpstreamFetch { heads, diverged })
    }

    async fn push_branch(
        &self,
        branch: &BranchName,
        expected: Option<&CommitHash>,
        new: &CommitHash,
    ) -> Result<(), UpstreamError> {
        self.remote.push(branch, expected, new).await
    }
}

// ── Receiver ───────────────────────────────────────────────────────

type ReceiveHook = Box<dyn FnOnce() + Send>;

/// Applies ref-update commands to a [`MemoryRepository`]. The request body
/// carries no pack; new commits must already exist in the shared objects.
#[derive(Clone)]
pub struct MemoryReceiver {
    repo: MemoryRepository,
    allow_non_fast_forward: bool,
    calls: Arc<AtomicUsize>,
    hooks: Arc<Mutex<VecDeque<ReceiveHook>>>,
}

impl MemoryReceiver {
    pub fn new(repo: MemoryRepository) -> Self {
        Self { repo, allow_non_fast_forward: false, calls: Arc::default(), hooks: Arc::default() }
    }

    /// Accept non-fast-forward updates, like a repository without
    /// `receive.denyNonFastForwards`.
    pub fn allow_non_fast_forward(mut self, allow: bool) -> Self {
        self.allow_non_fast_forward = allow;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Run `hook` inside the next receive, after the commands are applied.
    pub fn during_next_receive(&self, hook: impl FnOnce() + Send + 'static) {
        lock(&self.hooks).push_back(Box::new(hook));
    }

    async fn apply(&self, branch: &BranchName, old: Option<&CommitHash>, new: Option<&CommitHash>) -> Result<(), String> {
        let Some(new) = new else {
            return Err("deletion prohibited".to_string());
        };
        if !self.repo.objects.contains(new) {
            return Err("missing necessary objects".to_string());
        }
        if let Some(old) = old {
            if !self.allow_non_fast_forward && !self.repo.objects.is_ancestor(old, new) {
                return Err("non-fast-forward".to_string());
            }
        }
        match self.repo.compare_and_swap(branch, old, Some(new)).await {
            Ok(true) => Ok(()),
            Ok(false) => Err("failed to lock".to_string()),
            Err(error) => Err(error.to_string()),
        }
    }
}

impl LocalReceiver for MemoryReceiver {
    async fn advertise_refs(&self, service: GitService) -> Result<Vec<u8>, ReceiveError> {
        let mut out = service_announcement(service.as_str());
        let refs = self.repo.snapshot();
        let capabilities = "report-status delete-refs ofs-delta";
        if refs.is_empty() {
            let zero = "0".repeat(40);
            out.extend(encode_pkt_line(format!("{zero} capabilities^{{}}\0{capabilities}\n").as_bytes()));
        }
        for (index, (branch, hash)) in refs.iter().enumerate() {
            let line = if index == 0 {
                format!("{hash} {}\0{capabilities}\n", branch.full_ref())
            } else {
                format!("{hash} {}\n", branch.full_ref())
            };
            out.extend(encode_pkt_line(line.as_bytes()));
        }
        out.extend_from_slice(FLUSH_PKT);
        Ok(out)
    }

    async fn receive_pack(&self, body: &[u8], _limit: Duration) -> Result<Vec<u8>, ReceiveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let request = parse_receive_request(body).map_err(|e| ReceiveError::Failed(e.to_string()))?;

        let mut out = encode_pkt_line(b"unpack ok\n");
        for command in &request.commands {
            let status = match command.branch() {
                Ok(branch) => self.apply(&branch, command.old.as_ref(), command.new.as_ref()).await,
                Err(error) => Err(error.to_string()),
            };
            let line = match status {
                Ok(()) => format!("ok {}\n", command.refname),
                Err(reason) => format!("ng {} {reason}\n", command.refname),
            };
            out.extend(encode_pkt_line(line.as_bytes()));
        }
        out.extend_from_slice(FLUSH_PKT);

        let hook = lock(&self.hooks).pop_front();
        if let Some(hook) = hook {
            hook();
        }
        Ok(out)
    }

    async fn upload_pack(&self, _body: &[u8]) -> Result<Vec<u8>, ReceiveError> {
        Ok(encode_pkt_line(b"NAK\n"))
    }
}
