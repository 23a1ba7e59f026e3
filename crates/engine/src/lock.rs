// Branch locks: mutual exclusion keyed by (repository, branch).
//
// Every read-then-write of a branch ref holds its lock for the whole
// sequence: pre-sync, receive, forward, retries, bootstrap and every sync
// pass. Locks are created lazily and never persisted.
//
// Fairness: each key is a tokio Mutex, which queues waiters FIFO. Background
// syncs only ever `try_acquire` and skip contended branches, so they can
// neither wait in front of a push nor starve behind one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gitmirror_common::types::{BranchName, RepositoryId};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchKey {
    pub repository_id: RepositoryId,
    pub branch: BranchName,
}

impl BranchKey {
    pub fn new(repository_id: &RepositoryId, branch: &BranchName) -> Self {
        Self { repository_id: repository_id.clone(), branch: branch.clone() }
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository_id, self.branch)
    }
}

/// What the holder is doing, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPurpose {
    Push,
    Sync,
    BackgroundSync,
    ForwardRetry,
    Bootstrap,
    Promote,
}

impl LockPurpose {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Sync => "sync",
            Self::BackgroundSync => "background-sync",
            Self::ForwardRetry => "forward-retry",
            Self::Bootstrap => "bootstrap",
            Self::Promote => "promote",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub token: Uuid,
    pub purpose: LockPurpose,
    pub acquired_at: DateTime<Utc>,
}

/// A bounded wait ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockWaitExpired {
    pub key: BranchKey,
    pub waited: Duration,
    pub holder: Option<LockHolder>,
}

struct LockSlot {
    mutex: Arc<Mutex<()>>,
    holder: StdMutex<Option<LockHolder>>,
}

impl LockSlot {
    fn new() -> Self {
        Self { mutex: Arc::new(Mutex::new(())), holder: StdMutex::new(None) }
    }

    fn holder(&self) -> Option<LockHolder> {
        self.holder.lock().map(|h| h.clone()).unwrap_or(None)
    }
}

/// Shared table of branch locks. Cloning shares the table.
#[derive(Clone, Default)]
pub struct BranchLockTable {
    slots: Arc<StdMutex<HashMap<BranchKey, Arc<LockSlot>>>>,
}

impl BranchLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &BranchKey) -> Arc<LockSlot> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(slots.entry(key.clone()).or_insert_with(|| Arc::new(LockSlot::new())))
    }

    /// Wait up to `wait` for the lock.
    pub async fn acquire(
        &self,
        key: &BranchKey,
        purpose: LockPurpose,
        wait: Duration,
    ) -> Result<BranchGuard, LockWaitExpired> {
        self.acquire_until(key, purpose, Instant::now() + wait, wait).await
    }

    async fn acquire_until(
        &self,
        key: &BranchKey,
        purpose: LockPurpose,
        deadline: Instant,
        wait: Duration,
    ) -> Result<BranchGuard, LockWaitExpired> {
        let slot = self.slot(key);
        let started = Instant::now();
        match tokio::time::timeout_at(deadline, Arc::clone(&slot.mutex).lock_owned()).await {
            Ok(guard) => Ok(BranchGuard::install(key.clone(), slot, guard, purpose, started)),
            Err(_) => {
                let holder = slot.holder();
                warn!(
                    key = %key,
                    purpose = purpose.as_str(),
                    waited_ms = wait.as_millis() as u64,
                    holder = ?holder.as_ref().map(|h| h.purpose.as_str()),
                    "branch lock wait expired"
                );
                Err(LockWaitExpired { key: key.clone(), waited: wait, holder })
            }
        }
    }

    /// Take the lock only if nobody holds it or is queued for it.
    pub fn try_acquire(&self, key: &BranchKey, purpose: LockPurpose) -> Option<BranchGuard> {
        let slot = self.slot(key);
        let guard = Arc::clone(&slot.mutex).try_lock_owned().ok()?;
        Some(BranchGuard::install(key.clone(), slot, guard, purpose, Instant::now()))
    }

    /// Lock several branches of one repository in sorted order, sharing one
    /// deadline. On failure every lock taken so far is released.
    pub async fn acquire_many(
        &self,
        repository_id: &RepositoryId,
        branches: &BTreeSet<BranchName>,
        purpose: LockPurpose,
        wait: Duration,
    ) -> Result<LockedBranches, LockWaitExpired> {
        let deadline = Instant::now() + wait;
        let mut locked = LockedBranches::new(repository_id.clone());
        for branch in branches {
            let key = BranchKey::new(repository_id, branch);
            let guard = self.acquire_until(&key, purpose, deadline, wait).await?;
            locked.guards.insert(branch.clone(), guard);
        }
        Ok(locked)
    }

    /// Try-lock each branch; contended ones are returned separately.
    pub fn try_acquire_many(
        &self,
        repository_id: &RepositoryId,
        branches: &BTreeSet<BranchName>,
        purpose: LockPurpose,
    ) -> (LockedBranches, BTreeSet<BranchName>) {
        let mut locked = LockedBranches::new(repository_id.clone());
        let mut contended = BTreeSet::new();
        for branch in branches {
            match self.try_acquire(&BranchKey::new(repository_id, branch), purpose) {
                Some(guard) => {
                    locked.guards.insert(branch.clone(), guard);
                }
                None => {
                    contended.insert(branch.clone());
                }
            }
        }
        (locked, contended)
    }

    pub fn holder(&self, key: &BranchKey) -> Option<LockHolder> {
        let slots = self.slots.lock().ok()?;
        slots.get(key).and_then(|slot| slot.holder())
    }

    pub fn is_held(&self, key: &BranchKey) -> bool {
        self.holder(key).is_some()
    }

    /// Drop idle slots of a detached repository.
    pub fn forget_repository(&self, repository_id: &RepositoryId) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.retain(|key, slot| {
                &key.repository_id != repository_id || Arc::strong_count(slot) > 1
            });
        }
    }
}

/// Held lock on one branch. Released on drop, on every exit path.
pub struct BranchGuard {
    key: BranchKey,
    token: Uuid,
    slot: Arc<LockSlot>,
    _guard: OwnedMutexGuard<()>,
}

impl BranchGuard {
    fn install(
        key: BranchKey,
        slot: Arc<LockSlot>,
        guard: OwnedMutexGuard<()>,
        purpose: LockPurpose,
        wait_started: Instant,
    ) -> Self {
        let token = Uuid::new_v4();
        {
            let mut holder = match slot.holder.lock() {
                Ok(holder) => holder,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(previous) = holder.as_ref() {
                panic!(
                    "branch lock {key} acquired by {} while still recorded as held by {} ({})",
                    purpose.as_str(),
                    previous.purpose.as_str(),
                    previous.token
                );
            }
            *holder = Some(LockHolder { token, purpose, acquired_at: Utc::now() });
        }
        debug!(
            key = %key,
            purpose = purpose.as_str(),
            waited_ms = wait_started.elapsed().as_millis() as u64,
            "branch lock acquired"
        );
        Self { key, token, slot, _guard: guard }
    }

    pub fn key(&self) -> &BranchKey {
        &self.key
    }

    pub fn token(&self) -> Uuid {
        self.token
    }
}

impl Drop for BranchGuard {
    fn drop(&mut self) {
        let mut holder = match self.slot.holder.lock() {
            Ok(holder) => holder,
            Err(poisoned) => poisoned.into_inner(),
        };
        if holder.as_ref().map(|h| h.token) == Some(self.token) {
            *holder = None;
        }
        debug!(key = %self.key, "branch lock released");
    }
}

impl std::fmt::Debug for BranchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchGuard").field("key", &self.key).field("token", &self.token).finish()
    }
}

/// Locks held on a set of branches of one repository.
///
/// Also serves as proof, for `*_locked` entry points, that the caller holds
/// the locks of the branches it passes.
#[derive(Debug)]
pub struct LockedBranches {
    repository_id: RepositoryId,
    guards: BTreeMap<BranchName, BranchGuard>,
}

impl LockedBranches {
    pub fn new(repository_id: RepositoryId) -> Self {
        Self { repository_id, guards: BTreeMap::new() }
    }

    pub fn single(guard: BranchGuard) -> Self {
        let key = guard.key().clone();
        let mut guards = BTreeMap::new();
        guards.insert(key.branch, guard);
        Self { repository_id: key.repository_id, guards }
    }

    pub fn repository_id(&self) -> &RepositoryId {
        &self.repository_id
    }

    pub fn contains(&self, branch: &BranchName) -> bool {
        self.guards.contains_key(branch)
    }

    pub fn branches(&self) -> impl Iterator<Item = &BranchName> {
        self.guards.keys()
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Release one branch early.
    pub fn release(&mut self, branch: &BranchName) {
        self.guards.remove(branch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(branch: &str) -> BranchKey {
        BranchKey::new(&RepositoryId::new("acme").unwrap(), &BranchName::new(branch).unwrap())
    }

    #[tokio::test]
    async fn holder_is_recorded_and_cleared() {
        let table = BranchLockTable::new();
        let guard = table.acquire(&key("main"), LockPurpose::Push, Duration::from_secs(1)).await.unwrap();

        let holder = table.holder(&key("main")).expect("lock should be held");
        assert_eq!(holder.purpose, LockPurpose::Push);
        assert_eq!(holder.token, guard.token());

        drop(guard);
        assert!(!table.is_held(&key("main")));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_times_out_with_holder_info() {
        let table = BranchLockTable::new();
        let _held = table.acquire(&key("main"), LockPurpose::Push, Duration::from_secs(1)).await.unwrap();

        let error = table
            .acquire(&key("main"), LockPurpose::Sync, Duration::from_secs(30))
            .await
            .expect_err("second acquire should time out");
        assert_eq!(error.waited, Duration::from_secs(30));
        assert_eq!(error.holder.map(|h| h.purpose), Some(LockPurpose::Push));
    }

    #[tokio::test]
    async fn different_branches_do_not_contend() {
        let table = BranchLockTable::new();
        let _main = table.acquire(&key("main"), LockPurpose::Push, Duration::from_secs(1)).await.unwrap();
        let docs = table.try_acquire(&key("docs"), LockPurpose::BackgroundSync);
        assert!(docs.is_some());
    }

    #[tokio::test]
    async fn try_acquire_skips_held_branch() {
        let table = BranchLockTable::new();
        let _main = table.acquire(&key("main"), LockPurpose::Push, Duration::from_secs(1)).await.unwrap();
        assert!(table.try_acquire(&key("main"), LockPurpose::BackgroundSync).is_none());
    }

    #[tokio::test]
    async fn background_try_acquire_does_not_jump_queued_waiters() {
        let table = BranchLockTable::new();
        let first = table.acquire(&key("main"), LockPurpose::Push, Duration::from_secs(5)).await.unwrap();

        let waiter_table = table.clone();
        let waiter = tokio::spawn(async move {
            waiter_table.acquire(&key("main"), LockPurpose::Push, Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        drop(first);
        // The queued push owns the next turn.
        assert!(table.try_acquire(&key("main"), LockPurpose::BackgroundSync).is_none());

        let second = waiter.await.unwrap().expect("queued push should get the lock");
        assert_eq!(table.holder(&key("main")).map(|h| h.token), Some(second.token()));
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let table = BranchLockTable::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let first = table.acquire(&key("main"), LockPurpose::Push, Duration::from_secs(5)).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..4 {
            let table = table.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _guard =
                    table.acquire(&key("main"), LockPurpose::Push, Duration::from_secs(5)).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // let each waiter enqueue before the next one
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn acquire_many_locks_in_sorted_order_and_releases_on_drop() {
        let table = BranchLockTable::new();
        let repo = RepositoryId::new("acme").unwrap();
        let branches: BTreeSet<BranchName> =
            ["zeta", "alpha", "mid"].iter().map(|b| BranchName::new(*b).unwrap()).collect();

        let mut locked = table
            .acquire_many(&repo, &branches, LockPurpose::Push, Duration::from_secs(1))
            .await
            .unwrap();
        let order: Vec<&str> = locked.branches().map(BranchName::as_str).collect();
        assert_eq!(order, vec!["alpha", "mid", "zeta"]);
        assert!(table.is_held(&key("mid")));

        locked.release(&BranchName::new("mid").unwrap());
        assert!(!table.is_held(&key("mid")));
        assert!(table.is_held(&key("alpha")));

        drop(locked);
        assert!(!table.is_held(&key("alpha")));
        assert!(!table.is_held(&key("zeta")));
    }

    #[tokio::test]
    async fn overlapping_lock_sets_do_not_deadlock() {
        let table = BranchLockTable::new();
        let repo = RepositoryId::new("acme").unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for set in [["a", "b"], ["b", "a"], ["a", "c"], ["c", "b"]] {
            let table = table.clone();
            let repo = repo.clone();
            let done = Arc::clone(&done);
            tasks.push(tokio::spawn(async move {
                let branches: BTreeSet<BranchName> =
                    set.iter().map(|b| BranchName::new(*b).unwrap()).collect();
                for _ in 0..20 {
                    let _locked = table
                        .acquire_many(&repo, &branches, LockPurpose::Push, Duration::from_secs(10))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn guard_released_when_task_panics() {
        let table = BranchLockTable::new();
        let panicking = table.clone();
        let result = tokio::spawn(async move {
            let _guard = panicking
                .acquire(&key("main"), LockPurpose::Push, Duration::from_secs(1))
                .await
                .unwrap();
            panic!("receive step exploded");
        })
        .await;
        assert!(result.is_err());
        assert!(!table.is_held(&key("main")));
        assert!(table.try_acquire(&key("main"), LockPurpose::Sync).is_some());
    }
}
