// Get-or-create for branches several agents may initialize at once.
//
// Decisions are made under the branch lock against a fetch taken right
// before deciding. Creation never force-pushes: losing the race to another
// initializer means adopting its root commit.

use std::collections::BTreeSet;

use gitmirror_common::protocol::api::{BootstrapStatus, EnsureBranchResponse};
use gitmirror_common::types::{BranchName, CommitHash, RepositoryId};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::MirrorError;
use crate::lock::{BranchKey, LockPurpose};
use crate::mirror::{MirrorBackend, MirrorService, RepositoryMirror};
use crate::push::{bounded, PushCoordinator};
use crate::refs::{ancestry, Ancestry, CommitGraph, RefStore};
use crate::upstream::{UpstreamClient, UpstreamError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOutcome {
    pub branch: BranchName,
    pub commit: CommitHash,
    pub status: BootstrapStatus,
    /// Set when this call forwarded the commit upstream.
    pub operation_id: Option<Uuid>,
}

impl BootstrapOutcome {
    fn new(branch: &BranchName, commit: CommitHash, status: BootstrapStatus) -> Self {
        Self { branch: branch.clone(), commit, status, operation_id: None }
    }

    fn forwarded(branch: &BranchName, commit: CommitHash, status: BootstrapStatus, operation_id: Uuid) -> Self {
        Self { branch: branch.clone(), commit, status, operation_id: Some(operation_id) }
    }

    pub fn to_response(&self) -> EnsureBranchResponse {
        EnsureBranchResponse { branch: self.branch.clone(), commit: self.commit.clone(), status: self.status }
    }
}

pub struct BranchBootstrap<B: MirrorBackend> {
    service: MirrorService<B>,
}

impl<B: MirrorBackend> BranchBootstrap<B> {
    pub fn new(service: MirrorService<B>) -> Self {
        Self { service }
    }

    /// Make sure `branch` exists on both sides and report which side it
    /// came from. `message` is used only when a root commit is created.
    pub async fn ensure_branch(
        &self,
        repository_id: &RepositoryId,
        branch: &BranchName,
        message: Option<&str>,
    ) -> Result<BootstrapOutcome, MirrorError> {
        let mirror = self.service.mirror(repository_id)?;
        let key = BranchKey::new(repository_id, branch);
        self.ensure_not_quarantined(&key)?;

        let coordinator = self.service.coordinator();
        let branches: BTreeSet<BranchName> = [branch.clone()].into();
        let _locked = coordinator.acquire_with_retry(repository_id, &branches, LockPurpose::Bootstrap).await?;
        self.ensure_not_quarantined(&key)?;

        let deadline = Instant::now() + self.service.settings().push_deadline;
        let upstream = self.upstream_tip(&mirror, branch, deadline).await?;
        let local = mirror.repo().get(branch).await?;

        let outcome = match (local, upstream) {
            (Some(local), Some(upstream)) => self.reconcile(&coordinator, &mirror, branch, local, upstream, deadline).await?,
            (None, Some(upstream)) => {
                self.set_local(&mirror, branch, None, &upstream).await?;
                BootstrapOutcome::new(branch, upstream, BootstrapStatus::Adopted)
            }
            (Some(local), None) => self.publish(&coordinator, &mirror, branch, local, deadline).await?,
            (None, None) => {
                let message = message.map_or_else(|| format!("Initialize {branch} branch"), str::to_string);
                self.create(&coordinator, &mirror, branch, &message, deadline).await?
            }
        };
        info!(
            repository_id = %repository_id,
            branch = %branch,
            commit = %outcome.commit,
            status = ?outcome.status,
            "branch ensured"
        );
        Ok(outcome)
    }

    async fn reconcile(
        &self,
        coordinator: &PushCoordinator<B>,
        mirror: &RepositoryMirror<B>,
        branch: &BranchName,
        local: CommitHash,
        upstream: CommitHash,
        deadline: Instant,
    ) -> Result<BootstrapOutcome, MirrorError> {
        match ancestry(mirror.repo(), &local, &upstream).await? {
            Ancestry::Equal => Ok(BootstrapOutcome::new(branch, local, BootstrapStatus::Existing)),
            Ancestry::LocalBehind => {
                self.set_local(mirror, branch, Some(&local), &upstream).await?;
                Ok(BootstrapOutcome::new(branch, upstream, BootstrapStatus::Existing))
            }
            Ancestry::LocalAhead => {
                let key = BranchKey::new(mirror.id(), branch);
                if self.service.forward_queue().has_pending(&key) {
                    return Ok(BootstrapOutcome::new(branch, local, BootstrapStatus::Existing));
                }
                let operation_id = Uuid::new_v4();
                bounded(self.service.settings(), deadline, mirror.upstream().push_branch(branch, Some(&upstream), &local))
                    .await
                    .map_err(|error| publish_error(mirror.id(), branch, Some(&local), Some(&upstream), error))?;
                coordinator.notify_pushed(mirror.id(), branch, &local, operation_id);
                Ok(BootstrapOutcome::forwarded(branch, local, BootstrapStatus::Published, operation_id))
            }
            Ancestry::Diverged => Err(orphan_race(mirror.id(), branch, local, upstream)),
        }
    }

    /// Local-only branch: forward it with "must not exist" as the lease.
    async fn publish(
        &self,
        coordinator: &PushCoordinator<B>,
        mirror: &RepositoryMirror<B>,
        branch: &BranchName,
        local: CommitHash,
        deadline: Instant,
    ) -> Result<BootstrapOutcome, MirrorError> {
        let operation_id = Uuid::new_v4();
        let pushed = bounded(self.service.settings(), deadline, mirror.upstream().push_branch(branch, None, &local)).await;
        match pushed {
            Ok(()) => {
                coordinator.notify_pushed(mirror.id(), branch, &local, operation_id);
                Ok(BootstrapOutcome::forwarded(branch, local, BootstrapStatus::Published, operation_id))
            }
            Err(UpstreamError::Stale { .. }) => {
                let Some(upstream) = self.upstream_tip(mirror, branch, deadline).await? else {
                    return Err(MirrorError::stale(
                        mirror.id(),
                        branch,
                        "upstream refused the branch but does not have it",
                        Some(&local),
                        None,
                    ));
                };
                match ancestry(mirror.repo(), &local, &upstream).await? {
                    Ancestry::Equal => Ok(BootstrapOutcome::new(branch, local, BootstrapStatus::Existing)),
                    Ancestry::LocalBehind => {
                        self.set_local(mirror, branch, Some(&local), &upstream).await?;
                        Ok(BootstrapOutcome::new(branch, upstream, BootstrapStatus::Adopted))
                    }
                    Ancestry::LocalAhead | Ancestry::Diverged => Err(orphan_race(mirror.id(), branch, local, upstream)),
                }
            }
            Err(error) => Err(publish_error(mirror.id(), branch, Some(&local), None, error)),
        }
    }

    /// Neither side has the branch: mint a root commit and race for it.
    async fn create(
        &self,
        coordinator: &PushCoordinator<B>,
        mirror: &RepositoryMirror<B>,
        branch: &BranchName,
        message: &str,
        deadline: Instant,
    ) -> Result<BootstrapOutcome, MirrorError> {
        let operation_id = Uuid::new_v4();
        let root = mirror.repo().create_root_commit(message).await?;
        self.set_local(mirror, branch, None, &root).await?;

        let pushed = bounded(self.service.settings(), deadline, mirror.upstream().push_branch(branch, None, &root)).await;
        match pushed {
            Ok(()) => {
                coordinator.notify_pushed(mirror.id(), branch, &root, operation_id);
                Ok(BootstrapOutcome::forwarded(branch, root, BootstrapStatus::Created, operation_id))
            }
            Err(UpstreamError::Stale { message }) => {
                warn!(
                    repository_id = %mirror.id(),
                    branch = %branch,
                    root = %root.short(),
                    message = %message,
                    "another initializer created the branch first; adopting its root"
                );
                coordinator.rollback(mirror, Some(operation_id), branch, Some(&root), None).await?;
                let Some(winner) = self.upstream_tip(mirror, branch, deadline).await? else {
                    return Err(MirrorError::stale(
                        mirror.id(),
                        branch,
                        "upstream refused the branch but does not have it",
                        None,
                        None,
                    ));
                };
                self.set_local(mirror, branch, None, &winner).await?;
                Ok(BootstrapOutcome::new(branch, winner, BootstrapStatus::Adopted))
            }
            Err(error) => {
                coordinator.rollback(mirror, Some(operation_id), branch, Some(&root), None).await?;
                Err(publish_error(mirror.id(), branch, None, None, error))
            }
        }
    }

    async fn upstream_tip(
        &self,
        mirror: &RepositoryMirror<B>,
        branch: &BranchName,
        deadline: Instant,
    ) -> Result<Option<CommitHash>, MirrorError> {
        let fetched = bounded(self.service.settings(), deadline, mirror.upstream().fetch_branches(false))
            .await
            .map_err(|error| MirrorError::upstream(mirror.id(), error))?;
        Ok(fetched.head(branch).cloned())
    }

    async fn set_local(
        &self,
        mirror: &RepositoryMirror<B>,
        branch: &BranchName,
        expected: Option<&CommitHash>,
        new: &CommitHash,
    ) -> Result<(), MirrorError> {
        if mirror.repo().compare_and_swap(branch, expected, Some(new)).await? {
            return Ok(());
        }
        Err(MirrorError::stale(mirror.id(), branch, "branch moved during bootstrap", expected, Some(new)))
    }

    fn ensure_not_quarantined(&self, key: &BranchKey) -> Result<(), MirrorError> {
        match self.service.quarantine().get(key) {
            Some(record) => Err(MirrorError::BranchQuarantined {
                repository_id: key.repository_id.clone(),
                branch: key.branch.clone(),
                reason: record.reason,
            }),
            None => Ok(()),
        }
    }
}

fn orphan_race(repository_id: &RepositoryId, branch: &BranchName, local: CommitHash, upstream: CommitHash) -> MirrorError {
    MirrorError::OrphanBranchRace { repository_id: repository_id.clone(), branch: branch.clone(), local, upstream }
}

fn publish_error(
    repository_id: &RepositoryId,
    branch: &BranchName,
    local: Option<&CommitHash>,
    upstream: Option<&CommitHash>,
    error: UpstreamError,
) -> MirrorError {
    match error {
        UpstreamError::Stale { message } => MirrorError::stale(repository_id, branch, message, local, upstream),
        UpstreamError::Rejected { message } => MirrorError::ForwardRejected {
            repository_id: repository_id.clone(),
            branch: branch.clone(),
            operation_id: None,
            message,
        },
        transport @ UpstreamError::Transport { .. } => MirrorError::upstream(repository_id, transport),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::memory::{MemoryBackend, MemoryRemote};
    use crate::notify::{ChannelNotifier, MirrorEvent};
    use tokio::sync::mpsc;

    struct Fixture {
        service: MirrorService<MemoryBackend>,
        remote: MemoryRemote,
        events: mpsc::Receiver<MirrorEvent>,
        id: RepositoryId,
    }

    fn fixture() -> Fixture {
        let (notifier, events) = ChannelNotifier::new(16);
        let service = MirrorService::<MemoryBackend>::with_notifier(EngineSettings::default(), notifier);
        let remote = MemoryRemote::new();
        let id = RepositoryId::new("acme").unwrap();
        service.attach(remote.mirror(&id, Some(service.locks()))).unwrap();
        Fixture { service, remote, events, id }
    }

    fn specs() -> BranchName {
        BranchName::new("helix-specs").unwrap()
    }

    impl Fixture {
        fn local(&self) -> Option<CommitHash> {
            self.service.mirror(&self.id).unwrap().repo().snapshot().get(&specs()).cloned()
        }

        fn seed_local(&self, commit: &CommitHash) {
            self.service.mirror(&self.id).unwrap().repo().seed(&specs(), commit);
        }

        fn notified(&mut self) -> usize {
            std::iter::from_fn(|| self.events.try_recv().ok()).count()
        }
    }

    #[tokio::test]
    async fn creates_root_commit_when_neither_side_has_the_branch() {
        let mut f = fixture();
        let outcome = f.service.bootstrap().ensure_branch(&f.id, &specs(), None).await.unwrap();

        assert_eq!(outcome.status, BootstrapStatus::Created);
        assert!(outcome.operation_id.is_some());
        assert_eq!(f.local(), Some(outcome.commit.clone()));
        assert_eq!(f.remote.head(&specs()), Some(outcome.commit));
        assert_eq!(f.notified(), 1);
    }

    #[tokio::test]
    async fn adopts_an_upstream_only_branch_without_pushing() {
        let mut f = fixture();
        let theirs = f.remote.objects().commit(&[]);
        f.remote.set_head(&specs(), &theirs);

        let outcome = f.service.bootstrap().ensure_branch(&f.id, &specs(), None).await.unwrap();
        assert_eq!(outcome.status, BootstrapStatus::Adopted);
        assert_eq!(f.local(), Some(theirs));
        assert_eq!(f.remote.push_count(), 0);
        assert_eq!(f.notified(), 0);
    }

    #[tokio::test]
    async fn publishes_a_local_only_branch() {
        let mut f = fixture();
        let ours = f.remote.objects().commit(&[]);
        f.seed_local(&ours);

        let outcome = f.service.bootstrap().ensure_branch(&f.id, &specs(), None).await.unwrap();
        assert_eq!(outcome.status, BootstrapStatus::Published);
        assert_eq!(f.remote.head(&specs()), Some(ours));
        assert_eq!(f.notified(), 1);
    }

    #[tokio::test]
    async fn existing_branch_is_brought_up_to_date() {
        let f = fixture();
        let c1 = f.remote.objects().commit(&[]);
        let c2 = f.remote.objects().commit(&[&c1]);
        f.seed_local(&c1);
        f.remote.set_head(&specs(), &c2);

        let outcome = f.service.bootstrap().ensure_branch(&f.id, &specs(), None).await.unwrap();
        assert_eq!(outcome.status, BootstrapStatus::Existing);
        assert_eq!(f.local(), Some(c2));
    }

    #[tokio::test]
    async fn losing_the_creation_race_adopts_the_winner() {
        let mut f = fixture();
        let winner = f.remote.objects().commit(&[]);
        let planted = winner.clone();
        f.remote.before_next_push(move |remote| remote.set_head(&BranchName::new("helix-specs").unwrap(), &planted));

        let outcome = f.service.bootstrap().ensure_branch(&f.id, &specs(), Some("init")).await.unwrap();
        assert_eq!(outcome.status, BootstrapStatus::Adopted);
        assert_eq!(outcome.commit, winner);
        assert_eq!(f.local(), Some(winner.clone()));
        assert_eq!(f.remote.head(&specs()), Some(winner));
        assert!(f.remote.push_log().is_empty());
        assert_eq!(f.notified(), 0);
    }

    #[tokio::test]
    async fn unrelated_histories_are_an_orphan_race() {
        let f = fixture();
        let ours = f.remote.objects().commit(&[]);
        let theirs = f.remote.objects().commit(&[]);
        f.seed_local(&ours);
        f.remote.set_head(&specs(), &theirs);

        let error = f.service.bootstrap().ensure_branch(&f.id, &specs(), None).await.unwrap_err();
        assert!(matches!(error, MirrorError::OrphanBranchRace { .. }));
        assert_eq!(f.local(), Some(ours));
    }

    #[tokio::test]
    async fn upstream_outage_during_creation_leaves_no_local_root() {
        let f = fixture();
        f.remote.fail_next_push(UpstreamError::transport("connection refused"));

        let error = f.service.bootstrap().ensure_branch(&f.id, &specs(), None).await.unwrap_err();
        assert!(matches!(error, MirrorError::Upstream { .. }));
        assert_eq!(f.local(), None);
    }
}
