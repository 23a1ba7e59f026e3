use std::time::Duration;

use gitmirror_common::protocol::api::{BootstrapStatus, ForwardJobState, ForwardStatus};
use gitmirror_common::protocol::pktline::{encode_commands, RefUpdateCommand};
use gitmirror_common::types::{BranchName, CommitHash, RepositoryId};
use gitmirror_engine::config::RetrySettings;
use gitmirror_engine::memory::{MemoryBackend, MemoryRemote};
use gitmirror_engine::notify::{ChannelNotifier, MirrorEvent};
use gitmirror_engine::sync::{BranchSyncOutcome, SkipReason};
use gitmirror_engine::upstream::UpstreamError;
use gitmirror_engine::{
    BranchKey, EngineSettings, ForwardPolicy, LockPurpose, MirrorError, MirrorService, SyncMode, SyncScope,
};
use tokio::sync::mpsc;

struct Host {
    service: MirrorService<MemoryBackend>,
    events: mpsc::Receiver<MirrorEvent>,
}

fn host(remote: &MemoryRemote, id: &RepositoryId, settings: EngineSettings) -> Host {
    let (notifier, events) = ChannelNotifier::new(64);
    let service = MirrorService::with_notifier(settings, notifier);
    service
        .attach(remote.mirror(id, Some(service.locks())).with_multi_writer_branches([specs()]))
        .expect("attach");
    Host { service, events }
}

fn repo_id() -> RepositoryId {
    RepositoryId::new("acme").expect("valid id")
}

fn branch(name: &str) -> BranchName {
    BranchName::new(name).expect("valid branch")
}

fn specs() -> BranchName {
    branch("helix-specs")
}

fn push_body(name: &str, old: Option<&CommitHash>, new: &CommitHash) -> Vec<u8> {
    encode_commands(
        &[RefUpdateCommand { old: old.cloned(), new: Some(new.clone()), refname: format!("refs/heads/{name}") }],
        &["report-status"],
    )
}

fn drain(events: &mut mpsc::Receiver<MirrorEvent>) -> Vec<MirrorEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

fn retry_settings() -> EngineSettings {
    EngineSettings {
        forward_policy: ForwardPolicy::RetryQueue,
        retry: RetrySettings {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            capacity: 16,
        },
        ..EngineSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn second_writer_blocks_then_sees_the_first_commit_and_is_refused() {
    let remote = MemoryRemote::new();
    let id = repo_id();
    let mut a = host(&remote, &id, EngineSettings::default());
    let c0 = remote.objects().commit(&[]);
    remote.set_head(&specs(), &c0);
    a.service.mirror(&id).expect("attached").repo().seed(&specs(), &c0);
    remote.set_push_delay(Duration::from_millis(500));

    let c1 = remote.objects().commit(&[&c0]);
    let c2 = remote.objects().commit(&[&c0]);

    let first = {
        let coordinator = a.service.coordinator();
        let (id, body) = (id.clone(), push_body("helix-specs", Some(&c0), &c1));
        tokio::spawn(async move { coordinator.push(&id, &body).await })
    };
    let key = BranchKey::new(&id, &specs());
    while !a.service.locks().is_held(&key) {
        tokio::task::yield_now().await;
    }
    assert_eq!(a.service.locks().holder(&key).map(|h| h.purpose), Some(LockPurpose::Push));

    let second = a.service.coordinator().push(&id, &push_body("helix-specs", Some(&c0), &c2)).await;
    let first = first.await.expect("first push task").expect("first push succeeds");

    let failure = second.expect_err("second push is stale");
    match &failure.error {
        MirrorError::StaleRefConflict { local, .. } => assert_eq!(local.as_ref(), Some(&c1)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(remote.head(&specs()), Some(c1.clone()));
    assert_eq!(a.service.mirror(&id).expect("attached").repo().snapshot().get(&specs()), Some(&c1));

    let events = drain(&mut a.events);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], MirrorEvent::BranchPushed(e) if e.commit == c1 && e.operation_id == first.operation_id));
}

#[tokio::test]
async fn sync_is_idempotent_and_never_forces_multi_writer_branches() {
    let remote = MemoryRemote::new();
    let id = repo_id();
    let a = host(&remote, &id, EngineSettings::default());
    let mirror = a.service.mirror(&id).expect("attached");

    let base = remote.objects().commit(&[]);
    let ours = remote.objects().commit(&[&base]);
    let theirs = remote.objects().commit(&[&base]);
    mirror.repo().seed(&specs(), &ours);
    remote.set_head(&specs(), &theirs);
    remote.set_head(&branch("main"), &base);

    let engine = a.service.sync_engine();
    let forced = engine
        .sync(&id, SyncScope::All, true, SyncMode::Foreground)
        .await
        .expect("force sync of everything");
    assert_eq!(forced.outcome(&branch("main")), Some(BranchSyncOutcome::Created));
    assert_eq!(
        forced.outcome(&specs()),
        Some(BranchSyncOutcome::Skipped(SkipReason::MultiWriterForceRefused))
    );
    assert_eq!(mirror.repo().snapshot().get(&specs()), Some(&ours));

    let first = engine.sync(&id, SyncScope::All, false, SyncMode::Foreground).await.expect("sync");
    let second = engine.sync(&id, SyncScope::All, false, SyncMode::Foreground).await.expect("sync");
    assert_eq!(second.outcome(&branch("main")), Some(BranchSyncOutcome::Unchanged));
    assert_eq!(first.outcome(&specs()), second.outcome(&specs()));
    assert!(matches!(second.outcome(&specs()), Some(BranchSyncOutcome::Diverged { ahead: 1, behind: 1 })));
    assert_eq!(mirror.repo().snapshot(), {
        let mut expected = gitmirror_common::types::RefSnapshot::new();
        expected.insert(branch("main"), base);
        expected.insert(specs(), ours);
        expected
    });
}

#[tokio::test(start_paused = true)]
async fn queued_forward_is_delivered_by_the_worker() {
    let remote = MemoryRemote::new();
    let id = repo_id();
    let mut a = host(&remote, &id, retry_settings());
    let c0 = remote.objects().commit(&[]);
    remote.set_head(&specs(), &c0);
    let c1 = remote.objects().commit(&[&c0]);
    remote.fail_next_push(UpstreamError::transport("connection reset by peer"));

    let worker = a.service.start_forward_worker();
    let outcome = a
        .service
        .coordinator()
        .push(&id, &push_body("helix-specs", Some(&c0), &c1))
        .await
        .expect("push accepted");
    assert_eq!(outcome.branches[0].status, ForwardStatus::Queued);
    assert_eq!(remote.head(&specs()), Some(c0));

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(remote.head(&specs()), Some(c1.clone()));
    let events = drain(&mut a.events);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], MirrorEvent::BranchPushed(e) if e.commit == c1 && e.operation_id == outcome.operation_id));
    let jobs = a.service.forward_jobs(&id).expect("attached");
    assert!(jobs.iter().all(|job| job.state == ForwardJobState::Forwarded));
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_forward_quarantines_and_reports_abandonment() {
    let remote = MemoryRemote::new();
    let id = repo_id();
    let mut a = host(&remote, &id, retry_settings());
    let c0 = remote.objects().commit(&[]);
    remote.set_head(&specs(), &c0);
    let c1 = remote.objects().commit(&[&c0]);
    for _ in 0..3 {
        remote.fail_next_push(UpstreamError::transport("connection refused"));
    }

    let worker = a.service.start_forward_worker();
    a.service
        .coordinator()
        .push(&id, &push_body("helix-specs", Some(&c0), &c1))
        .await
        .expect("push accepted");
    tokio::time::sleep(Duration::from_secs(10)).await;

    let key = BranchKey::new(&id, &specs());
    assert!(a.service.quarantine().is_quarantined(&key));
    let jobs = a.service.forward_jobs(&id).expect("attached");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, ForwardJobState::Dead);
    assert_eq!(jobs[0].attempts, 3);

    let events = drain(&mut a.events);
    assert!(matches!(events.as_slice(), [MirrorEvent::ForwardAbandoned(e)] if e.commit == c1));

    // The operator reconciles and releases; the next push goes through.
    a.service.release_quarantine(&id, &specs()).expect("attached");
    let c2 = remote.objects().commit(&[&c0]);
    let outcome = a
        .service
        .coordinator()
        .push(&id, &push_body("helix-specs", Some(&c1), &c2))
        .await;
    // Local still holds the abandoned c1, which upstream never got.
    assert!(matches!(outcome, Err(ref failure) if matches!(failure.error, MirrorError::StaleRefConflict { .. })));
    worker.shutdown().await;
}

#[tokio::test]
async fn concurrent_initializers_on_two_hosts_agree_on_one_root() {
    let remote = MemoryRemote::new();
    let id = repo_id();
    let mut a = host(&remote, &id, EngineSettings::default());
    let mut b = host(&remote, &id, EngineSettings::default());

    let branch = specs();
    let bootstrap_a = a.service.bootstrap();
    let bootstrap_b = b.service.bootstrap();
    let (left, right) = tokio::join!(
        bootstrap_a.ensure_branch(&id, &branch, None),
        bootstrap_b.ensure_branch(&id, &branch, None),
    );
    let (left, right) = (left.expect("host a"), right.expect("host b"));

    let mut statuses = [left.status, right.status];
    statuses.sort_by_key(|status| matches!(status, BootstrapStatus::Created));
    assert_eq!(statuses, [BootstrapStatus::Adopted, BootstrapStatus::Created]);
    assert_eq!(left.commit, right.commit);

    let upstream = remote.head(&branch);
    assert_eq!(upstream.as_ref(), Some(&left.commit));
    for side in [&a, &b] {
        assert_eq!(side.service.mirror(&id).expect("attached").repo().snapshot().get(&branch), upstream.as_ref());
    }
    assert_eq!(drain(&mut a.events).len() + drain(&mut b.events).len(), 1);
}
