// Post-push notification.
//
// Events carry the commit captured when the push was diffed (or the commit
// a queued forward delivered). Nothing here re-reads a branch tip.
// Delivery is at-least-once; consumers key on `commit`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gitmirror_common::types::{BranchName, CommitHash, RepositoryId};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// A branch update that reached the upstream host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPushed {
    pub repository_id: RepositoryId,
    pub branch: BranchName,
    pub commit: CommitHash,
    pub operation_id: Uuid,
    pub forwarded_at: DateTime<Utc>,
}

/// A queued forward that will never be delivered. The agent was told its
/// push was queued, so this is the out-of-band failure signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardAbandoned {
    pub repository_id: RepositoryId,
    pub branch: BranchName,
    pub commit: CommitHash,
    pub operation_id: Uuid,
    pub reason: String,
}

/// Callback invoked by the engine. Must not block: it runs while the
/// branch lock is still held.
pub trait PostPushNotifier: Send + Sync + 'static {
    fn on_branch_pushed(&self, event: &BranchPushed);

    fn on_forward_abandoned(&self, _event: &ForwardAbandoned) {}
}

/// Logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl PostPushNotifier for TracingNotifier {
    fn on_branch_pushed(&self, event: &BranchPushed) {
        info!(
            repository_id = %event.repository_id,
            branch = %event.branch,
            commit = %event.commit,
            operation_id = %event.operation_id,
            "branch pushed upstream"
        );
    }

    fn on_forward_abandoned(&self, event: &ForwardAbandoned) {
        warn!(
            repository_id = %event.repository_id,
            branch = %event.branch,
            commit = %event.commit,
            operation_id = %event.operation_id,
            reason = %event.reason,
            "queued forward abandoned"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    BranchPushed(BranchPushed),
    ForwardAbandoned(ForwardAbandoned),
}

/// Hands events to an in-process consumer over a bounded channel. A full
/// channel drops the event with a warning instead of blocking the engine.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<MirrorEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MirrorEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn send(&self, event: MirrorEvent) {
        if let Err(error) = self.tx.try_send(event) {
            warn!(error = %error, "dropping mirror event");
        }
    }
}

impl PostPushNotifier for ChannelNotifier {
    fn on_branch_pushed(&self, event: &BranchPushed) {
        self.send(MirrorEvent::BranchPushed(event.clone()));
    }

    fn on_forward_abandoned(&self, event: &ForwardAbandoned) {
        self.send(MirrorEvent::ForwardAbandoned(event.clone()));
    }
}

/// Fans each event out to several notifiers in order.
#[derive(Clone, Default)]
pub struct Notifiers {
    targets: Vec<Arc<dyn PostPushNotifier>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: impl PostPushNotifier) -> Self {
        self.targets.push(Arc::new(notifier));
        self
    }
}

impl PostPushNotifier for Notifiers {
    fn on_branch_pushed(&self, event: &BranchPushed) {
        for target in &self.targets {
            target.on_branch_pushed(event);
        }
    }

    fn on_forward_abandoned(&self, event: &ForwardAbandoned) {
        for target in &self.targets {
            target.on_forward_abandoned(event);
        }
    }
}
