// gitmirror-engine: branch locks, sync, push forwarding and bootstrap for
// mirrors of upstream git repositories.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod git;
pub mod lock;
pub mod memory;
pub mod mirror;
pub mod notify;
pub mod push;
pub mod quarantine;
pub mod receive;
pub mod refs;
pub mod retry;
pub mod sync;
pub mod upstream;

pub use bootstrap::{BootstrapOutcome, BranchBootstrap};
pub use config::{EngineConfig, EngineSettings, ForwardPolicy, MirrorConfig, RepositorySpec};
pub use error::MirrorError;
pub use lock::{BranchKey, BranchLockTable, LockPurpose};
pub use mirror::{GitBackend, MirrorBackend, MirrorService, RepositoryMirror};
pub use notify::{BranchPushed, ForwardAbandoned, PostPushNotifier, TracingNotifier};
pub use push::{PushCoordinator, PushFailure, PushOutcome};
pub use sync::{SyncEngine, SyncMode, SyncReport, SyncScope};
