// Git process plumbing: command execution plus the git-backed ref store,
// upstream client and receive-pack adapters built on it.

pub mod command;
pub mod receive;
pub mod repository;
pub mod upstream;

pub use command::{CommandExecutor, GitCommandError, GitInvocation, GitRunner, ProcessCommandExecutor};
pub use receive::GitReceivePack;
pub use repository::GitRepository;
pub use upstream::{GitUpstreamClient, UpstreamCredentials};
