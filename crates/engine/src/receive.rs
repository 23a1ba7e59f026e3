// The local receive step: hands an agent's push to git and returns git's
// protocol response untouched. Which refs actually moved is learned by the
// coordinator from the ref table, never from this response.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::git::GitCommandError;

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Git(#[from] GitCommandError),

    #[error("receive step did not finish within {0:?}")]
    Timeout(Duration),

    #[error("receive step failed: {0}")]
    Failed(String),
}

/// Smart-HTTP services a mirror serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    /// Subcommand name for `git <cmd>`.
    pub(crate) const fn subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }
}

pub trait LocalReceiver: Send + Sync + 'static {
    /// `info/refs` advertisement body, service announcement included.
    fn advertise_refs(
        &self,
        service: GitService,
    ) -> impl Future<Output = Result<Vec<u8>, ReceiveError>> + Send;

    /// Apply a receive-pack request to the local repository. Work still
    /// running after `limit` is stopped before this returns
    /// `ReceiveError::Timeout`.
    fn receive_pack(
        &self,
        body: &[u8],
        limit: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, ReceiveError>> + Send;

    /// Serve a clone or fetch.
    fn upload_pack(&self, body: &[u8]) -> impl Future<Output = Result<Vec<u8>, ReceiveError>> + Send;
}
