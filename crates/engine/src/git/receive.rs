// `git receive-pack` / `git upload-pack` in stateless-RPC mode.

use gitmirror_common::protocol::pktline::service_announcement;

use std::time::Duration;

use super::command::{CommandExecutor, GitCommandError, GitInvocation, GitRunner, ProcessCommandExecutor};
use crate::receive::{GitService, LocalReceiver, ReceiveError};

#[derive(Debug, Clone)]
pub struct GitReceivePack<E = ProcessCommandExecutor> {
    runner: GitRunner<E>,
}

impl<E: CommandExecutor> GitReceivePack<E> {
    pub fn new(runner: GitRunner<E>) -> Self {
        Self { runner }
    }

    async fn stateless(&self, invocation: GitInvocation) -> Result<Vec<u8>, ReceiveError> {
        match self.runner.run_with(invocation).await {
            Ok(output) => Ok(output.stdout),
            Err(GitCommandError::TimedOut { after, .. }) => Err(ReceiveError::Timeout(after)),
            Err(error) => Err(error.into()),
        }
    }

    fn invocation(service: GitService, body: &[u8]) -> GitInvocation {
        GitInvocation::new([service.subcommand(), "--stateless-rpc", "."]).stdin(body.to_vec())
    }
}

impl<E: CommandExecutor> LocalReceiver for GitReceivePack<E> {
    async fn advertise_refs(&self, service: GitService) -> Result<Vec<u8>, ReceiveError> {
        let output = self
            .runner
            .run([service.subcommand(), "--stateless-rpc", "--advertise-refs", "."])
            .await?;
        let mut body = service_announcement(service.as_str());
        body.extend(output.stdout);
        Ok(body)
    }

    async fn receive_pack(&self, body: &[u8], limit: Duration) -> Result<Vec<u8>, ReceiveError> {
        self.stateless(Self::invocation(GitService::ReceivePack, body).timeout(limit)).await
    }

    async fn upload_pack(&self, body: &[u8]) -> Result<Vec<u8>, ReceiveError> {
        self.stateless(Self::invocation(GitService::UploadPack, body)).await
    }
}
