// Upstream client: the external system-of-record repository.
//
// Failures are classified at this seam so callers never parse git output:
//   stale     → upstream moved since we looked; resync and retry
//   rejected  → policy, permission or hook refusal; needs a human
//   transport → network, timeout, anything unclassified; retry as-is

use std::collections::BTreeSet;
use std::future::Future;

use gitmirror_common::types::{BranchName, CommitHash, RefSnapshot};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream ref is stale: {message}")]
    Stale { message: String },

    #[error("upstream rejected the update: {message}")]
    Rejected { message: String },

    #[error("upstream transport failure: {message}")]
    Transport { message: String },
}

impl UpstreamError {
    pub fn stale(message: impl Into<String>) -> Self {
        Self::Stale { message: message.into() }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected { message: message.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Stale { message } | Self::Rejected { message } | Self::Transport { message } => {
                message
            }
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Result of one fetch from upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamFetch {
    /// Upstream branch tips. Their objects are present locally.
    pub heads: RefSnapshot,
    /// Branches whose upstream tip neither contains nor is contained in the
    /// local branch. Only reported when the fetch was not forced.
    pub diverged: BTreeSet<BranchName>,
}

impl UpstreamFetch {
    pub fn head(&self, branch: &BranchName) -> Option<&CommitHash> {
        self.heads.get(branch)
    }
}

pub trait UpstreamClient: Send + Sync + 'static {
    /// Branch tips only, without transferring objects.
    fn list_branches(&self) -> impl Future<Output = Result<RefSnapshot, UpstreamError>> + Send;

    /// Transfer upstream objects and report branch tips. Never writes the
    /// local branch table; applying the result is the sync engine's job.
    fn fetch_branches(
        &self,
        force: bool,
    ) -> impl Future<Output = Result<UpstreamFetch, UpstreamError>> + Send;

    /// Move upstream `branch` to `new` iff it is currently `expected`
    /// (`None` = must not exist).
    fn push_branch(
        &self,
        branch: &BranchName,
        expected: Option<&CommitHash>,
        new: &CommitHash,
    ) -> impl Future<Output = Result<(), UpstreamError>> + Send;
}

/// Map git's push/fetch diagnostics onto the failure classes.
pub fn classify_git_failure(output: &str) -> UpstreamError {
    let lower = output.to_ascii_lowercase();
    let message = summarize(output);

    const STALE: &[&str] =
        &["stale info", "fetch first", "non-fast-forward", "but expected", "already exists"];
    const REJECTED: &[&str] = &[
        "remote rejected",
        "protected branch",
        "hook declined",
        "permission",
        "authentication failed",
        "access denied",
        "denied to",
        "forbidden",
        "the requested url returned error: 401",
        "the requested url returned error: 403",
        "[rejected]",
    ];

    if STALE.iter().any(|needle| lower.contains(needle)) {
        UpstreamError::Stale { message }
    } else if REJECTED.iter().any(|needle| lower.contains(needle)) {
        UpstreamError::Rejected { message }
    } else {
        UpstreamError::Transport { message }
    }
}

fn summarize(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "Done")
        .filter(|line| !line.starts_with("To "))
        .collect();
    if lines.is_empty() {
        return "no diagnostic output".to_string();
    }
    lines.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_mismatch_is_stale() {
        let output = "To https://git.example.com/acme/app.git\n\
                      !\trefs/heads/main:refs/heads/main\t[rejected] (stale info)\n\
                      Done\n";
        let error = classify_git_failure(output);
        assert_eq!(
            error,
            UpstreamError::stale("!\trefs/heads/main:refs/heads/main\t[rejected] (stale info)")
        );
    }

    #[test]
    fn fetch_first_is_stale() {
        let error = classify_git_failure(" ! [rejected]        main -> main (fetch first)\n");
        assert!(matches!(error, UpstreamError::Stale { .. }));
    }

    #[test]
    fn protected_branch_and_hooks_are_rejected() {
        for output in [
            " ! [remote rejected] main -> main (protected branch hook declined)",
            "remote: Permission to acme/app.git denied to agent.",
            "fatal: Authentication failed for 'https://git.example.com/acme/app.git/'",
            "error: The requested URL returned error: 403",
        ] {
            assert!(
                matches!(classify_git_failure(output), UpstreamError::Rejected { .. }),
                "{output} should be rejected"
            );
        }
    }

    #[test]
    fn network_errors_are_transport() {
        for output in [
            "fatal: unable to access 'https://git.example.com/': Could not resolve host",
            "error: RPC failed; curl 56 Recv failure: Connection reset by peer",
            "",
        ] {
            assert!(matches!(classify_git_failure(output), UpstreamError::Transport { .. }));
        }
    }

    #[test]
    fn empty_output_gets_a_placeholder_message() {
        assert_eq!(classify_git_failure("").message(), "no diagnostic output");
    }
}
