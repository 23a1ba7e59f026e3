// Git-backed RefStore and CommitGraph over a bare mirror repository.

use std::path::{Path, PathBuf};

use gitmirror_common::types::{BranchName, CommitHash, RefSnapshot, BRANCH_REF_PREFIX};
use tracing::{debug, info, warn};

use super::command::{
    CommandExecutor, GitCommandError, GitInvocation, GitRunner, ProcessCommandExecutor,
};
use crate::refs::{CommitGraph, RefStore, RefStoreError};

/// Identity stamped on commits the mirror creates itself.
const MIRROR_IDENT_NAME: &str = "gitmirror";
const MIRROR_IDENT_EMAIL: &str = "gitmirror@localhost";

/// Reflog message for ref updates made by the engine.
const REFLOG_MESSAGE: &str = "gitmirror";

#[derive(Debug, Clone)]
pub struct GitRepository<E = ProcessCommandExecutor> {
    runner: GitRunner<E>,
}

impl GitRepository<ProcessCommandExecutor> {
    /// Open the bare repository at `path`, creating it when missing.
    pub async fn open_or_init(path: impl Into<PathBuf>) -> Result<Self, RefStoreError> {
        let path = path.into();
        if !path.join("HEAD").exists() {
            std::fs::create_dir_all(&path)?;
            GitRunner::new(&path).run(["init", "--bare", "--quiet", "."]).await?;
            info!(path = %path.display(), "initialized mirror repository");
        }

        let repository = Self { runner: GitRunner::new(&path) };
        repository.configure().await?;
        Ok(repository)
    }
}

impl<E: CommandExecutor> GitRepository<E> {
    pub fn with_runner(runner: GitRunner<E>) -> Self {
        Self { runner }
    }

    pub fn path(&self) -> &Path {
        self.runner.repo_path()
    }

    pub fn runner(&self) -> &GitRunner<E> {
        &self.runner
    }

    /// Settings that make receive-pack itself refuse history rewrites.
    async fn configure(&self) -> Result<(), RefStoreError> {
        for (key, value) in [
            ("receive.denyNonFastForwards", "true"),
            ("receive.denyDeletes", "true"),
            ("core.logAllRefUpdates", "true"),
            ("transfer.hideRefs", "refs/mirror/"),
        ] {
            self.runner.run(["config", key, value]).await?;
        }
        Ok(())
    }

    async fn update_ref(
        &self,
        branch: &BranchName,
        expected: Option<&CommitHash>,
        new: Option<&CommitHash>,
    ) -> Result<bool, RefStoreError> {
        let width = new.or(expected).map_or(40, |h| h.as_str().len());
        let zero = "0".repeat(width);
        let old = expected.map_or(zero.as_str(), CommitHash::as_str).to_string();

        let mut args = vec!["update-ref".to_string(), "-m".to_string(), REFLOG_MESSAGE.to_string()];
        match new {
            Some(new) => args.extend([branch.full_ref(), new.to_string(), old]),
            None => args.extend(["-d".to_string(), branch.full_ref(), old]),
        }

        let invocation = GitInvocation::new(args);
        let result = self.runner.run_status(&invocation).await?;
        if result.success {
            return Ok(true);
        }

        // update-ref does not say which precondition failed. A lost race
        // leaves the ref at something other than `expected`.
        let current = self.get(branch).await?;
        if current.as_ref() != expected {
            debug!(
                branch = %branch,
                expected = ?expected.map(CommitHash::short),
                current = ?current.as_ref().map(CommitHash::short),
                "compare-and-swap lost"
            );
            return Ok(false);
        }

        Err(RefStoreError::Git(GitCommandError::CommandFailed {
            command: invocation.display(),
            code: result.code,
            stderr: result.stderr,
        }))
    }
}

/// Parse `for-each-ref --format='%(objectname) %(refname)'` output.
pub(crate) fn parse_ref_listing(output: &str, prefix: &str) -> Result<RefSnapshot, RefStoreError> {
    let mut refs = RefSnapshot::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let Some((hash, refname)) = line.split_once(|c: char| c == ' ' || c == '\t') else {
            return Err(RefStoreError::Corrupt(line.to_string()));
        };
        let Some(short) = refname.trim().strip_prefix(prefix) else {
            continue;
        };
        let commit = CommitHash::new(hash).map_err(|e| RefStoreError::Corrupt(e.to_string()))?;
        match BranchName::new(short) {
            Ok(branch) => {
                refs.insert(branch, commit);
            }
            Err(error) => warn!(refname, error = %error, "skipping ref with unsupported name"),
        }
    }
    Ok(refs)
}

impl<E: CommandExecutor> RefStore for GitRepository<E> {
    async fn get_all(&self) -> Result<RefSnapshot, RefStoreError> {
        let output = self
            .runner
            .run(["for-each-ref", "--format=%(objectname) %(refname)", BRANCH_REF_PREFIX])
            .await?;
        parse_ref_listing(&output.stdout_text(), BRANCH_REF_PREFIX)
    }

    async fn get(&self, branch: &BranchName) -> Result<Option<CommitHash>, RefStoreError> {
        let invocation = GitInvocation::new([
            "rev-parse".to_string(),
            "--verify".to_string(),
            "--quiet".to_string(),
            format!("{}^{{commit}}", branch.full_ref()),
        ]);
        let result = self.runner.run_status(&invocation).await?;
        if !result.success {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&result.stdout);
        CommitHash::new(text.trim()).map(Some).map_err(|e| RefStoreError::Corrupt(e.to_string()))
    }

    async fn compare_and_swap(
        &self,
        branch: &BranchName,
        expected: Option<&CommitHash>,
        new: Option<&CommitHash>,
    ) -> Result<bool, RefStoreError> {
        if expected.is_none() && new.is_none() {
            return Ok(self.get(branch).await?.is_none());
        }
        self.update_ref(branch, expected, new).await
    }

    async fn force_set(&self, branch: &BranchName, hash: &CommitHash) -> Result<(), RefStoreError> {
        self.runner
            .run(["update-ref", "-m", REFLOG_MESSAGE, &branch.full_ref(), hash.as_str()])
            .await?;
        Ok(())
    }

    async fn delete(&self, branch: &BranchName) -> Result<(), RefStoreError> {
        self.runner.run(["update-ref", "-m", REFLOG_MESSAGE, "-d", &branch.full_ref()]).await?;
        Ok(())
    }
}

impl<E: CommandExecutor> CommitGraph for GitRepository<E> {
    async fn is_ancestor(
        &self,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> Result<bool, RefStoreError> {
        if ancestor == descendant {
            return Ok(true);
        }
        let invocation =
            GitInvocation::new(["merge-base", "--is-ancestor", ancestor.as_str(), descendant.as_str()]);
        let result = self.runner.run_status(&invocation).await?;
        match result.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(RefStoreError::Git(GitCommandError::CommandFailed {
                command: invocation.display(),
                code,
                stderr: result.stderr,
            })),
        }
    }

    async fn divergence(
        &self,
        local: &CommitHash,
        upstream: &CommitHash,
    ) -> Result<(usize, usize), RefStoreError> {
        let range = format!("{local}...{upstream}");
        let output = self.runner.run(["rev-list", "--left-right", "--count", range.as_str()]).await?;
        let text = output.stdout_text();
        let mut counts = text.split_whitespace().map(str::parse::<usize>);
        match (counts.next(), counts.next()) {
            (Some(Ok(ahead)), Some(Ok(behind))) => Ok((ahead, behind)),
            _ => Err(RefStoreError::Corrupt(format!("rev-list --count output {text:?}"))),
        }
    }

    async fn create_root_commit(&self, message: &str) -> Result<CommitHash, RefStoreError> {
        let tree = self.runner.run_with(GitInvocation::new(["mktree"]).stdin(Vec::new())).await?;
        let tree = tree.stdout_text();

        let commit = self
            .runner
            .run_with(
                GitInvocation::new(["commit-tree", tree.trim(), "-m", message])
                    .env("GIT_AUTHOR_NAME", MIRROR_IDENT_NAME)
                    .env("GIT_AUTHOR_EMAIL", MIRROR_IDENT_EMAIL)
                    .env("GIT_COMMITTER_NAME", MIRROR_IDENT_NAME)
                    .env("GIT_COMMITTER_EMAIL", MIRROR_IDENT_EMAIL),
            )
            .await?;
        CommitHash::new(commit.stdout_text().trim()).map_err(|e| RefStoreError::Corrupt(e.to_string()))
    }
}
