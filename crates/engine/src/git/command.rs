use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl GitOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCommandError {
    SpawnFailed { command: String, message: String },
    CommandFailed { command: String, code: Option<i32>, stderr: String },
    TimedOut { command: String, after: Duration },
}

impl GitCommandError {
    /// Diagnostic text git printed, if the command ran at all.
    pub fn stderr(&self) -> &str {
        match self {
            Self::CommandFailed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

impl Display for GitCommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GitCommandError::SpawnFailed { command, message } => {
                write!(f, "failed to run `{command}`: {message}")
            }
            GitCommandError::CommandFailed { command, code, stderr } => {
                write!(f, "`{command}` failed with code {:?}: {}", code, stderr.trim())
            }
            GitCommandError::TimedOut { command, after } => {
                write!(f, "`{command}` timed out after {}s", after.as_secs())
            }
        }
    }
}

impl Error for GitCommandError {}

/// One git invocation: arguments plus optional stdin, extra environment and
/// a wall-clock limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitInvocation {
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl GitInvocation {
    pub fn new<S: Into<String>>(args: impl IntoIterator<Item = S>) -> Self {
        Self { args: args.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Command line for logs and errors. Config overrides passed with `-c`
    /// may carry credentials and are elided.
    pub fn display(&self) -> String {
        let mut parts = vec!["git".to_string()];
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            if arg == "-c" {
                args.next();
                parts.push("-c <redacted>".to_string());
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

pub trait CommandExecutor: Send + Sync + 'static {
    /// Run `program` to completion. When `invocation.timeout` elapses the
    /// executor stops the process, waits for it to exit, and only then
    /// answers with an `ErrorKind::TimedOut` error.
    fn execute(
        &self,
        program: &str,
        invocation: &GitInvocation,
        cwd: &Path,
    ) -> impl Future<Output = Result<CommandResult, std::io::Error>> + Send;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandExecutor;

impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        invocation: &GitInvocation,
        cwd: &Path,
    ) -> Result<CommandResult, std::io::Error> {
        let mut command = Command::new(program);
        command
            .args(&invocation.args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if invocation.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;

        // Feed stdin from its own task so a child that writes before it has
        // read all input cannot deadlock against us.
        let writer = match (child.stdin.take(), invocation.stdin.clone()) {
            (Some(mut stdin), Some(input)) => Some(tokio::spawn(async move {
                stdin.write_all(&input).await?;
                stdin.shutdown().await
            })),
            _ => None,
        };

        let stdout = tokio::spawn(read_to_end(child.stdout.take()));
        let stderr = tokio::spawn(read_to_end(child.stderr.take()));

        let status = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    // kill() also reaps, so no git process outlives the call.
                    child.kill().await?;
                    stdout.abort();
                    stderr.abort();
                    if let Some(writer) = &writer {
                        writer.abort();
                    }
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("killed after {}ms", limit.as_millis()),
                    ));
                }
            },
            None => child.wait().await?,
        };
        let stdout = joined(stdout.await)?;
        let stderr = joined(stderr.await)?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The child may exit before consuming its input; the exit
                // status is what matters.
                Ok(Err(error)) if error.kind() == std::io::ErrorKind::BrokenPipe => {}
                Ok(Err(error)) => return Err(error),
                Err(join) => return Err(std::io::Error::other(join.to_string())),
            }
        }

        Ok(CommandResult {
            success: status.success(),
            code: status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

async fn read_to_end(pipe: Option<impl AsyncRead + Unpin>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn joined<T>(result: Result<std::io::Result<T>, tokio::task::JoinError>) -> std::io::Result<T> {
    result.map_err(|join| std::io::Error::other(join.to_string()))?
}

/// Runs git inside one repository directory.
#[derive(Debug, Clone)]
pub struct GitRunner<E = ProcessCommandExecutor> {
    repo_path: PathBuf,
    executor: E,
}

impl GitRunner<ProcessCommandExecutor> {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self { repo_path: repo_path.into(), executor: ProcessCommandExecutor }
    }
}

impl<E: CommandExecutor> GitRunner<E> {
    pub fn with_executor(repo_path: impl Into<PathBuf>, executor: E) -> Self {
        Self { repo_path: repo_path.into(), executor }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Run and require a zero exit status.
    pub async fn run<S: Into<String>>(
        &self,
        args: impl IntoIterator<Item = S>,
    ) -> Result<GitOutput, GitCommandError> {
        self.run_with(GitInvocation::new(args)).await
    }

    pub async fn run_with(&self, invocation: GitInvocation) -> Result<GitOutput, GitCommandError> {
        let command = invocation.display();
        let result = self.run_status(&invocation).await?;

        if result.success {
            return Ok(GitOutput { stdout: result.stdout, stderr: result.stderr });
        }

        let stderr = if result.stderr.trim().is_empty() {
            String::from_utf8_lossy(&result.stdout).into_owned()
        } else {
            result.stderr
        };

        Err(GitCommandError::CommandFailed { command, code: result.code, stderr })
    }

    /// Run and hand back the raw result whatever the exit status. Only a
    /// failure to spawn or a timeout is an error.
    pub async fn run_status(
        &self,
        invocation: &GitInvocation,
    ) -> Result<CommandResult, GitCommandError> {
        let command = invocation.display();
        self.executor.execute("git", invocation, &self.repo_path).await.map_err(|error| {
            match invocation.timeout {
                Some(after) if error.kind() == std::io::ErrorKind::TimedOut => {
                    GitCommandError::TimedOut { command, after }
                }
                _ => GitCommandError::SpawnFailed { command, message: error.to_string() },
            }
        })
    }
}
