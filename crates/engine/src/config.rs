// Engine configuration file: `~/.gitmirror/config.toml` by default.
//
// [engine]
// forward_policy = "rollback"          # or "retry_queue"
// multi_writer_branches = ["helix-specs"]
//
// [[repository]]
// id = "acme-app"
// endpoint = "https://git.example.com/acme/app.git"
// credentials = { username = "x-access-token", token_env = "ACME_TOKEN" }

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gitmirror_common::types::{BranchName, RepositoryId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::git::UpstreamCredentials;

/// Default multi-writer branch: the shared design-notes branch.
pub const DEFAULT_MULTI_WRITER_BRANCH: &str = "helix-specs";

/// Root directory for gitmirror state: `~/.gitmirror/`.
pub fn default_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".gitmirror"))
}

/// Path to the default config file: `~/.gitmirror/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    default_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("environment variable {var} for {repository_id} credentials is not set")]
    MissingSecret { repository_id: String, var: String },
}

// ── Engine settings ────────────────────────────────────────────────

/// What happens to the local ref when forwarding fails with a transport
/// error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForwardPolicy {
    /// Revert the local ref and fail the push.
    #[default]
    Rollback,
    /// Keep the local ref and retry forwarding in the background.
    RetryQueue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub forward_policy: ForwardPolicy,
    /// Bounded wait for one branch lock acquisition.
    pub lock_wait_sec: u64,
    /// Attempts at acquiring a push's locks before LockTimeout surfaces.
    pub lock_attempts: u32,
    /// Limit for each fetch or push against the upstream host.
    pub upstream_timeout_sec: u64,
    /// Limit for one push operation from receive through forwarding.
    pub push_deadline_sec: u64,
    /// Forward attempts per branch when upstream reports a stale lease.
    pub forward_attempts: u32,
    /// Minimum spacing of read-triggered refreshes per repository.
    pub refresh_min_interval_sec: u64,
    /// Branches written by many agents; never force-synced.
    pub multi_writer_branches: Vec<String>,
    /// Where mirrors live when a repository sets no `local_path`.
    pub data_dir: Option<PathBuf>,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            forward_policy: ForwardPolicy::Rollback,
            lock_wait_sec: 30,
            lock_attempts: 3,
            upstream_timeout_sec: 300,
            push_deadline_sec: 600,
            forward_attempts: 3,
            refresh_min_interval_sec: 10,
            multi_writer_branches: vec![DEFAULT_MULTI_WRITER_BRANCH.to_string()],
            data_dir: None,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 8, base_delay_ms: 250, max_delay_ms: 30_000, capacity: 1_000 }
    }
}

/// Runtime form of [`EngineConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub forward_policy: ForwardPolicy,
    pub lock_wait: Duration,
    pub lock_attempts: u32,
    pub upstream_timeout: Duration,
    pub push_deadline: Duration,
    pub forward_attempts: u32,
    pub refresh_min_interval: Duration,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineConfig::default().settings()
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            forward_policy: self.forward_policy,
            lock_wait: Duration::from_secs(self.lock_wait_sec),
            lock_attempts: self.lock_attempts.max(1),
            upstream_timeout: Duration::from_secs(self.upstream_timeout_sec),
            push_deadline: Duration::from_secs(self.push_deadline_sec),
            forward_attempts: self.forward_attempts.max(1),
            refresh_min_interval: Duration::from_secs(self.refresh_min_interval_sec),
            retry: RetrySettings {
                max_attempts: self.retry.max_attempts.max(1),
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                capacity: self.retry.capacity,
            },
        }
    }
}

// ── Repositories ───────────────────────────────────────────────────

/// Credentials reference. The token itself never lives in the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    pub username: String,
    /// Name of the environment variable holding the token.
    pub token_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
    /// Extra multi-writer branches for this repository only.
    #[serde(default)]
    pub multi_writer_branches: Vec<String>,
}

/// A repository entry after validation and secret lookup.
#[derive(Debug, Clone)]
pub struct RepositorySpec {
    pub id: RepositoryId,
    pub endpoint: Url,
    pub local_path: PathBuf,
    pub credentials: Option<UpstreamCredentials>,
    pub multi_writer_branches: BTreeSet<BranchName>,
}

// ── File ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MirrorConfig {
    pub engine: EngineConfig,
    #[serde(rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,
}

impl MirrorConfig {
    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Validate every repository entry, resolving tokens through `env`.
    pub fn repository_specs<F>(&self, env: F) -> Result<Vec<RepositorySpec>, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let global = parse_branches(&self.engine.multi_writer_branches)?;
        let data_dir = self.engine.data_dir.clone().or_else(|| default_dir().map(|d| d.join("repos")));

        let mut seen = BTreeSet::new();
        let mut specs = Vec::with_capacity(self.repositories.len());
        for entry in &self.repositories {
            let id = RepositoryId::new(entry.id.as_str())
                .map_err(|e| ConfigError::Invalid(format!("repository id {:?}: {e}", entry.id)))?;
            if !seen.insert(id.clone()) {
                return Err(ConfigError::Invalid(format!("repository {id} is listed twice")));
            }

            let endpoint = parse_endpoint(&entry.endpoint)
                .map_err(|e| ConfigError::Invalid(format!("repository {id} endpoint: {e}")))?;

            let local_path = match (&entry.local_path, &data_dir) {
                (Some(path), _) => path.clone(),
                (None, Some(dir)) => dir.join(format!("{id}.git")),
                (None, None) => {
                    return Err(ConfigError::Invalid(format!(
                        "repository {id} has no local_path and no data_dir is available"
                    )))
                }
            };

            let credentials = match &entry.credentials {
                Some(creds) => {
                    let token = env(&creds.token_env).map_err(|_| ConfigError::MissingSecret {
                        repository_id: id.to_string(),
                        var: creds.token_env.clone(),
                    })?;
                    Some(UpstreamCredentials { username: creds.username.clone(), token })
                }
                None => None,
            };

            let mut multi_writer_branches = global.clone();
            multi_writer_branches.extend(parse_branches(&entry.multi_writer_branches)?);

            specs.push(RepositorySpec { id, endpoint, local_path, credentials, multi_writer_branches });
        }
        Ok(specs)
    }
}

fn parse_branches(names: &[String]) -> Result<BTreeSet<BranchName>, ConfigError> {
    names
        .iter()
        .map(|name| {
            BranchName::new(name.as_str())
                .map_err(|e| ConfigError::Invalid(format!("multi-writer branch {name:?}: {e}")))
        })
        .collect()
}

/// Accept a URL, or an absolute filesystem path as a `file://` URL.
fn parse_endpoint(raw: &str) -> Result<Url, String> {
    if Path::new(raw).is_absolute() {
        return Url::from_file_path(raw).map_err(|_| format!("{raw:?} is not a valid path"));
    }
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    match url.scheme() {
        "https" | "http" | "ssh" | "file" => {}
        other => return Err(format!("unsupported scheme {other:?}")),
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err("credentials must not be embedded in the endpoint".to_string());
    }
    Ok(url)
}
