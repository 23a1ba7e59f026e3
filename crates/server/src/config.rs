// Server configuration.
//
// Process-level settings come from the environment. Repository and engine
// settings live in the TOML file named by `GITMIRROR_CONFIG`.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Largest accepted push body when `GITMIRROR_MAX_PUSH_BYTES` is unset.
pub const DEFAULT_MAX_PUSH_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Engine TOML file. `None` when no home directory could be resolved.
    pub config_path: Option<PathBuf>,
    /// Log filter directive (e.g. `info`, `gitmirror_engine=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Request body limit for git and push endpoints.
    pub max_push_bytes: usize,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `GITMIRROR_HOST` | `0.0.0.0` |
    /// | `GITMIRROR_PORT` | `8080` |
    /// | `GITMIRROR_CONFIG` | `~/.gitmirror/config.toml` |
    /// | `GITMIRROR_LOG_FILTER` | `info` |
    /// | `GITMIRROR_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `GITMIRROR_MAX_PUSH_BYTES` | 256 MiB |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("GITMIRROR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("GITMIRROR_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let config_path = env("GITMIRROR_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(gitmirror_engine::config::default_config_path);

        let log_filter = env("GITMIRROR_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("GITMIRROR_LOG_FORMAT").as_deref().map(str::trim) {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let max_push_bytes = env("GITMIRROR_MAX_PUSH_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|limit: &usize| *limit > 0)
            .unwrap_or(DEFAULT_MAX_PUSH_BYTES);

        Self { listen_addr, config_path, log_filter, log_format, max_push_bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.max_push_bytes, DEFAULT_MAX_PUSH_BYTES);
    }

    #[test]
    fn custom_host_port_and_config_path() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("GITMIRROR_HOST", "127.0.0.1"),
            ("GITMIRROR_PORT", "9418"),
            ("GITMIRROR_CONFIG", "/etc/gitmirror/config.toml"),
        ])));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:9418");
        assert_eq!(cfg.config_path, Some(PathBuf::from("/etc/gitmirror/config.toml")));
    }

    #[test]
    fn json_log_format_is_case_insensitive() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([("GITMIRROR_LOG_FORMAT", "JSON")])));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("GITMIRROR_PORT", "not_a_number"),
            ("GITMIRROR_MAX_PUSH_BYTES", "0"),
        ])));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.max_push_bytes, DEFAULT_MAX_PUSH_BYTES);
    }

    #[test]
    fn push_limit_override() {
        let cfg =
            ServerConfig::from_env_fn(env_from_map(HashMap::from([("GITMIRROR_MAX_PUSH_BYTES", "1048576")])));
        assert_eq!(cfg.max_push_bytes, 1024 * 1024);
    }
}
