//! Bus configuration loaded from a TOML file with environment fallbacks.
//!
//! The file is optional; unset keys fall back to the environment
//! (`REDIS_HOSTNAME`, `REDIS_PORT`, `REDIS_DB`, `REDISBUS_SITE`) and then to
//! defaults. Command-line flags override everything.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".worker_config.toml";

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    globals: RawGlobals,
    #[serde(default)]
    workers: toml::Table,
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobals {
    redis_hostname: Option<String>,
    redis_port: Option<u16>,
    redis_db: Option<i64>,
    site: Option<String>,
    worker: Option<String>,
    worker_path: Option<PathBuf>,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub redis_hostname: String,
    pub redis_port: u16,
    pub redis_db: i64,
    pub site: String,
    /// Default worker type for the CLI, if configured.
    pub worker: Option<String>,
    pub worker_path: Option<PathBuf>,
    /// Free-form per-worker configuration, passed through to behaviors.
    pub workers: toml::Table,
}

impl BusConfig {
    /// Load from `path`; a missing file yields pure defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            RawConfig::default()
        };
        Ok(Self::resolve(raw))
    }

    fn resolve(raw: RawConfig) -> Self {
        let env = |key: &str| std::env::var(key).ok();
        Self {
            redis_hostname: raw
                .globals
                .redis_hostname
                .or_else(|| env("REDIS_HOSTNAME"))
                .unwrap_or_else(|| "localhost".to_string()),
            redis_port: raw
                .globals
                .redis_port
                .or_else(|| env("REDIS_PORT").and_then(|p| p.parse().ok()))
                .unwrap_or(6379),
            redis_db: raw
                .globals
                .redis_db
                .or_else(|| env("REDIS_DB").and_then(|d| d.parse().ok()))
                .unwrap_or(0),
            site: raw
                .globals
                .site
                .or_else(|| env("REDISBUS_SITE"))
                .unwrap_or_else(|| "local".to_string()),
            worker: raw.globals.worker,
            worker_path: raw.globals.worker_path,
            workers: raw.workers,
        }
    }

    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_hostname, self.redis_port, self.redis_db
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_values_win() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[globals]
redis_hostname = "redis.internal"
redis_port = 6380
redis_db = 2
site = "prod"
worker = "echo"

[workers.echo]
greeting = "hi"
"#
        )
        .unwrap();

        let config = BusConfig::load(file.path()).unwrap();
        assert_eq!(config.redis_hostname, "redis.internal");
        assert_eq!(config.redis_port, 6380);
        assert_eq!(config.redis_db, 2);
        assert_eq!(config.site, "prod");
        assert_eq!(config.worker.as_deref(), Some("echo"));
        assert_eq!(config.redis_url(), "redis://redis.internal:6380/2");

        let echo = config.workers.get("echo").unwrap();
        assert_eq!(
            echo.get("greeting").and_then(|v| v.as_str()),
            Some("hi")
        );
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = BusConfig::load(Path::new("/nonexistent/.worker_config.toml")).unwrap();
        // Env vars may override hostname/port/db/site; the rest must default.
        assert!(config.worker.is_none());
        assert!(config.worker_path.is_none());
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_partial_file_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[globals]\nsite = \"test\"").unwrap();
        let config = BusConfig::load(file.path()).unwrap();
        assert_eq!(config.site, "test");
    }
}
