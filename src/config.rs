//! Configuration for the controller CLI and the worker process.
//!
//! The controller reads a TOML file (see `config/kb.example.toml`). The
//! worker is configured only through its environment, which the controller
//! sets when spawning it.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Data root handed to the worker process. Required.
pub const ENV_DATA_ROOT: &str = "KB_DATA_ROOT";
/// Optional per-item import deadline, in seconds.
pub const ENV_ITEM_TIMEOUT_SECS: &str = "KB_ITEM_TIMEOUT_SECS";
/// Optional worker log level.
pub const ENV_LOG: &str = "KB_LOG";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerProcessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerProcessConfig {
    /// Worker executable. Defaults to `kb-worker` beside the current binary.
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Timeout for `kb.importFiles`, which walks directories before replying.
    #[serde(default = "default_import_timeout_ms")]
    pub import_timeout_ms: u64,
    #[serde(default)]
    pub item_timeout_secs: Option<u64>,
}

impl Default for WorkerProcessConfig {
    fn default() -> Self {
        Self {
            binary: None,
            call_timeout_ms: default_call_timeout_ms(),
            import_timeout_ms: default_import_timeout_ms(),
            item_timeout_secs: None,
        }
    }
}

fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_import_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl WorkerProcessConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn import_timeout(&self) -> Duration {
        Duration::from_millis(self.import_timeout_ms)
    }

    /// Resolve the worker executable path.
    pub fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.binary {
            return Ok(path.clone());
        }
        let mut path = std::env::current_exe().context("Failed to locate current executable")?;
        path.pop();
        path.push(format!("kb-worker{}", std::env::consts::EXE_SUFFIX));
        Ok(path)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.data_root.as_os_str().is_empty() {
        bail!("storage.data_root must not be empty");
    }
    if config.worker.call_timeout_ms == 0 {
        bail!("worker.call_timeout_ms must be > 0");
    }
    if config.worker.import_timeout_ms == 0 {
        bail!("worker.import_timeout_ms must be > 0");
    }
    if config.worker.item_timeout_secs == Some(0) {
        bail!("worker.item_timeout_secs must be > 0 when set");
    }
    Ok(())
}

/// Settings the worker process reads from its environment at startup.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub data_root: PathBuf,
    pub item_timeout: Option<Duration>,
    pub log_level: String,
}

impl WorkerEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_root = match lookup(ENV_DATA_ROOT) {
            Some(v) if !v.trim().is_empty() => PathBuf::from(v),
            _ => bail!("{} is not set; the worker cannot locate its data", ENV_DATA_ROOT),
        };

        let item_timeout = match lookup(ENV_ITEM_TIMEOUT_SECS) {
            Some(raw) if !raw.trim().is_empty() => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{} must be an integer, got '{}'", ENV_ITEM_TIMEOUT_SECS, raw))?;
                if secs == 0 {
                    bail!("{} must be > 0", ENV_ITEM_TIMEOUT_SECS);
                }
                Some(Duration::from_secs(secs))
            }
            _ => None,
        };

        Ok(Self {
            data_root,
            item_timeout,
            log_level: lookup(ENV_LOG).unwrap_or_else(default_level),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[storage]\ndata_root = \"/tmp/kb\"\n").unwrap();
        assert_eq!(config.storage.data_root, PathBuf::from("/tmp/kb"));
        assert_eq!(config.worker.call_timeout_ms, 30_000);
        assert_eq!(config.worker.item_timeout_secs, None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = parse("[storage]\ndata_root = \"/tmp/kb\"\n[worker]\ncall_timeout_ms = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("call_timeout_ms"));
    }

    #[test]
    fn worker_env_requires_data_root() {
        let env: HashMap<&str, &str> = HashMap::new();
        let err = WorkerEnv::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(err.to_string().contains(ENV_DATA_ROOT));
    }

    #[test]
    fn worker_env_parses_optional_values() {
        let env: HashMap<&str, &str> = [
            (ENV_DATA_ROOT, "/data"),
            (ENV_ITEM_TIMEOUT_SECS, "30"),
            (ENV_LOG, "debug"),
        ]
        .into_iter()
        .collect();
        let parsed = WorkerEnv::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(parsed.data_root, PathBuf::from("/data"));
        assert_eq!(parsed.item_timeout, Some(Duration::from_secs(30)));
        assert_eq!(parsed.log_level, "debug");
    }

    #[test]
    fn worker_env_rejects_garbage_timeout() {
        let env: HashMap<&str, &str> =
            [(ENV_DATA_ROOT, "/data"), (ENV_ITEM_TIMEOUT_SECS, "soon")]
                .into_iter()
                .collect();
        assert!(WorkerEnv::from_lookup(|k| env.get(k).map(|v| v.to_string())).is_err());
    }
}
