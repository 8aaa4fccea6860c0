//! Service configuration.
//!
//! Loaded from a TOML file by the binary; every section has defaults so
//! an empty file (or none at all) yields a runnable development setup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::jar::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonsterConfig {
    pub database: DatabaseConfig,
    pub processing: ProcessingConfig,
    pub plugins: PluginConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file holding the cookie documents.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cookie-monster.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Worker thread count.
    pub workers: usize,

    /// Fallback wait per `next_for_processing` call, in milliseconds.
    pub poll_timeout_ms: u64,

    /// Overrides the store retry policy. Unset means build-dependent:
    /// retries on in release builds, off in debug builds so real
    /// errors surface.
    pub retry: Option<bool>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            poll_timeout_ms: 5_000,
            retry: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Directory tree scanned for `*.rule.*` shared objects.
    pub rules_dir: Option<PathBuf>,

    /// Directory tree scanned for `*.loader.*` shared objects.
    pub loaders_dir: Option<PathBuf>,

    /// Directory tree scanned for `*.receiver.*` shared objects.
    pub receivers_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
        }
    }
}

impl MonsterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.processing.poll_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self.processing.retry {
            Some(enabled) => RetryPolicy {
                enabled,
                ..RetryPolicy::default()
            },
            None => RetryPolicy::default(),
        }
    }
}
