//! octorun.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OctorunConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of runner sets reconciled in parallel.
    pub workers: usize,
    /// How often every runner set is re-queued regardless of changes.
    pub resync_interval: String,
    /// Deadline for a single reconciliation.
    pub reconcile_timeout: String,
    /// Recorded as the source of emitted events.
    pub field_owner: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: "5m".to_string(),
            reconcile_timeout: "30s".to_string(),
            field_owner: "runnerset-controller".to_string(),
        }
    }
}

/// Per-key retry backoff for failed reconciliations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay: String,
    pub max_delay: String,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: "250ms".to_string(),
            max_delay: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the redb state file.
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/octorun"),
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("state.redb")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` env-filter directive, overridden by `RUST_LOG`.
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,octorund=debug,octorun=debug".to_string(),
            json: false,
        }
    }
}

/// Durations resolved from a validated config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub resync_interval: Duration,
    pub reconcile_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl OctorunConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: OctorunConfig = toml::from_str(content)?;
        config.timings()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parse and check every duration field.
    pub fn timings(&self) -> anyhow::Result<Timings> {
        if self.controller.workers == 0 {
            bail!("controller.workers must be at least 1");
        }
        let timings = Timings {
            resync_interval: parse_duration(&self.controller.resync_interval)
                .context("controller.resync_interval")?,
            reconcile_timeout: parse_duration(&self.controller.reconcile_timeout)
                .context("controller.reconcile_timeout")?,
            base_delay: parse_duration(&self.backoff.base_delay).context("backoff.base_delay")?,
            max_delay: parse_duration(&self.backoff.max_delay).context("backoff.max_delay")?,
        };
        if timings.resync_interval.is_zero() {
            bail!("controller.resync_interval must be positive");
        }
        if timings.reconcile_timeout.is_zero() {
            bail!("controller.reconcile_timeout must be positive");
        }
        if timings.base_delay > timings.max_delay {
            bail!("backoff.base_delay exceeds backoff.max_delay");
        }
        Ok(timings)
    }
}
