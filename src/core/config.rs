//! Store configuration.
//!
//! [`StoreOptions`] is what the library consumes. [`StoreConfig`] is the TOML
//! file operators write; every field is optional and falls back to the
//! defaults below.
//!
//! ```toml
//! base_dir = "/var/lib/bundlestore/prompts"
//! fts_enabled = true
//! snapshot_max_age_secs = 3600
//! sweep_interval_secs = 86400
//! soft_delete_grace_secs = 172800
//! ```

use crate::core::error::{Result, StoreError};
use crate::core::time::{Clock, default_clock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Floor for `sweep_interval`; shorter values would spin the sweeper.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SOFT_DELETE_GRACE: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Clone)]
pub struct StoreOptions {
    pub fts_enabled: bool,
    /// Built-in snapshots younger than this are not rebuilt on trigger.
    pub snapshot_max_age: Duration,
    pub sweep_interval: Duration,
    /// How long a soft-deleted bundle lingers before the sweeper removes it.
    pub soft_delete_grace: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            fts_enabled: true,
            snapshot_max_age: DEFAULT_SNAPSHOT_MAX_AGE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            soft_delete_grace: DEFAULT_SOFT_DELETE_GRACE,
            clock: default_clock(),
        }
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("fts_enabled", &self.fts_enabled)
            .field("snapshot_max_age", &self.snapshot_max_age)
            .field("sweep_interval", &self.sweep_interval)
            .field("soft_delete_grace", &self.soft_delete_grace)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub base_dir: Option<PathBuf>,
    pub fts_enabled: Option<bool>,
    pub snapshot_max_age_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub soft_delete_grace_secs: Option<u64>,
}

impl StoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        Self::parse(&content).map_err(|e| match e {
            StoreError::Config(msg) => StoreError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: StoreConfig =
            toml::from_str(content).map_err(|e| StoreError::Config(e.to_string()))?;
        if config.sweep_interval_secs == Some(0) {
            return Err(StoreError::Config(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn into_options(self) -> StoreOptions {
        let defaults = StoreOptions::default();
        StoreOptions {
            fts_enabled: self.fts_enabled.unwrap_or(defaults.fts_enabled),
            snapshot_max_age: self
                .snapshot_max_age_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.snapshot_max_age),
            sweep_interval: self
                .sweep_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            soft_delete_grace: self
                .soft_delete_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.soft_delete_grace),
            clock: defaults.clock,
        }
    }
}
