//! Startup configuration for a kwatch engine.
//!
//! # File format
//!
//! ```yaml
//! kinds:
//!   pod: true
//!   deployment: false
//! namespace: ""
//! workers: 1
//! max_retries: 5
//! backoff:
//!   base_delay_ms: 5
//!   max_delay_secs: 1000
//!   qps: 10
//!   burst: 100
//! relist:
//!   initial_delay_ms: 500
//!   max_delay_secs: 30
//!   max_consecutive_failures: 10
//! ```
//!
//! Every field is optional. An empty file yields [`EngineConfig::default`].
//!
//! # API pattern
//!
//! - `load_at(path)`: explicit path; a missing file is an error
//! - `load()`: `$KWATCH_CONFIG`, else `~/.kwatch.yaml`; a missing home
//!   config falls back to defaults

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::KindTag;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "KWATCH_CONFIG";

/// File name looked up in the home directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = ".kwatch.yaml";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Object kinds to observe, keyed by kind name.
    pub kinds: BTreeMap<String, bool>,
    /// Restrict snapshots and streams to one namespace. Empty means all.
    pub namespace: String,
    /// Reconcile workers per kind.
    pub workers: usize,
    /// Handler failures tolerated per key before giving up.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    pub relist: RelistConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kinds: BTreeMap::new(),
            namespace: String::new(),
            workers: 1,
            max_retries: 5,
            backoff: BackoffConfig::default(),
            relist: RelistConfig::default(),
        }
    }
}

/// Per-key retry backoff plus an overall token bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub qps: f64,
    pub burst: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_secs: 1000,
            qps: 10.0,
            burst: 100,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

/// Delay policy for re-establishing a snapshot after the stream drops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelistConfig {
    pub initial_delay_ms: u64,
    pub max_delay_secs: u64,
    /// Consecutive failed relists after which the kind's loop gives up.
    pub max_consecutive_failures: u32,
}

impl Default for RelistConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_secs: 30,
            max_consecutive_failures: 10,
        }
    }
}

impl RelistConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Delay before relist attempt number `failures` (1-based), doubling and
    /// capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let delay = self.initial_delay().saturating_mul(1u32 << exp);
        delay.min(self.max_delay())
    }
}

impl EngineConfig {
    /// Whether `kind` is switched on. Kind names compare case-insensitively.
    pub fn is_enabled(&self, kind: &KindTag) -> bool {
        self.kinds
            .iter()
            .any(|(name, on)| *on && name.eq_ignore_ascii_case(&kind.0))
    }

    /// Enabled kinds in name order.
    pub fn enabled_kinds(&self) -> Vec<KindTag> {
        self.kinds
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| KindTag::from(name.as_str()))
            .collect()
    }

    /// Namespace scope, `None` when watching all namespaces.
    pub fn namespace_scope(&self) -> Option<&str> {
        Some(self.namespace.as_str()).filter(|ns| !ns.is_empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.backoff.burst == 0 {
            return Err(ConfigError::Invalid("backoff.burst must be at least 1".into()));
        }
        if self.backoff.qps.is_nan() || self.backoff.qps <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff.qps must be positive, got {}",
                self.backoff.qps
            )));
        }
        if self.backoff.base_delay() > self.backoff.max_delay() {
            return Err(ConfigError::Invalid(
                "backoff.base_delay_ms exceeds backoff.max_delay_secs".into(),
            ));
        }
        if self.relist.initial_delay() > self.relist.max_delay() {
            return Err(ConfigError::Invalid(
                "relist.initial_delay_ms exceeds relist.max_delay_secs".into(),
            ));
        }
        if self.relist.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "relist.max_consecutive_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse and validate a config document.
pub fn from_str_at(contents: &str, path: &Path) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = if contents.trim().is_empty() {
        EngineConfig::default()
    } else {
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    };
    config.validate()?;
    Ok(config)
}

/// Load the config file at `path`.
///
/// Returns `ConfigError::NotFound` if absent, `ConfigError::Parse` (with path)
/// if malformed, `ConfigError::Invalid` if out of range.
pub fn load_at(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    from_str_at(&contents, path)
}

/// Load from `$KWATCH_CONFIG`, or `~/.kwatch.yaml` when unset.
pub fn load() -> Result<EngineConfig, ConfigError> {
    if let Some(explicit) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return load_at(Path::new(&explicit));
    }
    let path = default_path()?;
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    load_at(&path)
}

/// `~/.kwatch.yaml`.
pub fn default_path() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_CONFIG_FILE))
        .ok_or(ConfigError::HomeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = from_str_at("", Path::new("mem")).expect("parse");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn kinds_match_case_insensitively() {
        let config = from_str_at("kinds:\n  Pod: true\n  Service: false\n", Path::new("mem"))
            .expect("parse");
        assert!(config.is_enabled(&KindTag::from("pod")));
        assert!(!config.is_enabled(&KindTag::from("service")));
        assert!(!config.is_enabled(&KindTag::from("deployment")));
        assert_eq!(config.enabled_kinds(), vec![KindTag::from("pod")]);
    }

    #[test]
    fn relist_delay_doubles_and_caps() {
        let relist = RelistConfig {
            initial_delay_ms: 100,
            max_delay_secs: 1,
            max_consecutive_failures: 3,
        };
        assert_eq!(relist.delay_for(1), Duration::from_millis(100));
        assert_eq!(relist.delay_for(2), Duration::from_millis(200));
        assert_eq!(relist.delay_for(4), Duration::from_millis(800));
        assert_eq!(relist.delay_for(5), Duration::from_secs(1));
        assert_eq!(relist.delay_for(64), Duration::from_secs(1));
    }

    #[test]
    fn namespace_scope_treats_empty_as_all() {
        let mut config = EngineConfig::default();
        assert_eq!(config.namespace_scope(), None);
        config.namespace = "prod".into();
        assert_eq!(config.namespace_scope(), Some("prod"));
    }
}
