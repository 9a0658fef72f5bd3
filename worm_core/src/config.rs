//! Typed configuration.
//!
//! Configuration is a JSON file; every field is optional and falls back to a
//! default:
//!
//! ```text
//! {
//!     "cache_dir": "/var/cache/worm",
//!     "depot": { "url": "file:///srv/depot" },
//!     "link_mode": "hardlink",
//!     "jobs": 4,
//!     "timeout_secs": 60,
//!     "retries": 2,
//!     "backoff_ms": 200,
//!     "probe": "ledger"
//! }
//! ```

use crate::depot::{DepotRegistry, DepotSpec};
use crate::error::{Error, Result};
use crate::status::ProbePolicy;
use crate::store::LinkMode;
use crate::sync::SyncOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-repository configuration file.
pub const CONFIG_FILE: &str = ".worm-config.json";

/// Settings as read from a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Local object cache; defaults to the user cache directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depot: Option<DepotSpec>,
    pub link_mode: LinkMode,
    pub jobs: usize,
    pub timeout_secs: u64,
    pub retries: u32,
    pub backoff_ms: u64,
    pub probe: ProbePolicy,
    /// Exclusion file to register anchors in, relative to the repository root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let sync = SyncOptions::default();
        Self {
            cache_dir: None,
            depot: None,
            link_mode: LinkMode::default(),
            jobs: sync.jobs,
            timeout_secs: sync.timeout.as_secs(),
            retries: sync.retries,
            backoff_ms: sync.backoff.as_millis() as u64,
            probe: ProbePolicy::default(),
            exclude_file: None,
        }
    }
}

impl Config {
    /// Load and validate the configuration at `path`; a missing file gives defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::invalid_config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Write the configuration to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::invalid_config(e.to_string()))?;
        json.push(b'\n');
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            return Err(Error::invalid_config("jobs must be at least 1"));
        }
        if self.timeout_secs == 0 {
            return Err(Error::invalid_config("timeout_secs must be greater than 0"));
        }
        if let Some(depot) = &self.depot {
            depot.parts()?;
        }
        Ok(())
    }

    /// Cache directory, falling back to the user cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            jobs: self.jobs,
            timeout: Duration::from_secs(self.timeout_secs),
            retries: self.retries,
            backoff: Duration::from_millis(self.backoff_ms),
            offline: false,
        }
    }

    /// Build the configured depot client, if any.
    pub fn open_depot(
        &self,
        registry: &DepotRegistry,
    ) -> Result<Option<std::sync::Arc<dyn crate::depot::Depot>>> {
        self.depot.as_ref().map(|spec| registry.open(spec)).transpose()
    }
}

/// `worm` under the platform user cache directory, else `.worm-cache`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("worm"))
        .unwrap_or_else(|| PathBuf::from(".worm-cache"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_cache_dir_is_named_for_worm() {
        let dir = default_cache_dir();
        assert!(dir.ends_with("worm") || dir == Path::new(".worm-cache"));
        assert_eq!(Config::default().cache_dir(), dir);
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(&temp_dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.jobs, 4);
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.retries, 2);
        assert_eq!(config.backoff_ms, 200);
        assert_eq!(config.link_mode, LinkMode::Hardlink);
        assert_eq!(config.probe, ProbePolicy::Ledger);
    }

    #[test]
    fn test_load_partial() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"{"depot": {"url": "memory://t"}, "link_mode": "copy", "jobs": 8, "probe": "live"}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.jobs, 8);
        assert_eq!(config.link_mode, LinkMode::Copy);
        assert_eq!(config.probe, ProbePolicy::Live);
        assert_eq!(config.depot.as_ref().unwrap().url, "memory://t");
        assert_eq!(config.retries, 2);

        let depot = config.open_depot(&DepotRegistry::with_builtins()).unwrap();
        assert!(depot.is_some());
    }

    #[test]
    fn test_validation_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);

        for bad in [
            r#"{"jobs": 0}"#,
            r#"{"timeout_secs": 0}"#,
            r#"{"depot": {"url": "no-scheme"}}"#,
            r#"{"link_mode": "reflink"}"#,
            r#"{"unknown_field": true}"#,
            "not json",
        ] {
            fs::write(&path, bad).unwrap();
            assert!(
                matches!(Config::load(&path), Err(Error::InvalidConfig { .. })),
                "expected InvalidConfig for {}",
                bad
            );
        }
    }

    #[test]
    fn test_save_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);

        let config = Config {
            cache_dir: Some(temp_dir.path().join("cache")),
            depot: Some(DepotSpec::new("file:///srv/depot")),
            ..Config::default()
        };
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_sync_options() {
        let config = Config {
            timeout_secs: 5,
            backoff_ms: 10,
            ..Config::default()
        };
        let options = config.sync_options();
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.backoff, Duration::from_millis(10));
        assert!(!options.offline);
    }
}
