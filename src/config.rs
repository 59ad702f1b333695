use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::constants::{DEFAULT_DEADLINE_SECONDS, DEFAULT_MIN_PARTICIPANTS, DEFAULT_RESPONSE_MAX};

/// Runtime settings for a network. Loaded from `conf.toml` under the home
/// directory, overridable through `TALLYNET_`-prefixed environment
/// variables; `Settings::ephemeral()` keeps every store in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Home directory for the registry and per-node stores. `None` means
    /// everything lives in memory and dies with the process.
    pub home: Option<PathBuf>,
    /// Default deadline applied when a proposal does not carry one.
    pub default_deadline_seconds: u64,
    /// Default minimum-participant threshold.
    pub default_min_participants: usize,
    /// Upper bound (inclusive) for the reference response policy.
    pub response_max: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            home: None,
            default_deadline_seconds: DEFAULT_DEADLINE_SECONDS,
            default_min_participants: DEFAULT_MIN_PARTICIPANTS,
            response_max: DEFAULT_RESPONSE_MAX,
        }
    }
}

impl Settings {
    /// In-memory settings: no home directory, library defaults.
    pub fn ephemeral() -> Self {
        Settings::default()
    }

    /// Load settings rooted at `home`, creating the directory and a default
    /// `conf.toml` on first use.
    pub fn load(home: &str) -> Result<Self, ConfigError> {
        let home_path = PathBuf::from(home);
        if !home_path.exists() {
            fs::create_dir_all(&home_path)
                .map_err(|e| ConfigError::Foreign(Box::new(e)))?;
        }
        let home_path = home_path
            .canonicalize()
            .map_err(|e| ConfigError::Foreign(Box::new(e)))?;

        let conf_file = home_path.join("conf.toml");
        if !conf_file.exists() {
            let defaults = Settings {
                home: Some(home_path.clone()),
                ..Settings::default()
            };
            let toml = toml::to_string_pretty(&defaults)
                .map_err(|e| ConfigError::Foreign(Box::new(e)))?;
            fs::write(&conf_file, toml).map_err(|e| ConfigError::Foreign(Box::new(e)))?;
        }
        debug!("loading settings from {conf_file:?}");

        let settings = Config::builder()
            .add_source(config::File::from(conf_file))
            // e.g. `TALLYNET_RESPONSE_MAX=1000 tallynet demo`
            .add_source(config::Environment::with_prefix("TALLYNET"))
            .build()?;
        let mut settings: Settings = settings.try_deserialize()?;
        settings.home.get_or_insert(home_path);
        Ok(settings)
    }

    pub(crate) fn registry_path(&self) -> Option<PathBuf> {
        self.home.as_ref().map(|h| h.join("registry"))
    }

    pub(crate) fn node_store_root(&self) -> Option<PathBuf> {
        self.home.as_ref().map(|h| h.join("nodes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_defaults() {
        let settings = Settings::ephemeral();
        assert!(settings.home.is_none());
        assert!(settings.registry_path().is_none());
        assert_eq!(settings.default_min_participants, 1);
        assert!(settings.default_deadline_seconds > 0);
    }

    #[test]
    fn load_bootstraps_a_conf_file() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("tallynet-home");
        let settings = Settings::load(home.to_str().unwrap()).unwrap();
        assert!(home.join("conf.toml").exists());
        assert!(settings.home.is_some());
        assert_eq!(settings.response_max, DEFAULT_RESPONSE_MAX);

        // Second load round-trips the file it wrote.
        let reloaded = Settings::load(home.to_str().unwrap()).unwrap();
        assert_eq!(reloaded.default_deadline_seconds, settings.default_deadline_seconds);
    }
}
