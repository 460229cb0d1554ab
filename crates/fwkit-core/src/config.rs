//! Daemon configuration.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the platform core.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Preferred EFI System Partition mount path.
    pub esp_location: Option<String>,
    /// Minimum battery percentage required before applying updates.
    pub battery_threshold: Option<u32>,
    /// Skip the efivar free-space check.
    pub ignore_efivars_free_space: bool,
    /// Identity value overrides, keyed by identity key name.
    pub hwid_overrides: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::InvalidFile(format!("{}: {e}", path.as_ref().display())))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("config serialize: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from `path` if it exists, otherwise keep defaults.
    ///
    /// A file that exists but does not parse is an error; silently running
    /// with defaults instead of the administrator's settings is worse than
    /// refusing to start.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load_from_file(path),
            _ => Ok(Self::default()),
        }
    }
}
