//! BIOS setting attributes.
//!
//! Mirrors the kernel firmware-attributes class: a read-mostly snapshot of
//! the settings the platform exposes, refreshed on demand.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct BiosSetting {
    pub name: String,
    pub current_value: String,
    pub possible_values: Vec<String>,
    pub read_only: bool,
}

#[derive(Debug)]
pub struct BiosSettings {
    root: PathBuf,
    attrs: BTreeMap<String, BiosSetting>,
}

impl Default for BiosSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl BiosSettings {
    pub fn new() -> Self {
        Self::with_root(PathBuf::from("/sys/class/firmware-attributes"))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            attrs: BTreeMap::new(),
        }
    }

    /// Rebuild the snapshot from sysfs. A machine without the class
    /// directory simply ends up with no settings.
    pub fn setup(&mut self) -> Result<()> {
        self.attrs.clear();
        if !self.root.is_dir() {
            return Ok(());
        }
        for driver in std::fs::read_dir(&self.root)? {
            let driver = driver?;
            let attr_dir = driver.path().join("attributes");
            if !attr_dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&attr_dir)? {
                let entry = entry?;
                if !entry.path().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == "pending_reboot" {
                    continue;
                }
                if let Some(setting) = read_setting(&entry.path(), &name) {
                    self.attrs.insert(name, setting);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&BiosSetting> {
        self.attrs.get(name)
    }

    pub fn settings(&self) -> impl Iterator<Item = &BiosSetting> {
        self.attrs.values()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Whether any setting change is waiting for the next boot.
    pub fn pending_reboot(&self) -> bool {
        let Ok(drivers) = std::fs::read_dir(&self.root) else {
            return false;
        };
        for driver in drivers.flatten() {
            let path = driver.path().join("attributes/pending_reboot");
            if let Ok(value) = std::fs::read_to_string(path) {
                if value.trim() == "1" {
                    return true;
                }
            }
        }
        false
    }
}

fn read_setting(dir: &Path, name: &str) -> Option<BiosSetting> {
    let current_value = std::fs::read_to_string(dir.join("current_value"))
        .ok()?
        .trim()
        .to_string();
    let possible_values = std::fs::read_to_string(dir.join("possible_values"))
        .map(|v| {
            v.trim()
                .split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let kind = std::fs::read_to_string(dir.join("type")).unwrap_or_default();
    Some(BiosSetting {
        name: name.to_string(),
        current_value,
        possible_values,
        read_only: kind.trim() == "read-only",
    })
}
