//! Quirk database: configuration overlays keyed by hardware GUID.
//!
//! Quirks are loaded from layered TOML sources, one table per GUID. Later
//! sources override earlier ones for the same (GUID, key). Values are
//! opaque strings; multi-valued keys are declared comma-separated and the
//! consumer is responsible for splitting.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::guid;

/// Provenance of a quirk entry, for precedence and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuirkSource {
    /// Shipped with the daemon.
    Builtin,
    /// Local administrator override.
    User,
}

impl fmt::Display for QuirkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuirkSource::Builtin => write!(f, "builtin"),
            QuirkSource::User => write!(f, "user"),
        }
    }
}

#[derive(Debug, Clone)]
struct QuirkValue {
    value: String,
    source: QuirkSource,
}

/// The quirk overlay store.
///
/// Keys must be registered with [`QuirkStore::add_possible_key`] before
/// load; unregistered keys found in a source are rejected with a warning so
/// typos are not silently ignored.
#[derive(Default)]
pub struct QuirkStore {
    possible_keys: HashSet<String>,
    entries: BTreeMap<String, BTreeMap<String, QuirkValue>>,
}

impl QuirkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key as legal.
    pub fn add_possible_key(&mut self, key: &str) {
        self.possible_keys.insert(key.to_string());
    }

    pub fn is_possible_key(&self, key: &str) -> bool {
        self.possible_keys.contains(key)
    }

    /// Exact-match lookup of one key for one GUID.
    pub fn lookup_by_id(&self, guid: &str, key: &str) -> Option<&str> {
        self.entries
            .get(&guid.to_ascii_lowercase())
            .and_then(|keys| keys.get(key))
            .map(|entry| entry.value.as_str())
    }

    /// Invoke `callback` once per matching (key, value, source) tuple.
    ///
    /// With `key` as `None` all keys stored for the GUID are visited.
    /// Returns whether any match fired.
    pub fn lookup_by_id_iter<F>(&self, guid: &str, key: Option<&str>, mut callback: F) -> bool
    where
        F: FnMut(&str, &str, QuirkSource),
    {
        let Some(keys) = self.entries.get(&guid.to_ascii_lowercase()) else {
            return false;
        };
        let mut matched = false;
        match key {
            Some(key) => {
                if let Some(entry) = keys.get(key) {
                    callback(key, &entry.value, entry.source);
                    matched = true;
                }
            }
            None => {
                for (key, entry) in keys {
                    callback(key, &entry.value, entry.source);
                    matched = true;
                }
            }
        }
        matched
    }

    /// Rebuild the store from layered sources, lowest precedence first.
    ///
    /// Each source is a directory of `*.quirk` TOML files applied in file
    /// name order. A missing directory contributes nothing. A file that
    /// fails to parse is skipped with a warning; the load carries on so a
    /// bad override can never take the update machinery down.
    pub fn load(&mut self, layers: &[(PathBuf, QuirkSource)]) -> Result<()> {
        self.entries.clear();
        for (dir, source) in layers {
            if !dir.is_dir() {
                debug!(dir = %dir.display(), "no quirk directory");
                continue;
            }
            let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "quirk"))
                .collect();
            files.sort();
            for file in files {
                if let Err(e) = self.load_file(&file, *source) {
                    warn!(file = %file.display(), error = %e, "skipping quirk file");
                }
            }
        }
        Ok(())
    }

    fn load_file(&mut self, path: &Path, source: QuirkSource) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let table: toml::Table = content
            .parse()
            .map_err(|e| Error::InvalidFile(format!("{}: {e}", path.display())))?;
        for (id, value) in table {
            let toml::Value::Table(keys) = value else {
                warn!(id = %id, "quirk entry is not a table");
                continue;
            };
            // table headers may be raw instance strings
            let guid = if guid::is_guid(&id) {
                id.to_ascii_lowercase()
            } else {
                guid::from_string(&id)
            };
            for (key, value) in keys {
                let toml::Value::String(value) = value else {
                    warn!(guid = %guid, key = %key, "quirk value is not a string");
                    continue;
                };
                if !self.possible_keys.contains(&key) {
                    warn!(key = %key, file = %path.display(), "unknown quirk key");
                    continue;
                }
                self.entries
                    .entry(guid.clone())
                    .or_default()
                    .insert(key, QuirkValue { value, source });
            }
        }
        Ok(())
    }

    /// Number of GUIDs with at least one entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_keys(keys: &[&str]) -> QuirkStore {
        let mut store = QuirkStore::new();
        for key in keys {
            store.add_possible_key(key);
        }
        store
    }

    fn write_quirk(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_later_source_wins() {
        let builtin = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        let guid = "059eb22d-6dc7-59af-abd3-94bbe017f67c";
        write_quirk(
            builtin.path(),
            "a.quirk",
            &format!("[\"{guid}\"]\nFlags = \"1\"\n"),
        );
        write_quirk(
            user.path(),
            "b.quirk",
            &format!("[\"{guid}\"]\nFlags = \"2\"\n"),
        );

        let mut store = store_with_keys(&["Flags"]);
        store
            .load(&[
                (builtin.path().to_path_buf(), QuirkSource::Builtin),
                (user.path().to_path_buf(), QuirkSource::User),
            ])
            .unwrap();
        assert_eq!(store.lookup_by_id(guid, "Flags"), Some("2"));
    }

    #[test]
    fn test_instance_string_header_is_hashed() {
        let dir = tempfile::tempdir().unwrap();
        write_quirk(
            dir.path(),
            "usb.quirk",
            "[\"USB\\\\VID_0A5C&PID_6412\"]\nName = \"hub\"\n",
        );
        let mut store = store_with_keys(&["Name"]);
        store
            .load(&[(dir.path().to_path_buf(), QuirkSource::Builtin)])
            .unwrap();
        let guid = crate::guid::from_string("USB\\VID_0A5C&PID_6412");
        assert_eq!(store.lookup_by_id(&guid, "Name"), Some("hub"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let guid = "059eb22d-6dc7-59af-abd3-94bbe017f67c";
        write_quirk(
            dir.path(),
            "a.quirk",
            &format!("[\"{guid}\"]\nNoSuchKey = \"1\"\n"),
        );
        let mut store = store_with_keys(&["Flags"]);
        store
            .load(&[(dir.path().to_path_buf(), QuirkSource::Builtin)])
            .unwrap();
        assert_eq!(store.lookup_by_id(guid, "NoSuchKey"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_iter_all_keys() {
        let dir = tempfile::tempdir().unwrap();
        let guid = "059eb22d-6dc7-59af-abd3-94bbe017f67c";
        write_quirk(
            dir.path(),
            "a.quirk",
            &format!("[\"{guid}\"]\nFlags = \"a,b\"\nName = \"x\"\n"),
        );
        let mut store = store_with_keys(&["Flags", "Name"]);
        store
            .load(&[(dir.path().to_path_buf(), QuirkSource::Builtin)])
            .unwrap();

        let mut seen = Vec::new();
        let matched = store.lookup_by_id_iter(guid, None, |key, value, source| {
            seen.push((key.to_string(), value.to_string(), source));
        });
        assert!(matched);
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, _, s)| *s == QuirkSource::Builtin));

        assert!(!store.lookup_by_id_iter("00000000-0000-0000-0000-000000000000", None, |_, _, _| {}));
    }

    #[test]
    fn test_bad_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let guid = "059eb22d-6dc7-59af-abd3-94bbe017f67c";
        write_quirk(dir.path(), "a.quirk", "not toml [");
        write_quirk(
            dir.path(),
            "b.quirk",
            &format!("[\"{guid}\"]\nFlags = \"ok\"\n"),
        );
        let mut store = store_with_keys(&["Flags"]);
        store
            .load(&[(dir.path().to_path_buf(), QuirkSource::Builtin)])
            .unwrap();
        assert_eq!(store.lookup_by_id(guid, "Flags"), Some("ok"));
    }
}
