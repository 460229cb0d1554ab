//! Mock storage provider for testing.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use super::traits::{BlockDevice, StorageError, StorageProvider};
use super::volume::Volume;

/// Mock provider for unit testing volume discovery and scoring logic.
///
/// "Mounting" a volume exposes a backing directory registered alongside
/// it, so tests can populate realistic ESP layouts with plain files.
#[derive(Default)]
pub struct MockStorage {
    volumes: Mutex<Vec<Volume>>,
    backing: Mutex<HashMap<String, PathBuf>>,
    mounted: Mutex<HashMap<String, PathBuf>>,
    block_devices: Mutex<Vec<BlockDevice>>,
    block_devices_error: Mutex<Option<String>>,
    unmountable: Mutex<HashSet<String>>,
    mount_log: Mutex<Vec<String>>,
    unmount_log: Mutex<Vec<String>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a volume, optionally with the directory its mount exposes.
    pub fn add_volume(&self, volume: Volume, backing: Option<PathBuf>) {
        if let Some(dir) = backing {
            self.backing
                .lock()
                .unwrap()
                .insert(volume.id().to_string(), dir);
        }
        self.volumes.lock().unwrap().push(volume);
    }

    /// Drop all registered volumes (the cache-behavior tests mutate the
    /// underlying set between calls).
    pub fn clear_volumes(&self) {
        self.volumes.lock().unwrap().clear();
    }

    pub fn set_block_devices(&self, devices: Vec<BlockDevice>) {
        *self.block_devices.lock().unwrap() = devices;
    }

    /// Make the diagnostic probe fail with `message`.
    pub fn fail_block_devices(&self, message: &str) {
        *self.block_devices_error.lock().unwrap() = Some(message.to_string());
    }

    /// Make mounting the given volume fail.
    pub fn set_unmountable(&self, id: &str) {
        self.unmountable.lock().unwrap().insert(id.to_string());
    }

    pub fn mounts(&self) -> Vec<String> {
        self.mount_log.lock().unwrap().clone()
    }

    pub fn unmounts(&self) -> Vec<String> {
        self.unmount_log.lock().unwrap().clone()
    }
}

impl StorageProvider for MockStorage {
    fn volumes(&self) -> Result<Vec<Volume>, StorageError> {
        Ok(self.volumes.lock().unwrap().clone())
    }

    fn block_devices(&self) -> Result<Vec<BlockDevice>, StorageError> {
        if let Some(message) = self.block_devices_error.lock().unwrap().as_ref() {
            return Err(StorageError::Unavailable(message.clone()));
        }
        Ok(self.block_devices.lock().unwrap().clone())
    }

    fn mount(&self, volume: &Volume) -> Result<PathBuf, StorageError> {
        if self.unmountable.lock().unwrap().contains(volume.id()) {
            return Err(StorageError::MountFailed {
                volume: volume.id().to_string(),
                message: "simulated failure".to_string(),
            });
        }
        let backing = self.backing.lock().unwrap();
        let target = backing.get(volume.id()).cloned().ok_or_else(|| {
            StorageError::MountFailed {
                volume: volume.id().to_string(),
                message: "no backing directory".to_string(),
            }
        })?;
        self.mounted
            .lock()
            .unwrap()
            .insert(volume.id().to_string(), target.clone());
        self.mount_log.lock().unwrap().push(volume.id().to_string());
        Ok(target)
    }

    fn unmount(&self, volume: &Volume) -> Result<(), StorageError> {
        if self
            .mounted
            .lock()
            .unwrap()
            .remove(volume.id())
            .is_none()
        {
            return Err(StorageError::NotMounted(volume.id().to_string()));
        }
        self.unmount_log
            .lock()
            .unwrap()
            .push(volume.id().to_string());
        Ok(())
    }

    fn mount_point(&self, volume: &Volume) -> Option<PathBuf> {
        self.mounted.lock().unwrap().get(volume.id()).cloned()
    }
}
