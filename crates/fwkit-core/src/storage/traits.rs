//! Storage provider abstraction.
//!
//! This trait enables:
//! - Production implementation backed by lsblk and mount(2)
//! - Mock implementation for unit testing
//! - Future alternative backends (e.g. a disk-manager service)

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use super::volume::{PartitionKind, Volume};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("block device subsystem unavailable: {0}")]
    Unavailable(String),

    #[error("failed to mount {volume}: {message}")]
    MountFailed { volume: String, message: String },

    #[error("failed to unmount {volume}: {message}")]
    UnmountFailed { volume: String, message: String },

    #[error("volume {0} is not mounted")]
    NotMounted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A raw block device, as reported by the diagnostic probe.
#[derive(Debug, Clone, Default)]
pub struct BlockDevice {
    pub name: String,
    /// Filesystem or container signature, e.g. `crypto_LUKS` or `BitLocker`.
    pub id_type: Option<String>,
    pub label: Option<String>,
}

/// Abstract storage enumeration and mounting interface.
pub trait StorageProvider: Send + Sync {
    /// Enumerate all known volumes.
    fn volumes(&self) -> Result<Vec<Volume>, StorageError>;

    /// List raw block devices. Used as a cheap diagnostic probe to tell
    /// "no storage subsystem" apart from "no matching volume", and to
    /// sniff full-disk-encryption markers.
    fn block_devices(&self) -> Result<Vec<BlockDevice>, StorageError>;

    /// Mount a volume and return where it landed.
    fn mount(&self, volume: &Volume) -> Result<PathBuf, StorageError>;

    /// Unmount a volume previously mounted by this provider.
    fn unmount(&self, volume: &Volume) -> Result<(), StorageError>;

    /// Where the volume is currently mounted, if anywhere.
    fn mount_point(&self, volume: &Volume) -> Option<PathBuf>;

    /// Volumes filtered by partition kind.
    fn volumes_by_kind(&self, kind: &PartitionKind) -> Result<Vec<Volume>, StorageError> {
        Ok(self
            .volumes()?
            .into_iter()
            .filter(|v| v.partition_kind() == kind)
            .collect())
    }
}

/// Scoped mount: acquired for inspection, released on every exit path.
///
/// If the volume was already mounted when acquired, the guard borrows the
/// existing mount and does not unmount on drop.
pub struct MountGuard<'a> {
    provider: &'a dyn StorageProvider,
    volume: Volume,
    mount_point: PathBuf,
    owned: bool,
}

impl<'a> MountGuard<'a> {
    pub fn acquire(
        provider: &'a dyn StorageProvider,
        volume: &Volume,
    ) -> Result<Self, StorageError> {
        if let Some(mount_point) = provider
            .mount_point(volume)
            .or_else(|| volume.mount_point().map(Path::to_path_buf))
        {
            return Ok(Self {
                provider,
                volume: volume.clone(),
                mount_point,
                owned: false,
            });
        }
        let mount_point = provider.mount(volume)?;
        Ok(Self {
            provider,
            volume: volume.clone(),
            mount_point,
            owned: true,
        })
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(e) = self.provider.unmount(&self.volume) {
            warn!(volume = %self.volume.id(), error = %e, "failed to unmount");
        }
    }
}
