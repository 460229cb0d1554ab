//! Storage volume model.

use std::fmt;
use std::path::{Path, PathBuf};

/// GPT partition classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKind {
    /// EFI System Partition.
    Esp,
    /// Basic Data Partition.
    Bdp,
    /// Anything else, carrying the raw GPT type GUID.
    Other(String),
    Unknown,
}

impl PartitionKind {
    /// Classify a GPT partition-type GUID.
    pub fn from_gpt_type(guid: &str) -> Self {
        match guid.to_ascii_lowercase().as_str() {
            "c12a7328-f81f-11d2-ba4b-00a0c93ec93b" => PartitionKind::Esp,
            "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7" => PartitionKind::Bdp,
            other => PartitionKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKind::Esp => write!(f, "ESP"),
            PartitionKind::Bdp => write!(f, "BDP"),
            PartitionKind::Other(guid) => write!(f, "{guid}"),
            PartitionKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// One storage volume as reported by a provider.
///
/// Volumes are deduplicated by [`Volume::id`]; everything else is
/// advisory metadata captured at enumeration time.
#[derive(Debug, Clone)]
pub struct Volume {
    id: String,
    partition_kind: PartitionKind,
    partition_uuid: Option<String>,
    fs_type: Option<String>,
    size: u64,
    removable: bool,
    mount_point: Option<PathBuf>,
}

impl Volume {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partition_kind: PartitionKind::Unknown,
            partition_uuid: None,
            fs_type: None,
            size: 0,
            removable: false,
            mount_point: None,
        }
    }

    /// Synthetic volume representing an already-mounted directory.
    pub fn new_from_mount_path(path: &Path) -> Self {
        let mut volume = Self::new(path.display().to_string());
        volume.mount_point = Some(path.to_path_buf());
        volume
    }

    /// Stable volume identifier, e.g. the device node path.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn partition_kind(&self) -> &PartitionKind {
        &self.partition_kind
    }

    pub fn set_partition_kind(&mut self, kind: PartitionKind) {
        self.partition_kind = kind;
    }

    pub fn partition_uuid(&self) -> Option<&str> {
        self.partition_uuid.as_deref()
    }

    pub fn set_partition_uuid(&mut self, uuid: impl Into<String>) {
        self.partition_uuid = Some(uuid.into());
    }

    /// Filesystem type, e.g. `vfat`.
    pub fn fs_type(&self) -> Option<&str> {
        self.fs_type.as_deref()
    }

    pub fn set_fs_type(&mut self, fs_type: impl Into<String>) {
        self.fs_type = Some(fs_type.into());
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn set_removable(&mut self, removable: bool) {
        self.removable = removable;
    }

    /// Whether the volume sits on fixed internal storage.
    pub fn is_internal(&self) -> bool {
        !self.removable
    }

    /// Mount point recorded at enumeration, if any.
    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    pub fn set_mount_point(&mut self, path: Option<PathBuf>) {
        self.mount_point = path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpt_type_classification() {
        assert_eq!(
            PartitionKind::from_gpt_type("C12A7328-F81F-11D2-BA4B-00A0C93EC93B"),
            PartitionKind::Esp
        );
        assert_eq!(
            PartitionKind::from_gpt_type("ebd0a0a2-b9e5-4433-87c0-68b6b72699c7"),
            PartitionKind::Bdp
        );
        assert!(matches!(
            PartitionKind::from_gpt_type("0fc63daf-8483-4772-8e79-3d69d8477de4"),
            PartitionKind::Other(_)
        ));
    }

    #[test]
    fn test_synthetic_volume_is_mounted() {
        let volume = Volume::new_from_mount_path(Path::new("/tmp/esp"));
        assert_eq!(volume.mount_point(), Some(Path::new("/tmp/esp")));
        assert!(volume.is_internal());
    }
}
