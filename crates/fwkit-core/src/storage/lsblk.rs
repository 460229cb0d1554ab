//! System storage provider backed by lsblk and mount(2).

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::debug;

use super::traits::{BlockDevice, StorageError, StorageProvider};
use super::volume::{PartitionKind, Volume};

const LSBLK_COLUMNS: &str = "NAME,PATH,SIZE,FSTYPE,PARTTYPE,PARTUUID,MOUNTPOINT,RM,TYPE,LABEL";

#[derive(Debug, Deserialize)]
struct LsblkReport {
    blockdevices: Vec<LsblkNode>,
}

#[derive(Debug, Deserialize)]
struct LsblkNode {
    name: String,
    path: Option<String>,
    size: Option<u64>,
    fstype: Option<String>,
    parttype: Option<String>,
    partuuid: Option<String>,
    mountpoint: Option<String>,
    rm: Option<bool>,
    #[serde(rename = "type")]
    kind: Option<String>,
    label: Option<String>,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

/// Block-device provider using the util-linux `lsblk` tool for
/// enumeration and direct mount(2) calls for scoped inspection mounts.
pub struct SystemStorage {
    mount_root: PathBuf,
}

impl SystemStorage {
    pub fn new() -> Self {
        Self {
            mount_root: PathBuf::from("/run/fwkit/mnt"),
        }
    }

    fn run_lsblk(&self) -> Result<LsblkReport, StorageError> {
        let output = Command::new("lsblk")
            .args(["--json", "--bytes", "--output", LSBLK_COLUMNS])
            .output()
            .map_err(|e| StorageError::Unavailable(format!("cannot run lsblk: {e}")))?;
        if !output.status.success() {
            return Err(StorageError::Unavailable(format!(
                "lsblk failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| StorageError::Unavailable(format!("cannot parse lsblk output: {e}")))
    }

    fn mount_target(&self, volume: &Volume) -> PathBuf {
        let leaf = Path::new(volume.id())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "volume".to_string());
        self.mount_root.join(leaf)
    }
}

impl Default for SystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn node_to_volume(node: &LsblkNode) -> Volume {
    let path = node.path.clone().unwrap_or_else(|| format!("/dev/{}", node.name));
    let mut volume = Volume::new(path);
    if let Some(parttype) = &node.parttype {
        volume.set_partition_kind(PartitionKind::from_gpt_type(parttype));
    }
    if let Some(partuuid) = &node.partuuid {
        volume.set_partition_uuid(partuuid.clone());
    }
    if let Some(fstype) = &node.fstype {
        volume.set_fs_type(fstype.clone());
    }
    volume.set_size(node.size.unwrap_or(0));
    volume.set_removable(node.rm.unwrap_or(false));
    volume.set_mount_point(node.mountpoint.clone().map(PathBuf::from));
    volume
}

fn collect_partitions(nodes: &[LsblkNode], removable_parent: bool, out: &mut Vec<Volume>) {
    for node in nodes {
        let removable = node.rm.unwrap_or(removable_parent);
        if node.kind.as_deref() == Some("part") {
            let mut volume = node_to_volume(node);
            volume.set_removable(removable);
            out.push(volume);
        }
        collect_partitions(&node.children, removable, out);
    }
}

impl StorageProvider for SystemStorage {
    fn volumes(&self) -> Result<Vec<Volume>, StorageError> {
        let report = self.run_lsblk()?;
        let mut volumes = Vec::new();
        collect_partitions(&report.blockdevices, false, &mut volumes);
        debug!(count = volumes.len(), "enumerated partitions");
        Ok(volumes)
    }

    fn block_devices(&self) -> Result<Vec<BlockDevice>, StorageError> {
        let report = self.run_lsblk()?;
        fn walk(nodes: &[LsblkNode], out: &mut Vec<BlockDevice>) {
            for node in nodes {
                out.push(BlockDevice {
                    name: node.name.clone(),
                    id_type: node.fstype.clone(),
                    label: node.label.clone(),
                });
                walk(&node.children, out);
            }
        }
        let mut devices = Vec::new();
        walk(&report.blockdevices, &mut devices);
        Ok(devices)
    }

    #[cfg(target_os = "linux")]
    fn mount(&self, volume: &Volume) -> Result<PathBuf, StorageError> {
        let target = self.mount_target(volume);
        std::fs::create_dir_all(&target)?;
        let fs_type = volume.fs_type().unwrap_or("vfat");
        nix::mount::mount(
            Some(Path::new(volume.id())),
            &target,
            Some(fs_type),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| StorageError::MountFailed {
            volume: volume.id().to_string(),
            message: e.to_string(),
        })?;
        debug!(volume = %volume.id(), target = %target.display(), "mounted");
        Ok(target)
    }

    #[cfg(not(target_os = "linux"))]
    fn mount(&self, volume: &Volume) -> Result<PathBuf, StorageError> {
        Err(StorageError::MountFailed {
            volume: volume.id().to_string(),
            message: "mounting not supported on this platform".to_string(),
        })
    }

    #[cfg(target_os = "linux")]
    fn unmount(&self, volume: &Volume) -> Result<(), StorageError> {
        let target = self.mount_target(volume);
        nix::mount::umount(&target).map_err(|e| StorageError::UnmountFailed {
            volume: volume.id().to_string(),
            message: e.to_string(),
        })?;
        let _ = std::fs::remove_dir(&target);
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn unmount(&self, volume: &Volume) -> Result<(), StorageError> {
        Err(StorageError::UnmountFailed {
            volume: volume.id().to_string(),
            message: "mounting not supported on this platform".to_string(),
        })
    }

    fn mount_point(&self, volume: &Volume) -> Option<PathBuf> {
        let mounts = std::fs::read_to_string("/proc/self/mounts").ok()?;
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            if source == volume.id() {
                // mount(8) escapes spaces as octal in this file
                return Some(PathBuf::from(target.replace("\\040", " ")));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsblk_report() {
        let json = r#"{
            "blockdevices": [
                {"name": "sda", "path": "/dev/sda", "size": 512110190592, "fstype": null,
                 "parttype": null, "partuuid": null, "mountpoint": null, "rm": false,
                 "type": "disk", "label": null, "children": [
                    {"name": "sda1", "path": "/dev/sda1", "size": 536870912, "fstype": "vfat",
                     "parttype": "c12a7328-f81f-11d2-ba4b-00a0c93ec93b",
                     "partuuid": "af3dd4c2-53a5-42b3-9a9f-ea861a0a43c4",
                     "mountpoint": "/boot/efi", "rm": false, "type": "part", "label": null},
                    {"name": "sda2", "path": "/dev/sda2", "size": 511561375744, "fstype": "ext4",
                     "parttype": "0fc63daf-8483-4772-8e79-3d69d8477de4", "partuuid": null,
                     "mountpoint": "/", "rm": false, "type": "part", "label": null}
                 ]}
            ]
        }"#;
        let report: LsblkReport = serde_json::from_str(json).unwrap();
        let mut volumes = Vec::new();
        collect_partitions(&report.blockdevices, false, &mut volumes);
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].id(), "/dev/sda1");
        assert_eq!(volumes[0].partition_kind(), &PartitionKind::Esp);
        assert_eq!(volumes[0].fs_type(), Some("vfat"));
        assert_eq!(volumes[0].mount_point(), Some(Path::new("/boot/efi")));
        assert!(volumes[1].is_internal());
    }

    #[test]
    fn test_removable_inherited_from_parent() {
        let json = r#"{
            "blockdevices": [
                {"name": "sdb", "path": "/dev/sdb", "size": 0, "fstype": null, "parttype": null,
                 "partuuid": null, "mountpoint": null, "rm": true, "type": "disk", "label": null,
                 "children": [
                    {"name": "sdb1", "path": "/dev/sdb1", "size": 0, "fstype": "vfat",
                     "parttype": "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7", "partuuid": null,
                     "mountpoint": null, "type": "part", "label": null}
                 ]}
            ]
        }"#;
        let report: LsblkReport = serde_json::from_str(json).unwrap();
        let mut volumes = Vec::new();
        collect_partitions(&report.blockdevices, false, &mut volumes);
        assert_eq!(volumes.len(), 1);
        assert!(!volumes[0].is_internal());
    }
}
