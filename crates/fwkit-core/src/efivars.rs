//! EFI variable access and boot-manager entries.
//!
//! The store trait has two implementations: the real efivarfs reader and
//! an in-memory dummy selected with `FWKIT_EFIVARS=dummy` so integration
//! tests never touch NVRAM.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// The EFI global variable namespace.
pub const EFI_GLOBAL_GUID: &str = "8be4df61-93ca-11d2-aa0d-00e098032b8c";

const DEVICE_PATH_TYPE_MEDIA: u8 = 0x04;
const DEVICE_PATH_SUBTYPE_HARD_DRIVE: u8 = 0x01;
const DEVICE_PATH_SUBTYPE_FILE_PATH: u8 = 0x04;
const DEVICE_PATH_TYPE_END: u8 = 0x7f;
const SIGNATURE_TYPE_GUID: u8 = 0x02;

/// The hard-drive node of a load option's device path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardDriveDevicePath {
    pub partition_number: u32,
    pub partition_start: u64,
    pub partition_size: u64,
    pub signature: [u8; 16],
    pub format: u8,
    pub signature_type: u8,
}

impl HardDriveDevicePath {
    /// The partition GUID, when the signature is GPT-style.
    pub fn partition_uuid(&self) -> Option<String> {
        if self.signature_type != SIGNATURE_TYPE_GUID {
            return None;
        }
        Some(Uuid::from_bytes_le(self.signature).to_string())
    }

    /// Whether two descriptors refer to the same partition.
    pub fn matches(&self, other: &HardDriveDevicePath) -> bool {
        self.partition_number == other.partition_number && self.signature == other.signature
    }
}

/// One node of a device path list.
#[derive(Debug, Clone)]
pub enum DevicePath {
    HardDrive(HardDriveDevicePath),
    /// Path on the volume, in EFI backslash notation.
    FilePath(String),
    Other { kind: u8, subtype: u8 },
}

/// A parsed `Boot####` load option.
#[derive(Debug, Clone)]
pub struct LoadOption {
    pub id: u16,
    pub attributes: u32,
    pub description: String,
    pub device_paths: Vec<DevicePath>,
    pub optional_data: Vec<u8>,
}

impl LoadOption {
    /// Parse the binary EFI_LOAD_OPTION layout.
    pub fn parse(id: u16, data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let attributes = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidFile(format!("Boot{id:04X}: too small")))?;
        let dp_list_length = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidFile(format!("Boot{id:04X}: too small")))?
            as usize;

        // description: NUL-terminated UTF-16LE
        let mut description_units = Vec::new();
        loop {
            let unit = cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| Error::InvalidFile(format!("Boot{id:04X}: unterminated description")))?;
            if unit == 0 {
                break;
            }
            description_units.push(unit);
        }
        let description = String::from_utf16_lossy(&description_units);

        let dp_start = cursor.position() as usize;
        let dp_end = dp_start + dp_list_length;
        if dp_end > data.len() {
            return Err(Error::InvalidFile(format!(
                "Boot{id:04X}: device path list overruns variable"
            )));
        }
        let device_paths = parse_device_paths(id, &data[dp_start..dp_end])?;
        let optional_data = data[dp_end..].to_vec();

        Ok(Self {
            id,
            attributes,
            description,
            device_paths,
            optional_data,
        })
    }

    pub fn hard_drive(&self) -> Option<&HardDriveDevicePath> {
        self.device_paths.iter().find_map(|dp| match dp {
            DevicePath::HardDrive(hdd) => Some(hdd),
            _ => None,
        })
    }

    /// The file path node, converted to forward slashes without the
    /// leading separator.
    pub fn file_path(&self) -> Option<String> {
        self.device_paths.iter().find_map(|dp| match dp {
            DevicePath::FilePath(path) => {
                Some(path.replace('\\', "/").trim_start_matches('/').to_string())
            }
            _ => None,
        })
    }

    /// A `path=` hint in the optional data, when present.
    pub fn metadata_path(&self) -> Option<String> {
        let text = std::str::from_utf8(&self.optional_data).ok()?;
        for pair in text.trim_end_matches('\0').split(',') {
            if let Some(value) = pair.strip_prefix("path=") {
                return Some(value.to_string());
            }
        }
        None
    }
}

fn parse_device_paths(id: u16, mut data: &[u8]) -> Result<Vec<DevicePath>> {
    let mut paths = Vec::new();
    while data.len() >= 4 {
        let kind = data[0];
        let subtype = data[1];
        let length = u16::from_le_bytes([data[2], data[3]]) as usize;
        if length < 4 || length > data.len() {
            return Err(Error::InvalidFile(format!(
                "Boot{id:04X}: device path node length {length} invalid"
            )));
        }
        let node = &data[4..length];
        match (kind, subtype) {
            (DEVICE_PATH_TYPE_END, _) => break,
            (DEVICE_PATH_TYPE_MEDIA, DEVICE_PATH_SUBTYPE_HARD_DRIVE) => {
                if node.len() < 38 {
                    return Err(Error::InvalidFile(format!(
                        "Boot{id:04X}: short hard drive node"
                    )));
                }
                let mut cursor = Cursor::new(node);
                let partition_number = cursor.read_u32::<LittleEndian>()?;
                let partition_start = cursor.read_u64::<LittleEndian>()?;
                let partition_size = cursor.read_u64::<LittleEndian>()?;
                let mut signature = [0u8; 16];
                signature.copy_from_slice(&node[20..36]);
                paths.push(DevicePath::HardDrive(HardDriveDevicePath {
                    partition_number,
                    partition_start,
                    partition_size,
                    signature,
                    format: node[36],
                    signature_type: node[37],
                }));
            }
            (DEVICE_PATH_TYPE_MEDIA, DEVICE_PATH_SUBTYPE_FILE_PATH) => {
                let units: Vec<u16> = node
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .take_while(|u| *u != 0)
                    .collect();
                paths.push(DevicePath::FilePath(String::from_utf16_lossy(&units)));
            }
            (kind, subtype) => {
                paths.push(DevicePath::Other { kind, subtype });
            }
        }
        data = &data[length..];
    }
    Ok(paths)
}

/// Abstract EFI variable store.
pub trait EfivarStore: Send + Sync {
    /// Raw variable payload, attributes stripped.
    fn get_data(&self, guid: &str, name: &str) -> Result<Vec<u8>>;

    fn set_data(&self, guid: &str, name: &str, data: &[u8]) -> Result<()>;

    fn exists(&self, guid: &str, name: &str) -> bool;

    /// Free space in the variable store, in bytes.
    fn space_free(&self) -> Result<u64>;

    /// The `BootOrder` id list.
    fn boot_order(&self) -> Result<Vec<u16>> {
        let data = self.get_data(EFI_GLOBAL_GUID, "BootOrder")?;
        Ok(data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    /// Parsed load options for every entry in `BootOrder`.
    ///
    /// A missing or unparseable entry is skipped with a debug note; a
    /// stale BootOrder should not break asset collection for the healthy
    /// entries.
    fn boot_entries(&self) -> Result<Vec<LoadOption>> {
        let mut entries = Vec::new();
        for id in self.boot_order()? {
            let name = format!("Boot{id:04X}");
            let data = match self.get_data(EFI_GLOBAL_GUID, &name) {
                Ok(data) => data,
                Err(e) => {
                    debug!(name = %name, error = %e, "skipping boot entry");
                    continue;
                }
            };
            match LoadOption::parse(id, &data) {
                Ok(entry) => entries.push(entry),
                Err(e) => debug!(name = %name, error = %e, "skipping unparseable boot entry"),
            }
        }
        Ok(entries)
    }
}

/// Real store reading efivarfs.
pub struct SystemEfivars {
    root: PathBuf,
}

impl SystemEfivars {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/sys/firmware/efi/efivars"),
        }
    }

    fn path(&self, guid: &str, name: &str) -> PathBuf {
        self.root.join(format!("{name}-{guid}"))
    }
}

impl Default for SystemEfivars {
    fn default() -> Self {
        Self::new()
    }
}

impl EfivarStore for SystemEfivars {
    fn get_data(&self, guid: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.path(guid, name);
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("{name}-{guid}"))
            } else {
                Error::Io(e)
            }
        })?;
        // efivarfs prefixes the payload with a 4-byte attribute word
        if data.len() < 4 {
            return Err(Error::InvalidFile(format!("{name}-{guid}: too small")));
        }
        Ok(data[4..].to_vec())
    }

    fn set_data(&self, guid: &str, name: &str, data: &[u8]) -> Result<()> {
        // non-volatile + boot-service + runtime access
        let mut payload = 0x7u32.to_le_bytes().to_vec();
        payload.extend_from_slice(data);
        std::fs::write(self.path(guid, name), payload)?;
        Ok(())
    }

    fn exists(&self, guid: &str, name: &str) -> bool {
        self.path(guid, name).exists()
    }

    fn space_free(&self) -> Result<u64> {
        if !self.root.is_dir() {
            return Err(Error::NotSupported("no efivarfs mounted".to_string()));
        }
        // efivarfs has no statfs-visible quota; assume the conventional
        // 64KiB store minus what the variables already occupy
        let mut used = 0u64;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            used += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
        Ok(0x10000u64.saturating_sub(used))
    }
}

/// In-memory store for tests and development.
#[derive(Default)]
pub struct DummyEfivars {
    vars: Mutex<HashMap<(String, String), Vec<u8>>>,
    space_free: Mutex<u64>,
}

impl DummyEfivars {
    pub fn new() -> Self {
        Self {
            vars: Mutex::new(HashMap::new()),
            space_free: Mutex::new(0x10000),
        }
    }

    pub fn set_space_free(&self, bytes: u64) {
        *self.space_free.lock().unwrap() = bytes;
    }
}

impl EfivarStore for DummyEfivars {
    fn get_data(&self, guid: &str, name: &str) -> Result<Vec<u8>> {
        self.vars
            .lock()
            .unwrap()
            .get(&(guid.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{name}-{guid}")))
    }

    fn set_data(&self, guid: &str, name: &str, data: &[u8]) -> Result<()> {
        self.vars
            .lock()
            .unwrap()
            .insert((guid.to_string(), name.to_string()), data.to_vec());
        Ok(())
    }

    fn exists(&self, guid: &str, name: &str) -> bool {
        self.vars
            .lock()
            .unwrap()
            .contains_key(&(guid.to_string(), name.to_string()))
    }

    fn space_free(&self) -> Result<u64> {
        Ok(*self.space_free.lock().unwrap())
    }
}

/// Pick the store implementation, honoring the `FWKIT_EFIVARS=dummy`
/// development override.
pub fn store_from_env() -> Box<dyn EfivarStore> {
    if std::env::var("FWKIT_EFIVARS").as_deref() == Ok("dummy") {
        Box::new(DummyEfivars::new())
    } else {
        Box::new(SystemEfivars::new())
    }
}
