//! SMBIOS table reader.
//!
//! Reads the DMI structure table the kernel exports under
//! `/sys/firmware/dmi/tables` and extracts the identity strings used for
//! hardware ID derivation. This is deliberately a narrow reader, not a
//! general SMBIOS library: only the structure walk and the string-set
//! indexing are implemented.

use std::path::Path;

use crate::error::{Error, Result};

/// DMI structure types this core cares about.
pub const TYPE_BIOS: u8 = 0;
pub const TYPE_SYSTEM: u8 = 1;
pub const TYPE_BASEBOARD: u8 = 2;
pub const TYPE_CHASSIS: u8 = 3;
const TYPE_END_OF_TABLE: u8 = 127;

/// Machine chassis classification, from the SMBIOS enclosure type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChassisKind {
    #[default]
    Unknown,
    Desktop,
    LowProfileDesktop,
    AllInOne,
    Laptop,
    Notebook,
    Tablet,
    Convertible,
    Detachable,
    Server,
    Other(u8),
}

impl ChassisKind {
    pub fn from_raw(value: u8) -> Self {
        // high bit is the lock-present flag
        match value & 0x7f {
            0x02 => ChassisKind::Unknown,
            0x03 => ChassisKind::Desktop,
            0x04 => ChassisKind::LowProfileDesktop,
            0x09 => ChassisKind::Laptop,
            0x0a => ChassisKind::Notebook,
            0x0d => ChassisKind::AllInOne,
            0x11 => ChassisKind::Server,
            0x1e => ChassisKind::Tablet,
            0x1f => ChassisKind::Convertible,
            0x20 => ChassisKind::Detachable,
            other => ChassisKind::Other(other),
        }
    }
}

/// One DMI structure: the formatted area plus its string set.
#[derive(Debug, Clone)]
pub struct SmbiosStructure {
    pub kind: u8,
    pub handle: u16,
    /// Formatted area, including the four header bytes.
    pub data: Vec<u8>,
    strings: Vec<String>,
}

impl SmbiosStructure {
    /// Resolve the string referenced by the byte at `offset` in the
    /// formatted area. String indices are 1-based; 0 means "not set".
    pub fn string(&self, offset: usize) -> Option<&str> {
        let index = *self.data.get(offset)? as usize;
        if index == 0 {
            return None;
        }
        self.strings.get(index - 1).map(String::as_str)
    }

    /// Read a single byte from the formatted area.
    pub fn byte(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }
}

/// Parsed DMI structure table.
#[derive(Debug, Default, Clone)]
pub struct Smbios {
    structures: Vec<SmbiosStructure>,
}

impl Smbios {
    /// Parse a raw DMI structure table blob.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let mut structures = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= blob.len() {
            let kind = blob[offset];
            let length = blob[offset + 1] as usize;
            let handle = u16::from_le_bytes([blob[offset + 2], blob[offset + 3]]);
            if length < 4 || offset + length > blob.len() {
                return Err(Error::InvalidFile(format!(
                    "structure at {offset:#x} has invalid length {length}"
                )));
            }
            let data = blob[offset..offset + length].to_vec();

            // string-set: NUL-terminated strings ending with an extra NUL
            let mut strings = Vec::new();
            let mut cursor = offset + length;
            loop {
                let Some(end) = blob[cursor..].iter().position(|b| *b == 0) else {
                    return Err(Error::InvalidFile(
                        "unterminated string set".to_string(),
                    ));
                };
                if end == 0 {
                    cursor += 1;
                    break;
                }
                strings.push(String::from_utf8_lossy(&blob[cursor..cursor + end]).into_owned());
                cursor += end + 1;
            }
            // a structure with no strings is terminated by two NULs
            if strings.is_empty() && blob.get(cursor) == Some(&0) {
                cursor += 1;
            }

            if kind == TYPE_END_OF_TABLE {
                break;
            }
            structures.push(SmbiosStructure {
                kind,
                handle,
                data,
                strings,
            });
            offset = cursor;
        }
        Ok(Self { structures })
    }

    /// Load the structure table from a sysfs-style directory containing a
    /// `DMI` file.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("DMI");
        if !path.exists() {
            return Err(Error::NotFound(format!("{}", path.display())));
        }
        let blob = std::fs::read(&path)?;
        Self::parse(&blob)
    }

    /// All structures of a given type, in table order.
    pub fn structures(&self, kind: u8) -> Vec<&SmbiosStructure> {
        self.structures.iter().filter(|s| s.kind == kind).collect()
    }

    /// The string at `offset` in the first structure of `kind`.
    pub fn string(&self, kind: u8, offset: usize) -> Option<&str> {
        self.structures
            .iter()
            .find(|s| s.kind == kind)
            .and_then(|s| s.string(offset))
    }

    /// The byte at `offset` in the first structure of `kind`.
    pub fn integer(&self, kind: u8, offset: usize) -> Option<u8> {
        self.structures
            .iter()
            .find(|s| s.kind == kind)
            .and_then(|s| s.byte(offset))
    }
}
