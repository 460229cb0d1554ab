//! Portable Executable surface checks.
//!
//! Boot-asset collection only needs to know that a file on the ESP really
//! is a PE image and which machine it targets; anything deeper belongs to
//! the firmware-format plugins.

use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

const DOS_MAGIC: u16 = 0x5a4d; // "MZ"
const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"

pub const MACHINE_X64: u16 = 0x8664;
pub const MACHINE_AARCH64: u16 = 0xaa64;
pub const MACHINE_I386: u16 = 0x014c;

/// A validated PE image.
#[derive(Debug, Clone)]
pub struct PeFile {
    pub machine: u16,
    pub section_count: u16,
    pub size: u64,
    pub filename: Option<String>,
}

impl PeFile {
    /// Validate a PE image held in memory.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let dos_magic = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidFile("file too small for DOS header".into()))?;
        if dos_magic != DOS_MAGIC {
            return Err(Error::InvalidFile(format!(
                "bad DOS magic {dos_magic:#06x}"
            )));
        }
        let e_lfanew = data
            .get(0x3c..0x40)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64)
            .ok_or_else(|| Error::InvalidFile("file too small for e_lfanew".into()))?;
        cursor.set_position(e_lfanew);
        let signature = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidFile("e_lfanew out of range".into()))?;
        if signature != PE_SIGNATURE {
            return Err(Error::InvalidFile(format!(
                "bad PE signature {signature:#010x}"
            )));
        }
        let machine = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidFile("truncated COFF header".into()))?;
        let section_count = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidFile("truncated COFF header".into()))?;
        Ok(Self {
            machine,
            section_count,
            size: data.len() as u64,
            filename: None,
        })
    }

    /// Load and validate a PE image from disk.
    ///
    /// A missing file maps to `NotFound` so callers can treat it as an
    /// expected absence rather than an I/O failure.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("{}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        let mut pe = Self::parse(&data)
            .map_err(|e| Error::InvalidFile(format!("{}: {e}", path.display())))?;
        pe.filename = Some(path.display().to_string());
        Ok(pe)
    }
}

#[cfg(test)]
pub(crate) mod testsupport {
    use super::*;

    pub(crate) fn minimal_pe() -> Vec<u8> {
        let mut data = vec![0u8; 0x60];
        data[0] = b'M';
        data[1] = b'Z';
        data[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        data[0x40..0x44].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
        data[0x44..0x46].copy_from_slice(&MACHINE_X64.to_le_bytes());
        data[0x46..0x48].copy_from_slice(&3u16.to_le_bytes());
        data
    }
}

#[cfg(test)]
mod tests {
    use super::testsupport::minimal_pe;
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let pe = PeFile::parse(&minimal_pe()).unwrap();
        assert_eq!(pe.machine, MACHINE_X64);
        assert_eq!(pe.section_count, 3);
    }

    #[test]
    fn test_not_pe_rejected() {
        assert!(matches!(
            PeFile::parse(b"\x7fELF whatever"),
            Err(Error::InvalidFile(_))
        ));
        assert!(matches!(PeFile::parse(b"M"), Err(Error::InvalidFile(_))));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = PeFile::load(Path::new("/nonexistent/shimx64.efi")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_load_sets_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grubx64.efi");
        std::fs::write(&path, minimal_pe()).unwrap();
        let pe = PeFile::load(&path).unwrap();
        assert!(pe.filename.as_deref().unwrap().ends_with("grubx64.efi"));
    }
}
