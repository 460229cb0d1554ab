//! Flat device tree reader.
//!
//! Parses the FDT header and the root-node properties. Embedded platforms
//! identify themselves through `model` and `compatible` here instead of
//! SMBIOS, which is all the identity pipeline needs from the blob.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};

const FDT_MAGIC: u32 = 0xd00dfeed;
const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Parsed flat device tree, root properties only.
#[derive(Debug, Clone)]
pub struct Fdt {
    pub total_size: u32,
    pub version: u32,
    root_props: BTreeMap<String, Vec<u8>>,
}

impl Fdt {
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(blob);
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != FDT_MAGIC {
            return Err(Error::InvalidFile(format!(
                "bad FDT magic {magic:#010x}"
            )));
        }
        let total_size = cursor.read_u32::<BigEndian>()?;
        let off_dt_struct = cursor.read_u32::<BigEndian>()? as usize;
        let off_dt_strings = cursor.read_u32::<BigEndian>()? as usize;
        let _off_mem_rsvmap = cursor.read_u32::<BigEndian>()?;
        let version = cursor.read_u32::<BigEndian>()?;
        if total_size as usize > blob.len() {
            return Err(Error::InvalidFile(format!(
                "FDT totalsize {total_size} exceeds blob of {}",
                blob.len()
            )));
        }

        let mut root_props = BTreeMap::new();
        let mut depth = 0u32;
        let mut pos = off_dt_struct;
        loop {
            let token = read_u32(blob, pos)?;
            pos += 4;
            match token {
                FDT_BEGIN_NODE => {
                    let name_end = blob[pos..]
                        .iter()
                        .position(|b| *b == 0)
                        .ok_or_else(|| Error::InvalidFile("unterminated node name".into()))?;
                    pos = align4(pos + name_end + 1);
                    depth += 1;
                }
                FDT_END_NODE => {
                    if depth == 0 {
                        return Err(Error::InvalidFile("unbalanced node end".into()));
                    }
                    depth -= 1;
                }
                FDT_PROP => {
                    let len = read_u32(blob, pos)? as usize;
                    let name_off = read_u32(blob, pos + 4)? as usize;
                    let data_start = pos + 8;
                    if data_start + len > blob.len() {
                        return Err(Error::InvalidFile("property overruns blob".into()));
                    }
                    if depth == 1 {
                        let name = read_cstr(blob, off_dt_strings + name_off)?;
                        root_props.insert(name, blob[data_start..data_start + len].to_vec());
                    }
                    pos = align4(data_start + len);
                }
                FDT_NOP => {}
                FDT_END => break,
                other => {
                    return Err(Error::InvalidFile(format!("unknown FDT token {other:#x}")));
                }
            }
        }

        Ok(Self {
            total_size,
            version,
            root_props,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let blob = std::fs::read(path)?;
        Self::parse(&blob)
    }

    /// A root property interpreted as a NUL-terminated string.
    ///
    /// `compatible` holds a NUL-separated list; the first entry is
    /// returned.
    pub fn root_prop_str(&self, name: &str) -> Option<String> {
        let data = self.root_props.get(name)?;
        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        if end == 0 {
            return None;
        }
        Some(String::from_utf8_lossy(&data[..end]).into_owned())
    }

    pub fn root_prop(&self, name: &str) -> Option<&[u8]> {
        self.root_props.get(name).map(Vec::as_slice)
    }
}

fn align4(pos: usize) -> usize {
    (pos + 3) & !3
}

fn read_u32(blob: &[u8], pos: usize) -> Result<u32> {
    blob.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::InvalidFile("truncated FDT".into()))
}

fn read_cstr(blob: &[u8], pos: usize) -> Result<String> {
    let slice = blob
        .get(pos..)
        .ok_or_else(|| Error::InvalidFile("string offset out of range".into()))?;
    let end = slice
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::InvalidFile("unterminated string".into()))?;
    Ok(String::from_utf8_lossy(&slice[..end]).into_owned())
}
