/// Table file codec.
///
/// # File Format
/// ```text
/// [magic: u32 LE][length: u32 LE][entries: bincode Vec<TableEntry>][crc32c: u32 LE]
/// ```
/// Entries are sorted by key, one per key; tombstones are kept so they keep
/// masking older tables. The CRC covers the bincode payload.
///
/// # Naming
/// `NNNNNN.sst` for visible tables, `NNNNNN.sst.tmp` while being written.
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MAGIC: u32 = 0x4b45_4c50;
const HEADER_LEN: u64 = 8;
const FOOTER_LEN: u64 = 4;
/// bincode length prefix of a `Vec` or byte string
const LEN_PREFIX: u64 = 8;

pub const TABLE_SUFFIX: &str = "sst";
pub const TEMP_SUFFIX: &str = "sst.tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub key: Bytes,
    pub seqno: u64,
    /// `None` marks a tombstone
    pub value: Option<Bytes>,
}

impl TableEntry {
    /// Bytes this entry occupies inside the bincode payload.
    pub fn encoded_len(&self) -> u64 {
        let value = self
            .value
            .as_ref()
            .map_or(0, |v| LEN_PREFIX + v.len() as u64);
        LEN_PREFIX + self.key.len() as u64 + 8 + 1 + value
    }
}

/// Exact size of the file `encode` would produce for `entries`.
pub fn encoded_len<'a>(entries: impl IntoIterator<Item = &'a TableEntry>) -> u64 {
    HEADER_LEN
        + LEN_PREFIX
        + entries.into_iter().map(TableEntry::encoded_len).sum::<u64>()
        + FOOTER_LEN
}

pub fn encode(entries: &[TableEntry]) -> Result<Vec<u8>> {
    let payload = bincode::serialize(entries)
        .map_err(|e| Error::Internal(format!("Failed to serialize table: {}", e)))?;
    let length = u32::try_from(payload.len()).map_err(|_| {
        Error::Internal(format!("table payload too large: {} bytes", payload.len()))
    })?;
    let crc = crc32c::crc32c(&payload);

    let mut out = Vec::with_capacity(payload.len() + (HEADER_LEN + FOOTER_LEN) as usize);
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<Vec<TableEntry>> {
    let fixed = (HEADER_LEN + FOOTER_LEN) as usize;
    if data.len() < fixed {
        return Err(Error::Corruption(format!(
            "table too short: {} bytes",
            data.len()
        )));
    }

    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if magic != MAGIC {
        return Err(Error::Corruption(format!("bad magic {:#x}", magic)));
    }
    let length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    if data.len() != fixed + length {
        return Err(Error::Corruption(format!(
            "length mismatch: header says {}, file holds {}",
            length,
            data.len() - fixed
        )));
    }

    let payload = &data[8..8 + length];
    let tail = &data[8 + length..];
    let stored_crc = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let actual_crc = crc32c::crc32c(payload);
    if stored_crc != actual_crc {
        return Err(Error::Corruption(format!(
            "CRC mismatch: expected {:#x}, got {:#x}",
            stored_crc, actual_crc
        )));
    }

    bincode::deserialize(payload)
        .map_err(|e| Error::Corruption(format!("Failed to deserialize table: {}", e)))
}

pub fn table_file_name(file_number: u64) -> String {
    format!("{:06}.{}", file_number, TABLE_SUFFIX)
}

pub fn temp_file_name(file_number: u64) -> String {
    format!("{:06}.{}", file_number, TEMP_SUFFIX)
}

/// Parses a visible table name (`NNNNNN.sst`) into its file number.
pub fn parse_table_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}

pub fn is_temp_file_name(name: &str) -> bool {
    name.ends_with(".sst.tmp")
}

/// A committed, immutable table held in memory for point lookups.
#[derive(Debug)]
pub struct TableFile {
    pub file_number: u64,
    /// Directory holding the file
    pub dir: PathBuf,
    pub size: u64,
    entries: Vec<TableEntry>,
}

impl TableFile {
    /// `entries` must be sorted by key without duplicates.
    pub fn new(file_number: u64, dir: impl AsRef<Path>, size: u64, entries: Vec<TableEntry>) -> Self {
        Self {
            file_number,
            dir: dir.as_ref().to_path_buf(),
            size,
            entries,
        }
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(table_file_name(self.file_number))
    }

    pub fn get(&self, key: &[u8]) -> Option<&TableEntry> {
        self.entries
            .binary_search_by(|e| e.key.as_ref().cmp(key))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
