//! Optional side table recording per-inode metadata (mode and timestamps).
//!
//! The table is advisory: it is loaded when present, consulted by the mount
//! layer, and rebuilt lazily when lost. Records are freed as inodes are
//! removed or reclaimed.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;

use crate::error::Result;
use crate::inode::InodeNumber;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// File name inside the overlay's local directory.
pub const METADATA_FILE: &str = "metadata";

const MAGIC: [u8; 4] = *b"OVMT";
const VERSION: u32 = 1;

/// Bytes per serialized record: inode + mode + padding + three timestamps.
const RECORD_SIZE: usize = 8 + 4 + 4 + 8 * 3;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InodeMetadata {
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

pub struct InodeMetadataTable {
    path: PathBuf,
    records: Mutex<HashMap<InodeNumber, InodeMetadata>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl InodeMetadataTable {
    /// Opens the table, loading existing records if the file is present. A
    /// malformed file is discarded with a warning since the table is
    /// advisory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => match Self::parse(&bytes) {
                Ok(records) => records,
                Err(reason) => {
                    warn!("discarding malformed inode metadata table: {}", reason);
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(InodeMetadataTable {
            path,
            records: Mutex::new(records),
        })
    }

    fn parse(bytes: &[u8]) -> std::result::Result<HashMap<InodeNumber, InodeMetadata>, String> {
        if bytes.len() < 16 {
            return Err("file too short".into());
        }
        if bytes[0..4] != MAGIC {
            return Err("bad magic".into());
        }
        let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(format!("unsupported version {}", version));
        }
        let count = u64::from_be_bytes(bytes[8..16].try_into().unwrap()) as usize;
        let body = &bytes[16..];
        if body.len() != count * RECORD_SIZE {
            return Err(format!(
                "expected {} record bytes, found {}",
                count * RECORD_SIZE,
                body.len()
            ));
        }
        let mut records = HashMap::with_capacity(count);
        for chunk in body.chunks_exact(RECORD_SIZE) {
            let ino = u64::from_be_bytes(chunk[0..8].try_into().unwrap());
            let Some(ino) = InodeNumber::from_raw(ino) else {
                return Err("record with inode number 0".into());
            };
            records.insert(
                ino,
                InodeMetadata {
                    mode: u32::from_be_bytes(chunk[8..12].try_into().unwrap()),
                    atime: i64::from_be_bytes(chunk[16..24].try_into().unwrap()),
                    mtime: i64::from_be_bytes(chunk[24..32].try_into().unwrap()),
                    ctime: i64::from_be_bytes(chunk[32..40].try_into().unwrap()),
                },
            );
        }
        Ok(records)
    }

    pub fn get(&self, ino: InodeNumber) -> Option<InodeMetadata> {
        self.records.lock().unwrap().get(&ino).copied()
    }

    pub fn set(&self, ino: InodeNumber, metadata: InodeMetadata) {
        self.records.lock().unwrap().insert(ino, metadata);
    }

    /// Drops the record for a removed inode. Idempotent.
    pub fn free_inode(&self, ino: InodeNumber) {
        self.records.lock().unwrap().remove(&ino);
    }

    pub fn save(&self) -> Result<()> {
        let records = self.records.lock().unwrap();
        let mut out = Vec::with_capacity(16 + records.len() * RECORD_SIZE);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_be_bytes());
        out.extend_from_slice(&(records.len() as u64).to_be_bytes());
        for (ino, meta) in records.iter() {
            out.extend_from_slice(&ino.get().to_be_bytes());
            out.extend_from_slice(&meta.mode.to_be_bytes());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&meta.atime.to_be_bytes());
            out.extend_from_slice(&meta.mtime.to_be_bytes());
            out.extend_from_slice(&meta.ctime.to_be_bytes());
        }
        drop(records);

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &out)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn close(&self) {
        if let Err(err) = self.save() {
            warn!("failed to persist inode metadata table: {}", err);
        }
    }
}

pub fn metadata_table_path(local_dir: &Path) -> PathBuf {
    local_dir.join(METADATA_FILE)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> InodeMetadata {
        InodeMetadata {
            mode: 0o100644,
            atime: 1_700_000_000,
            mtime: 1_700_000_100,
            ctime: 1_700_000_200,
        }
    }

    #[test]
    fn test_round_trip_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(METADATA_FILE);
        {
            let table = InodeMetadataTable::open(&path).unwrap();
            table.set(InodeNumber::new(5), sample());
            table.close();
        }
        let table = InodeMetadataTable::open(&path).unwrap();
        assert_eq!(table.get(InodeNumber::new(5)), Some(sample()));
        assert_eq!(table.get(InodeNumber::new(6)), None);
    }

    #[test]
    fn test_free_inode() {
        let tmp = TempDir::new().unwrap();
        let table = InodeMetadataTable::open(tmp.path().join(METADATA_FILE)).unwrap();
        table.set(InodeNumber::new(5), sample());
        table.free_inode(InodeNumber::new(5));
        table.free_inode(InodeNumber::new(5));
        assert_eq!(table.get(InodeNumber::new(5)), None);
    }

    #[test]
    fn test_malformed_table_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(METADATA_FILE);
        fs::write(&path, b"not a metadata table").unwrap();
        let table = InodeMetadataTable::open(&path).unwrap();
        assert_eq!(table.get(InodeNumber::new(5)), None);
    }
}
