//! Filesystem-backed catalog: one record file per inode under a sharded
//! directory tree. Appropriate where the host filesystem handles many small
//! files efficiently.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::warn;

use crate::codec::{self, OverlayDir};
use crate::error::{OverlayError, Result};
use crate::header::{Header, HEADER_ID_DIR, HEADER_LENGTH};
use crate::inode::{InodeNumber, ROOT_INODE};

use super::InodeCatalog;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Subdirectory of the overlay's local directory holding the record shards.
const CATALOG_DIR: &str = "catalog";

/// File recording the next inode number, present only after a clean
/// shutdown.
const NEXT_INODE_FILE: &str = "next_inode_number";

const SHARD_COUNT: u64 = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

pub struct FsInodeCatalog {
    local_dir: PathBuf,
    initialized: AtomicBool,
    /// Distinguishes concurrent temp files written for the same inode.
    tmp_counter: AtomicU64,
}

impl FsInodeCatalog {
    pub fn new(local_dir: impl Into<PathBuf>) -> Self {
        FsInodeCatalog {
            local_dir: local_dir.into(),
            initialized: AtomicBool::new(false),
            tmp_counter: AtomicU64::new(0),
        }
    }

    fn catalog_dir(&self) -> PathBuf {
        self.local_dir.join(CATALOG_DIR)
    }

    fn shard_dir(&self, ino: InodeNumber) -> PathBuf {
        self.catalog_dir().join(format!("{:02x}", ino.get() & 0xff))
    }

    fn record_path(&self, ino: InodeNumber) -> PathBuf {
        self.shard_dir(ino).join(format!("{}", ino.get()))
    }

    fn next_inode_path(&self) -> PathBuf {
        self.local_dir.join(NEXT_INODE_FILE)
    }

    fn read_record(&self, ino: InodeNumber) -> Result<Option<Vec<u8>>> {
        match fs::read(self.record_path(ino)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn decode_record(ino: InodeNumber, bytes: &[u8]) -> Result<OverlayDir> {
        let header =
            Header::parse(bytes).map_err(|reason| OverlayError::corrupt(ino, reason))?;
        header
            .check(HEADER_ID_DIR, ino)
            .map_err(|reason| OverlayError::corrupt(ino, reason))?;
        codec::decode_dir(&bytes[HEADER_LENGTH..])
            .map_err(|err| OverlayError::corrupt(ino, err.to_string()))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl InodeCatalog for FsInodeCatalog {
    fn initialize(&self, create_if_missing: bool) -> Result<Option<InodeNumber>> {
        let catalog_dir = self.catalog_dir();
        if !catalog_dir.is_dir() {
            if !create_if_missing {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("overlay catalog not found at {}", catalog_dir.display()),
                )
                .into());
            }
            for shard in 0..SHARD_COUNT {
                fs::create_dir_all(catalog_dir.join(format!("{:02x}", shard)))?;
            }
            self.initialized.store(true, Ordering::Release);
            return Ok(Some(InodeNumber::new(ROOT_INODE.get() + 1)));
        }

        self.initialized.store(true, Ordering::Release);

        // The marker is consumed on open; it only reappears when we shut
        // down cleanly. A crash therefore leaves no marker behind and the
        // next open runs the consistency checker.
        let next_path = self.next_inode_path();
        match fs::read(&next_path) {
            Ok(bytes) => {
                fs::remove_file(&next_path)?;
                if bytes.len() != 8 {
                    warn!(
                        "ignoring malformed next inode number record ({} bytes)",
                        bytes.len()
                    );
                    return Ok(None);
                }
                let value = u64::from_be_bytes(bytes[..8].try_into().unwrap());
                Ok(InodeNumber::from_raw(value))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn close(&self, next_inode: Option<InodeNumber>) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(next) = next_inode {
            let path = self.next_inode_path();
            let tmp = path.with_extension("tmp");
            let result = fs::write(&tmp, next.get().to_be_bytes())
                .and_then(|_| fs::rename(&tmp, &path));
            if let Err(err) = result {
                warn!("failed to record next inode number on close: {}", err);
            }
        }
    }

    fn load_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
        match self.read_record(ino)? {
            Some(bytes) => Ok(Some(Self::decode_record(ino, &bytes)?)),
            None => Ok(None),
        }
    }

    fn load_directory_raw(&self, ino: InodeNumber) -> Result<Option<Vec<u8>>> {
        self.read_record(ino)
    }

    fn save_directory(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<()> {
        let path = self.record_path(ino);
        let tmp = self.shard_dir(ino).join(format!(
            "{}.tmp{}",
            ino.get(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        let header = Header::new(HEADER_ID_DIR, ino);
        let payload = codec::encode_dir(dir);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&header.serialize())?;
            file.write_all(&payload)?;
            file.sync_data()?;
        }
        // Renaming over the old record makes the replacement atomic.
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn has_directory(&self, ino: InodeNumber) -> Result<bool> {
        Ok(self.record_path(ino).is_file())
    }

    fn remove_directory(&self, ino: InodeNumber) -> Result<()> {
        match fs::remove_file(self.record_path(ino)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn load_and_remove_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
        match self.load_directory(ino)? {
            Some(dir) => {
                self.remove_directory(ino)?;
                Ok(Some(dir))
            }
            None => Ok(None),
        }
    }

    fn list_directories(&self) -> Result<Vec<InodeNumber>> {
        let mut result = Vec::new();
        for shard in 0..SHARD_COUNT {
            let shard_dir = self.catalog_dir().join(format!("{:02x}", shard));
            let entries = match fs::read_dir(&shard_dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                if let Some(ino) = name
                    .to_str()
                    .and_then(|name| name.parse::<u64>().ok())
                    .and_then(InodeNumber::from_raw)
                {
                    result.push(ino);
                }
            }
        }
        Ok(result)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
