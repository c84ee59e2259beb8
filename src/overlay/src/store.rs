//! Persistent storage of materialized file bodies, keyed by inode number.
//!
//! Each body lives in its own file under a sharded tree
//! `<local dir>/<2-hex-byte>/<inode>`, prefixed by the fixed-size integrity
//! header. Logical byte 0 of the file starts immediately after the header.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{OverlayError, Result};
use crate::header::{Header, HEADER_ID_FILE, HEADER_LENGTH};
use crate::inode::InodeNumber;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const SHARD_COUNT: u64 = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

pub struct FsFileContentStore {
    local_dir: PathBuf,
    initialized: AtomicBool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FsFileContentStore {
    pub fn new(local_dir: impl Into<PathBuf>) -> Self {
        FsFileContentStore {
            local_dir: local_dir.into(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    fn shard_dir(&self, ino: InodeNumber) -> PathBuf {
        self.local_dir.join(format!("{:02x}", ino.get() & 0xff))
    }

    fn file_path(&self, ino: InodeNumber) -> PathBuf {
        self.shard_dir(ino).join(format!("{}", ino.get()))
    }

    pub fn initialize(&self, create_if_missing: bool) -> Result<()> {
        let probe = self.local_dir.join("00");
        if !probe.is_dir() {
            if !create_if_missing {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!(
                        "overlay file content store not found at {}",
                        self.local_dir.display()
                    ),
                )
                .into());
            }
            for shard in 0..SHARD_COUNT {
                fs::create_dir_all(self.local_dir.join(format!("{:02x}", shard)))?;
            }
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    /// Creates the body for a newly materialized file, writing the header
    /// followed by the initial contents.
    pub fn create_overlay_file(&self, ino: InodeNumber, contents: &[u8]) -> Result<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(ino))?;
        file.write_all(&Header::new(HEADER_ID_FILE, ino).serialize())?;
        file.write_all(contents)?;
        Ok(file)
    }

    /// Opens an existing body and verifies its header against the expected
    /// identifier and inode number.
    pub fn open_file(&self, ino: InodeNumber, expected_id: [u8; 4]) -> Result<File> {
        let mut file = self.open_file_no_verify(ino)?;
        let mut buf = [0u8; HEADER_LENGTH];
        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..])? {
                0 => break,
                n => read += n,
            }
        }
        let header = Header::parse(&buf[..read])
            .map_err(|reason| OverlayError::corrupt(ino, reason))?;
        header
            .check(expected_id, ino)
            .map_err(|reason| OverlayError::corrupt(ino, reason))?;
        Ok(file)
    }

    /// Opens an existing body without header verification.
    pub fn open_file_no_verify(&self, ino: InodeNumber) -> Result<File> {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(ino))
        {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(OverlayError::NotFound(ino))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn has_overlay_file(&self, ino: InodeNumber) -> Result<bool> {
        Ok(self.file_path(ino).is_file())
    }

    /// Removes a body. Idempotent on absent inodes.
    pub fn remove_overlay_file(&self, ino: InodeNumber) -> Result<()> {
        match fs::remove_file(self.file_path(ino)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Whole stored file, header included, for preservation of corrupt
    /// bodies by the consistency checker.
    pub fn read_raw(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        match fs::read(self.file_path(ino)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(OverlayError::NotFound(ino))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Every inode with a recorded body, for the consistency checker.
    pub fn list_files(&self) -> Result<Vec<InodeNumber>> {
        let mut result = Vec::new();
        for shard in 0..SHARD_COUNT {
            let shard_dir = self.local_dir.join(format!("{:02x}", shard));
            let entries = match fs::read_dir(&shard_dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                if let Some(ino) = entry
                    .file_name()
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use tempfile::TempDir;

    fn store() -> (FsFileContentStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = FsFileContentStore::new(tmp.path());
        store.initialize(true).unwrap();
        (store, tmp)
    }

    fn read_logical(mut file: File) -> Vec<u8> {
        file.seek(io::SeekFrom::Start(HEADER_LENGTH as u64)).unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_create_and_read_back() {
        let (store, _tmp) = store();
        let ino = InodeNumber::new(5);
        store.create_overlay_file(ino, b"contents").unwrap();
        let file = store.open_file(ino, HEADER_ID_FILE).unwrap();
        assert_eq!(read_logical(file), b"contents");
    }

    #[test]
    fn test_empty_file_round_trips() {
        let (store, _tmp) = store();
        let ino = InodeNumber::new(6);
        store.create_overlay_file(ino, b"").unwrap();
        let file = store.open_file(ino, HEADER_ID_FILE).unwrap();
        assert_eq!(file.metadata().unwrap().len(), HEADER_LENGTH as u64);
        assert_eq!(read_logical(file), b"");
    }

    #[test]
    fn test_open_missing_file_is_not_found() {
        let (store, _tmp) = store();
        let err = store
            .open_file(InodeNumber::new(9), HEADER_ID_FILE)
            .unwrap_err();
        assert!(matches!(err, OverlayError::NotFound(_)));
    }

    #[test]
    fn test_corrupt_header_is_detected() {
        let (store, _tmp) = store();
        let ino = InodeNumber::new(5);
        store.create_overlay_file(ino, b"payload").unwrap();

        // Overwrite the header with garbage out of band.
        let mut file = store.open_file_no_verify(ino).unwrap();
        file.write_all(&[0x55u8; HEADER_LENGTH]).unwrap();
        drop(file);

        match store.open_file(ino, HEADER_ID_FILE) {
            Err(OverlayError::Corrupt { reason, .. }) => {
                assert!(
                    reason.contains("unknown overlay file format version"),
                    "reason: {}",
                    reason
                );
            }
            other => panic!("expected corrupt header, got {:?}", other.map(|_| ())),
        }
        // Unchecked open still works for repair tooling.
        store.open_file_no_verify(ino).unwrap();
    }

    #[test]
    fn test_wrong_inode_in_header_is_detected() {
        let (store, _tmp) = store();
        store.create_overlay_file(InodeNumber::new(5), b"x").unwrap();
        // Move the body where a different inode's body should live.
        fs::rename(
            store.file_path(InodeNumber::new(5)),
            store.file_path(InodeNumber::new(261)),
        )
        .unwrap();
        let err = store
            .open_file(InodeNumber::new(261), HEADER_ID_FILE)
            .unwrap_err();
        match err {
            OverlayError::Corrupt { reason, .. } => {
                assert!(reason.contains("inode mismatch"), "reason: {}", reason)
            }
            other => panic!("expected corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (store, _tmp) = store();
        let ino = InodeNumber::new(5);
        store.create_overlay_file(ino, b"x").unwrap();
        assert!(store.has_overlay_file(ino).unwrap());
        store.remove_overlay_file(ino).unwrap();
        assert!(!store.has_overlay_file(ino).unwrap());
        store.remove_overlay_file(ino).unwrap();
    }

    #[test]
    fn test_list_files() {
        let (store, _tmp) = store();
        for raw in [2u64, 257, 300] {
            store
                .create_overlay_file(InodeNumber::new(raw), b"x")
                .unwrap();
        }
        let mut listed = store.list_files().unwrap();
        listed.sort();
        assert_eq!(
            listed,
            vec![
                InodeNumber::new(2),
                InodeNumber::new(257),
                InodeNumber::new(300)
            ]
        );
    }
}
