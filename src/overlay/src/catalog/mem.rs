//! In-memory catalog for tests. Contents are lost on shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::warn;

use crate::codec::{self, OverlayDir};
use crate::error::{OverlayError, Result};
use crate::inode::{InodeNumber, ROOT_INODE};

use super::InodeCatalog;

pub struct MemInodeCatalog {
    /// Records are held in encoded form so the wire codec is exercised the
    /// same way it is by the persistent backends.
    records: Mutex<HashMap<InodeNumber, Vec<u8>>>,
    initialized: AtomicBool,
}

impl MemInodeCatalog {
    pub fn new() -> Self {
        MemInodeCatalog {
            records: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }
}

impl Default for MemInodeCatalog {
    fn default() -> Self {
        MemInodeCatalog::new()
    }
}

impl InodeCatalog for MemInodeCatalog {
    fn initialize(&self, _create_if_missing: bool) -> Result<Option<InodeNumber>> {
        warn!("in-memory inode catalog initialized; contents will not survive shutdown");
        self.initialized.store(true, Ordering::Release);
        Ok(Some(InodeNumber::new(ROOT_INODE.get() + 1)))
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn close(&self, _next_inode: Option<InodeNumber>) {
        self.records.lock().unwrap().clear();
        self.initialized.store(false, Ordering::Release);
    }

    fn load_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
        let records = self.records.lock().unwrap();
        match records.get(&ino) {
            Some(bytes) => {
                let dir = codec::decode_dir(bytes)
                    .map_err(|err| OverlayError::corrupt(ino, err.to_string()))?;
                Ok(Some(dir))
            }
            None => Ok(None),
        }
    }

    fn load_directory_raw(&self, ino: InodeNumber) -> Result<Option<Vec<u8>>> {
        Ok(self.records.lock().unwrap().get(&ino).cloned())
    }

    fn save_directory(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<()> {
        let bytes = codec::encode_dir(dir);
        self.records.lock().unwrap().insert(ino, bytes);
        Ok(())
    }

    fn has_directory(&self, ino: InodeNumber) -> Result<bool> {
        Ok(self.records.lock().unwrap().contains_key(&ino))
    }

    fn remove_directory(&self, ino: InodeNumber) -> Result<()> {
        self.records.lock().unwrap().remove(&ino);
        Ok(())
    }

    fn load_and_remove_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
        let removed = self.records.lock().unwrap().remove(&ino);
        match removed {
            Some(bytes) => {
                let dir = codec::decode_dir(&bytes)
                    .map_err(|err| OverlayError::corrupt(ino, err.to_string()))?;
                Ok(Some(dir))
            }
            None => Ok(None),
        }
    }

    fn list_directories(&self) -> Result<Vec<InodeNumber>> {
        Ok(self.records.lock().unwrap().keys().copied().collect())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OverlayEntry;
    use crate::dir::PathComponent;

    fn dir_with_one_entry() -> OverlayDir {
        OverlayDir {
            entries: vec![(
                PathComponent::new("child").unwrap(),
                OverlayEntry {
                    mode: 0o100644,
                    inode: InodeNumber::new(3),
                    id: None,
                },
            )],
        }
    }

    #[test]
    fn test_basic_round_trip() {
        let catalog = MemInodeCatalog::new();
        assert_eq!(
            catalog.initialize(true).unwrap(),
            Some(InodeNumber::new(2))
        );

        let ino = InodeNumber::new(2);
        let dir = dir_with_one_entry();
        catalog.save_directory(ino, &dir).unwrap();
        assert!(catalog.has_directory(ino).unwrap());
        assert_eq!(catalog.load_directory(ino).unwrap(), Some(dir.clone()));

        let removed = catalog.load_and_remove_directory(ino).unwrap();
        assert_eq!(removed, Some(dir));
        assert!(!catalog.has_directory(ino).unwrap());
        assert_eq!(catalog.load_and_remove_directory(ino).unwrap(), None);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();
        catalog.remove_directory(InodeNumber::new(9)).unwrap();
        catalog.remove_directory(InodeNumber::new(9)).unwrap();
    }

    #[test]
    fn test_close_discards_state() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();
        catalog
            .save_directory(InodeNumber::new(2), &dir_with_one_entry())
            .unwrap();
        catalog.close(Some(InodeNumber::new(4)));
        assert!(!catalog.initialized());

        catalog.initialize(true).unwrap();
        assert_eq!(
            catalog.load_directory(InodeNumber::new(2)).unwrap(),
            None
        );
    }
}
