//! Persistent storage of directory records, keyed by inode number.
//!
//! Backends are interchangeable behind the [`InodeCatalog`] trait. The
//! facade holds a trait object and queries capabilities at runtime rather
//! than encoding the backend choice in its type.

use std::path::Path;

use bitflags::bitflags;
use log::warn;

use crate::codec::{OverlayDir, OverlayEntry};
use crate::dir::PathComponent;
use crate::error::Result;
use crate::inode::InodeNumber;

pub mod buffered;
pub mod fs;
pub mod mem;
pub mod sqlite;

pub use buffered::BufferedInodeCatalog;
pub use fs::FsInodeCatalog;
pub use mem::MemInodeCatalog;
pub use sqlite::SqliteInodeCatalog;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Which backend realizes the catalog. Immutable once an overlay directory
/// has been created with it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeCatalogType {
    /// One row per inode in a local SQLite database.
    Sqlite,
    /// One small record file per inode under a sharded directory tree.
    Fs,
    /// Kept entirely in memory; for tests only.
    InMemory,
}

bitflags! {
    /// Behavior modifiers applied on top of the chosen backend.
    pub struct InodeCatalogOptions: u32 {
        /// Wrap the catalog in the write-buffering decorator.
        const BUFFERED = 0b0001;
        /// Relax table-backend durability (data loss window on power
        /// failure).
        const SYNCHRONOUS_OFF = 0b0010;
        /// Force an in-memory store even when a persistent backend was
        /// configured; for tests.
        const UNSAFE_IN_MEMORY = 0b0100;
    }
}

/// The catalog contract: crash-safe single-record updates of the mapping
/// from inode number to serialized directory contents.
pub trait InodeCatalog: Send + Sync {
    /// Opens the store. Returns the next inode number persisted by a clean
    /// shutdown, or `None` when none was recorded, which the facade treats
    /// as the signal to run a consistency check.
    fn initialize(&self, create_if_missing: bool) -> Result<Option<InodeNumber>>;

    /// Whether `initialize` has run, i.e. whether `close` has cleanup to do.
    fn initialized(&self) -> bool;

    /// Persists the supplied next inode number (if any) and releases
    /// resources.
    fn close(&self, next_inode: Option<InodeNumber>);

    /// True when `add_child`/`remove_child`/`rename_child` are faster than
    /// whole-directory rewrites on this backend. Queried once by the facade.
    fn supports_semantic_operations(&self) -> bool {
        false
    }

    fn load_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>>;

    /// The stored record verbatim, for preservation of corrupt blobs by the
    /// consistency checker.
    fn load_directory_raw(&self, ino: InodeNumber) -> Result<Option<Vec<u8>>>;

    /// Atomically replaces the single record for `ino`.
    fn save_directory(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<()>;

    fn has_directory(&self, ino: InodeNumber) -> Result<bool>;

    /// Removes the record. Idempotent on absent inodes.
    fn remove_directory(&self, ino: InodeNumber) -> Result<()>;

    /// Atomically removes the record and returns what was removed. Used by
    /// the reclamation worker.
    fn load_and_remove_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>>;

    /// Every inode with a directory record, for the consistency checker.
    fn list_directories(&self) -> Result<Vec<InodeNumber>>;

    /// Fine-grained child insert. Only called when
    /// `supports_semantic_operations` returns true.
    fn add_child(
        &self,
        _parent: InodeNumber,
        _name: &PathComponent,
        _entry: OverlayEntry,
    ) -> Result<()> {
        Err(crate::error::OverlayError::Unimplemented)
    }

    /// Fine-grained child removal; returns whether an entry was removed.
    fn remove_child(&self, _parent: InodeNumber, _name: &str) -> Result<bool> {
        Err(crate::error::OverlayError::Unimplemented)
    }

    /// Fine-grained rename between (possibly identical) parents.
    fn rename_child(
        &self,
        _src: InodeNumber,
        _dst: InodeNumber,
        _src_name: &str,
        _dst_name: &PathComponent,
    ) -> Result<()> {
        Err(crate::error::OverlayError::Unimplemented)
    }

    /// Periodic upkeep (compaction, checkpointing). Called from the
    /// background worker.
    fn maintenance(&self) -> Result<()> {
        Ok(())
    }

    /// Completes only once every previously accepted write is durably
    /// persisted by the underlying store. A plain backend is already
    /// synchronous, so the default is a no-op.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the configured catalog backend, applying option decorators.
pub fn make_inode_catalog(
    local_dir: &Path,
    catalog_type: InodeCatalogType,
    options: InodeCatalogOptions,
    buffer_size: usize,
) -> Box<dyn InodeCatalog> {
    let inner: Box<dyn InodeCatalog> = match catalog_type {
        InodeCatalogType::InMemory => {
            warn!("in-memory inode catalog requested; this will cause data loss");
            return Box::new(MemInodeCatalog::new());
        }
        InodeCatalogType::Sqlite => {
            if options.contains(InodeCatalogOptions::UNSAFE_IN_MEMORY) {
                warn!("in-memory sqlite inode catalog requested; this will cause data loss");
                Box::new(SqliteInodeCatalog::in_memory())
            } else {
                let synchronous_off = options.contains(InodeCatalogOptions::SYNCHRONOUS_OFF);
                Box::new(SqliteInodeCatalog::new(local_dir, synchronous_off))
            }
        }
        InodeCatalogType::Fs => Box::new(FsInodeCatalog::new(local_dir)),
    };

    if options.contains(InodeCatalogOptions::BUFFERED) {
        Box::new(BufferedInodeCatalog::new(std::sync::Arc::from(inner), buffer_size))
    } else {
        inner
    }
}
