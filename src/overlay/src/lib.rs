//! The per-mount write layer of a source-control-backed virtual
//! filesystem.
//!
//! A mount exposes a tree whose canonical contents live in a
//! content-addressed store. Whenever a file or directory diverges from
//! that canonical state it becomes *materialized*, and its authoritative
//! contents are recorded here: directory records in the inode catalog,
//! file bodies in the content store, both keyed by inode number. The
//! [`Overlay`] facade ties those stores together with an inode number
//! allocator, a background reclamation worker, and a consistency checker
//! that repairs the on-disk state after an unclean shutdown.

pub mod catalog;
pub mod codec;
pub mod dir;
pub mod disk_state;
pub mod error;
pub mod file;
pub mod fsck;
pub mod header;
pub mod inode;
pub mod metadata;
pub mod model;
pub mod overlay;
pub mod store;
pub mod telemetry;

pub use catalog::{InodeCatalog, InodeCatalogOptions, InodeCatalogType};
pub use dir::{CaseSensitivity, DirContents, DirEntry, FileType, PathComponent};
pub use error::{OverlayError, Result};
pub use file::{FileStat, OverlayFile};
pub use header::{HEADER_ID_DIR, HEADER_ID_FILE, HEADER_LENGTH};
pub use inode::{InodeNumber, ROOT_INODE};
pub use model::ObjectId;
pub use overlay::{LocalChangeScan, Overlay, OverlayConfig};
pub use telemetry::{NullStructuredLogger, OverlayStats, StructuredLogger};
