use std::cmp::Ordering;
use std::fmt;

use crate::error::{OverlayError, Result};
use crate::inode::InodeNumber;
use crate::model::ObjectId;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Longest permitted directory entry name, in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Whether directory entry names are compared case-sensitively.
///
/// This is fixed when the mount is created and never changes afterwards;
/// every `DirContents` for the mount uses the same comparator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CaseSensitivity {
    Sensitive,
    Insensitive,
}

impl CaseSensitivity {
    /// Compares two entry names under this sensitivity. The insensitive
    /// variant folds ASCII case, which is what the virtualization layers we
    /// sit under do for name collisions.
    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            CaseSensitivity::Sensitive => a.cmp(b),
            CaseSensitivity::Insensitive => {
                let a = a.bytes().map(|c| c.to_ascii_lowercase());
                let b = b.bytes().map(|c| c.to_ascii_lowercase());
                a.cmp(b)
            }
        }
    }
}

/// One component of a path: a directory entry name.
///
/// Guaranteed non-empty, free of path separators and NUL bytes, and at most
/// [`MAX_NAME_LENGTH`] bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PathComponent(String);

impl PathComponent {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty()
            || name.len() > MAX_NAME_LENGTH
            || name.bytes().any(|c| c == b'/' || c == b'\\' || c == 0)
        {
            return Err(OverlayError::InvalidPath(name));
        }
        Ok(PathComponent(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for PathComponent {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// File type classification carried by an entry's mode bits. The type bits
/// are authoritative; permission bits are advisory after creation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileType {
    Directory,
    Regular,
    Symlink,
    Other,
}

impl FileType {
    pub fn from_mode(mode: u32) -> FileType {
        match mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFREG => FileType::Regular,
            S_IFLNK => FileType::Symlink,
            _ => FileType::Other,
        }
    }

    /// A mode value carrying only this type's bits, for entries synthesized
    /// without explicit permissions.
    pub fn as_mode(self, permissions: u32) -> u32 {
        let type_bits = match self {
            FileType::Directory => S_IFDIR,
            FileType::Regular => S_IFREG,
            FileType::Symlink => S_IFLNK,
            FileType::Other => 0,
        };
        type_bits | (permissions & 0o7777)
    }
}

/// An ordered map keyed by path component, with the comparator fixed by the
/// mount's case sensitivity.
#[derive(Debug)]
pub struct PathMap<V> {
    case_sensitivity: CaseSensitivity,
    entries: Vec<(PathComponent, V)>,
}

impl<V> PathMap<V> {
    pub fn new(case_sensitivity: CaseSensitivity) -> Self {
        PathMap {
            case_sensitivity,
            entries: Vec::new(),
        }
    }

    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.case_sensitivity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|(key, _)| self.case_sensitivity.compare(key.as_str(), name))
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.position(name).ok().map(|idx| &self.entries[idx].1)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        match self.position(name) {
            Ok(idx) => Some(&mut self.entries[idx].1),
            Err(_) => None,
        }
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.position(name).is_ok()
    }

    /// Inserts an entry, replacing and returning any entry already stored
    /// under an equivalent name.
    pub fn insert(&mut self, name: PathComponent, value: V) -> Option<V> {
        match self.position(name.as_str()) {
            Ok(idx) => {
                let (_, old) = std::mem::replace(&mut self.entries[idx], (name, value));
                Some(old)
            }
            Err(idx) => {
                self.entries.insert(idx, (name, value));
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<V> {
        match self.position(name) {
            Ok(idx) => Some(self.entries.remove(idx).1),
            Err(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathComponent, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PathComponent, &mut V)> {
        self.entries.iter_mut().map(|(k, v)| (&*k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &PathComponent> {
        self.entries.iter().map(|(k, _)| k)
    }
}

/// A single child of a directory.
///
/// The entry either carries the object identifier of the source-control
/// object its contents still match, or nothing when it has diverged and its
/// authoritative contents live in the overlay (a *materialized* entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Mode bits recorded when the entry was created. The type bits never
    /// change; the permission bits are not updated on chmod.
    initial_mode: u32,

    /// Inode number for this entry. Always nonzero.
    inode: InodeNumber,

    /// The source-control object this entry still matches, or `None` once
    /// the entry is materialized.
    id: Option<ObjectId>,
}

impl DirEntry {
    /// Creates a non-materialized entry referencing a source-control object.
    pub fn new(initial_mode: u32, inode: InodeNumber, id: ObjectId) -> Self {
        DirEntry {
            initial_mode,
            inode,
            id: Some(id),
        }
    }

    /// Creates a materialized entry.
    pub fn new_materialized(initial_mode: u32, inode: InodeNumber) -> Self {
        DirEntry {
            initial_mode,
            inode,
            id: None,
        }
    }

    pub fn initial_mode(&self) -> u32 {
        self.initial_mode
    }

    pub fn inode(&self) -> InodeNumber {
        self.inode
    }

    pub fn object_id(&self) -> Option<&ObjectId> {
        self.id.as_ref()
    }

    pub fn is_materialized(&self) -> bool {
        self.id.is_none()
    }

    pub fn set_materialized(&mut self) {
        self.id = None;
    }

    pub fn set_dematerialized(&mut self, id: ObjectId) {
        self.id = Some(id);
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.initial_mode)
    }

    pub fn is_directory(&self) -> bool {
        self.file_type() == FileType::Directory
    }
}

/// The contents of one directory in the overlay.
pub type DirContents = PathMap<DirEntry>;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
