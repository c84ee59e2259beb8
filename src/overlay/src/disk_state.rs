//! Reconciliation of out-of-band on-disk changes with the catalog.
//!
//! On hosts where a virtualization layer manages the working copy, entries
//! can change while the overlay is not running: files hydrate into
//! placeholders, placeholders fill with local edits, deletions leave
//! tombstones behind. At startup the overlay walks the observed on-disk
//! state, cross-references the catalog and the source-control tree, and
//! brings the catalog back in line.
//!
//! The decision table, per entry (disk x catalog x source control):
//!
//! | on disk                | catalog | SCM | action                                 |
//! |------------------------|---------|-----|----------------------------------------|
//! | full / dirty / hydrated| any     | any | materialized entry, disk type, no id   |
//! | empty placeholder      | any     | yes | entry with SCM's object identifier     |
//! | tombstone              | any     | any | drop from catalog, recursively         |
//! | renamed placeholder    | any     | any | materialized entry, no id              |
//! | absent                 | present | yes | align identifier with SCM              |
//! | absent                 | present | no  | remove from catalog                    |
//! | absent                 | absent  | yes | add with SCM's object identifier       |
//!
//! After a subtree is processed, every ancestor directory containing a
//! materialized descendant is re-marked materialized.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error};

use crate::catalog::InodeCatalog;
use crate::codec::{OverlayDir, OverlayEntry};
use crate::dir::{CaseSensitivity, FileType, PathComponent, PathMap};
use crate::error::Result;
use crate::inode::{InodeNumber, ROOT_INODE};
use crate::model::ObjectId;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// On-disk state of an entry as left behind by the host virtualization
/// layer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OnDiskState {
    /// Fully local; the virtualization layer no longer tracks it.
    Full,
    /// A placeholder whose direct contents were modified.
    DirtyPlaceholder,
    /// A placeholder whose contents were fetched but not modified.
    HydratedPlaceholder,
    /// A placeholder that was never fetched.
    EmptyPlaceholder,
    /// A deletion marker, visible only while the overlay is not mounted.
    Tombstone,
    /// A placeholder moved to a new location without being populated. The
    /// entry is materialized but reads through source control on access.
    RenamedPlaceholder,
}

/// One observed child of an on-disk directory.
#[derive(Clone, Debug)]
pub struct DiskChild {
    pub name: PathComponent,
    pub file_type: FileType,
    pub state: OnDiskState,
}

/// Adapter over the host virtualization layer's view of the mount.
pub trait DiskStateSource: Send + Sync {
    /// Observed children of the mount-relative directory `path` (empty
    /// string for the mount root).
    fn list_children(&self, path: &str) -> Result<Vec<DiskChild>>;
}

/// One child of a source-control tree.
#[derive(Clone, Debug)]
pub struct ScmTreeEntry {
    pub name: PathComponent,
    pub file_type: FileType,
    pub id: ObjectId,
}

/// Resolves mount-relative paths against the checked-out source-control
/// tree.
pub trait ScmTreeLookup: Send + Sync {
    /// Children of `path` in the tree, or `None` when the path is not a
    /// directory there.
    fn lookup_tree(&self, path: &str) -> Result<Option<Vec<ScmTreeEntry>>>;
}

/// What the reconciliation changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub entries_added: u64,
    pub entries_updated: u64,
    pub entries_removed: u64,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Walks the on-disk state from the mount root and reconciles the catalog
/// with it. New entries draw inode numbers from `next_inode`.
pub fn scan_local_changes(
    catalog: &dyn InodeCatalog,
    disk: &dyn DiskStateSource,
    scm: &dyn ScmTreeLookup,
    next_inode: &AtomicU64,
) -> Result<ScanSummary> {
    let mut summary = ScanSummary::default();
    process_dir(catalog, disk, scm, next_inode, ROOT_INODE, "", &mut summary)?;
    Ok(summary)
}

/// Reconciles one directory; returns whether anything beneath it is
/// materialized, so the caller can re-mark the ancestor chain.
fn process_dir(
    catalog: &dyn InodeCatalog,
    disk: &dyn DiskStateSource,
    scm: &dyn ScmTreeLookup,
    next_inode: &AtomicU64,
    dir_ino: InodeNumber,
    path: &str,
    summary: &mut ScanSummary,
) -> Result<bool> {
    // The virtualization layers that need this reconciliation compare names
    // case-insensitively.
    let mut disk_children: PathMap<DiskChild> = PathMap::new(CaseSensitivity::Insensitive);
    for child in disk.list_children(path)? {
        disk_children.insert(child.name.clone(), child);
    }

    let mut entries: PathMap<OverlayEntry> = PathMap::new(CaseSensitivity::Insensitive);
    if let Some(dir) = catalog.load_directory(dir_ino)? {
        for (name, entry) in dir.entries {
            entries.insert(name, entry);
        }
    }

    let mut scm_children: PathMap<ScmTreeEntry> = PathMap::new(CaseSensitivity::Insensitive);
    if let Some(tree) = scm.lookup_tree(path)? {
        for entry in tree {
            scm_children.insert(entry.name.clone(), entry);
        }
    }

    // Union of every name seen on disk, in the catalog, or in the tree.
    let mut names: Vec<PathComponent> = Vec::new();
    {
        let mut seen: PathMap<()> = PathMap::new(CaseSensitivity::Insensitive);
        for name in disk_children
            .keys()
            .chain(entries.keys())
            .chain(scm_children.keys())
        {
            if seen.insert(name.clone(), ()).is_none() {
                names.push(name.clone());
            }
        }
    }

    let mut changed = false;
    let mut any_materialized = false;

    for name in names {
        let disk_child = disk_children.get(name.as_str()).cloned();
        let scm_entry = scm_children.get(name.as_str()).cloned();
        let existing = entries.get(name.as_str()).cloned();

        // Decide the desired catalog state for this name: Some((type, id))
        // to keep, None to drop.
        let desired: Option<(FileType, Option<ObjectId>)> = match &disk_child {
            Some(child) => match child.state {
                OnDiskState::Full
                | OnDiskState::DirtyPlaceholder
                | OnDiskState::HydratedPlaceholder => Some((child.file_type, None)),
                OnDiskState::RenamedPlaceholder => Some((child.file_type, None)),
                OnDiskState::EmptyPlaceholder => match &scm_entry {
                    Some(scm_entry) => Some((child.file_type, Some(scm_entry.id.clone()))),
                    None => {
                        // A placeholder can only be refilled from source
                        // control; one without a tree entry is unservable.
                        error!(
                            "placeholder present on disk but not in source control: {}/{}",
                            path, name
                        );
                        continue;
                    }
                },
                OnDiskState::Tombstone => None,
            },
            None => match (&existing, &scm_entry) {
                (Some(_), Some(scm_entry)) => {
                    Some((scm_entry.file_type, Some(scm_entry.id.clone())))
                }
                (Some(_), None) => None,
                (None, Some(scm_entry)) => {
                    Some((scm_entry.file_type, Some(scm_entry.id.clone())))
                }
                (None, None) => continue,
            },
        };

        match desired {
            None => {
                if let Some(existing) = existing {
                    debug!("dropping catalog entry {}/{}", path, name);
                    if FileType::from_mode(existing.mode) == FileType::Directory {
                        remove_child_recursively(catalog, existing.inode)?;
                    }
                    entries.remove(name.as_str());
                    changed = true;
                    summary.entries_removed += 1;
                }
            }
            Some((file_type, id)) => {
                let materialized = id.is_none();
                let child_ino = match existing {
                    Some(mut entry) => {
                        let old_type = FileType::from_mode(entry.mode);
                        if old_type != file_type {
                            // The entry changed shape out of band; stale
                            // directory contents must not survive.
                            if old_type == FileType::Directory {
                                remove_child_recursively(catalog, entry.inode)?;
                            }
                            entry.mode = file_type.as_mode(default_permissions(file_type));
                            entry.id = id;
                            changed = true;
                            summary.entries_updated += 1;
                        } else if entry.id != id {
                            entry.id = id;
                            changed = true;
                            summary.entries_updated += 1;
                        }
                        let ino = entry.inode;
                        entries.insert(name.clone(), entry);
                        ino
                    }
                    None => {
                        let ino = InodeNumber::new(next_inode.fetch_add(1, Ordering::AcqRel));
                        debug!("adding catalog entry {}/{} as inode {}", path, name, ino);
                        entries.insert(
                            name.clone(),
                            OverlayEntry {
                                mode: file_type.as_mode(default_permissions(file_type)),
                                inode: ino,
                                id,
                            },
                        );
                        changed = true;
                        summary.entries_added += 1;
                        ino
                    }
                };

                if materialized {
                    any_materialized = true;
                }

                // Local changes can only hide beneath directories that are
                // actually present on disk with fetched contents.
                let recurse = file_type == FileType::Directory
                    && matches!(
                        disk_child.as_ref().map(|child| child.state),
                        Some(OnDiskState::Full)
                            | Some(OnDiskState::DirtyPlaceholder)
                            | Some(OnDiskState::HydratedPlaceholder)
                    );
                if recurse {
                    let child_path = if path.is_empty() {
                        name.as_str().to_string()
                    } else {
                        format!("{}/{}", path, name)
                    };
                    let child_materialized = process_dir(
                        catalog, disk, scm, next_inode, child_ino, &child_path, summary,
                    )?;
                    if child_materialized {
                        any_materialized = true;
                        let entry = entries.get_mut(name.as_str()).unwrap();
                        if entry.id.is_some() {
                            entry.id = None;
                            changed = true;
                            summary.entries_updated += 1;
                        }
                    }
                }
            }
        }
    }

    if changed {
        let mut dir = OverlayDir::new();
        for (name, entry) in entries.iter() {
            dir.entries.push((name.clone(), entry.clone()));
        }
        catalog.save_directory(dir_ino, &dir)?;
    }
    Ok(any_materialized)
}

fn default_permissions(file_type: FileType) -> u32 {
    match file_type {
        FileType::Directory => 0o755,
        FileType::Symlink => 0o777,
        _ => 0o644,
    }
}

/// Drops a directory's records from the catalog, depth first.
fn remove_child_recursively(catalog: &dyn InodeCatalog, ino: InodeNumber) -> Result<()> {
    if let Some(dir) = catalog.load_directory(ino)? {
        for (_, entry) in &dir.entries {
            if FileType::from_mode(entry.mode) == FileType::Directory {
                remove_child_recursively(catalog, entry.inode)?;
            }
        }
    }
    catalog.remove_directory(ino)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemInodeCatalog;
    use std::collections::HashMap;

    struct FakeDisk {
        children: HashMap<String, Vec<DiskChild>>,
    }

    impl FakeDisk {
        fn new() -> Self {
            FakeDisk {
                children: HashMap::new(),
            }
        }

        fn add(&mut self, path: &str, name: &str, file_type: FileType, state: OnDiskState) {
            self.children.entry(path.to_string()).or_default().push(DiskChild {
                name: PathComponent::new(name).unwrap(),
                file_type,
                state,
            });
        }
    }

    impl DiskStateSource for FakeDisk {
        fn list_children(&self, path: &str) -> Result<Vec<DiskChild>> {
            Ok(self.children.get(path).cloned().unwrap_or_default())
        }
    }

    struct FakeScm {
        trees: HashMap<String, Vec<ScmTreeEntry>>,
    }

    impl FakeScm {
        fn new() -> Self {
            FakeScm {
                trees: HashMap::new(),
            }
        }

        fn add(&mut self, path: &str, name: &str, file_type: FileType, id: &[u8]) {
            self.trees.entry(path.to_string()).or_default().push(ScmTreeEntry {
                name: PathComponent::new(name).unwrap(),
                file_type,
                id: ObjectId::from_bytes(id),
            });
        }
    }

    impl ScmTreeLookup for FakeScm {
        fn lookup_tree(&self, path: &str) -> Result<Option<Vec<ScmTreeEntry>>> {
            Ok(self.trees.get(path).cloned())
        }
    }

    fn run(
        catalog: &MemInodeCatalog,
        disk: &FakeDisk,
        scm: &FakeScm,
        next: u64,
    ) -> (ScanSummary, u64) {
        let next_inode = AtomicU64::new(next);
        let summary = scan_local_changes(catalog, disk, scm, &next_inode).unwrap();
        (summary, next_inode.load(Ordering::Acquire))
    }

    fn entry_of(catalog: &MemInodeCatalog, ino: InodeNumber, name: &str) -> Option<OverlayEntry> {
        catalog
            .load_directory(ino)
            .unwrap()
            .and_then(|dir| dir.get(name).cloned())
    }

    #[test]
    fn test_full_file_becomes_materialized_entry() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();
        let mut disk = FakeDisk::new();
        disk.add("", "edited.txt", FileType::Regular, OnDiskState::Full);
        let scm = FakeScm::new();

        let (summary, next) = run(&catalog, &disk, &scm, 2);
        assert_eq!(summary.entries_added, 1);
        assert_eq!(next, 3);

        let entry = entry_of(&catalog, ROOT_INODE, "edited.txt").unwrap();
        assert!(entry.is_materialized());
        assert_eq!(entry.inode, InodeNumber::new(2));
        assert_eq!(FileType::from_mode(entry.mode), FileType::Regular);
    }

    #[test]
    fn test_empty_placeholder_gets_scm_identifier() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();
        let mut disk = FakeDisk::new();
        disk.add(
            "",
            "readme.md",
            FileType::Regular,
            OnDiskState::EmptyPlaceholder,
        );
        let mut scm = FakeScm::new();
        scm.add("", "readme.md", FileType::Regular, b"cafe");

        run(&catalog, &disk, &scm, 2);
        let entry = entry_of(&catalog, ROOT_INODE, "readme.md").unwrap();
        assert_eq!(entry.id, Some(ObjectId::from_bytes(b"cafe")));
    }

    #[test]
    fn test_tombstone_drops_entry_recursively() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();

        // Seed catalog: root -> gone/ -> inner.txt
        let gone = InodeNumber::new(2);
        let mut root = OverlayDir::new();
        root.entries.push((
            PathComponent::new("gone").unwrap(),
            OverlayEntry {
                mode: 0o040755,
                inode: gone,
                id: None,
            },
        ));
        let mut gone_dir = OverlayDir::new();
        gone_dir.entries.push((
            PathComponent::new("inner.txt").unwrap(),
            OverlayEntry {
                mode: 0o100644,
                inode: InodeNumber::new(3),
                id: None,
            },
        ));
        catalog.save_directory(ROOT_INODE, &root).unwrap();
        catalog.save_directory(gone, &gone_dir).unwrap();

        let mut disk = FakeDisk::new();
        disk.add("", "gone", FileType::Directory, OnDiskState::Tombstone);
        let scm = FakeScm::new();

        let (summary, _) = run(&catalog, &disk, &scm, 4);
        assert_eq!(summary.entries_removed, 1);
        assert!(entry_of(&catalog, ROOT_INODE, "gone").is_none());
        assert!(!catalog.has_directory(gone).unwrap());
    }

    #[test]
    fn test_absent_on_disk_aligns_with_scm() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();

        let mut root = OverlayDir::new();
        root.entries.push((
            PathComponent::new("lib.rs").unwrap(),
            OverlayEntry {
                mode: 0o100644,
                inode: InodeNumber::new(2),
                // Stale identifier from before the working copy changed.
                id: Some(ObjectId::from_bytes(b"old")),
            },
        ));
        catalog.save_directory(ROOT_INODE, &root).unwrap();

        let disk = FakeDisk::new();
        let mut scm = FakeScm::new();
        scm.add("", "lib.rs", FileType::Regular, b"new");

        let (summary, _) = run(&catalog, &disk, &scm, 3);
        assert_eq!(summary.entries_updated, 1);
        let entry = entry_of(&catalog, ROOT_INODE, "lib.rs").unwrap();
        assert_eq!(entry.id, Some(ObjectId::from_bytes(b"new")));
        // The inode number is stable across the update.
        assert_eq!(entry.inode, InodeNumber::new(2));
    }

    #[test]
    fn test_absent_everywhere_but_catalog_is_removed() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();

        let mut root = OverlayDir::new();
        root.entries.push((
            PathComponent::new("stale.txt").unwrap(),
            OverlayEntry {
                mode: 0o100644,
                inode: InodeNumber::new(2),
                id: Some(ObjectId::from_bytes(b"dead")),
            },
        ));
        catalog.save_directory(ROOT_INODE, &root).unwrap();

        let disk = FakeDisk::new();
        let scm = FakeScm::new();

        let (summary, _) = run(&catalog, &disk, &scm, 3);
        assert_eq!(summary.entries_removed, 1);
        assert!(entry_of(&catalog, ROOT_INODE, "stale.txt").is_none());
    }

    #[test]
    fn test_scm_only_entry_is_added() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();
        let disk = FakeDisk::new();
        let mut scm = FakeScm::new();
        scm.add("", "tracked.txt", FileType::Regular, b"beef");

        let (summary, _) = run(&catalog, &disk, &scm, 2);
        assert_eq!(summary.entries_added, 1);
        let entry = entry_of(&catalog, ROOT_INODE, "tracked.txt").unwrap();
        assert_eq!(entry.id, Some(ObjectId::from_bytes(b"beef")));
    }

    #[test]
    fn test_renamed_placeholder_is_materialized_without_identifier() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();
        let mut disk = FakeDisk::new();
        disk.add(
            "",
            "moved.txt",
            FileType::Regular,
            OnDiskState::RenamedPlaceholder,
        );
        let mut scm = FakeScm::new();
        scm.add("", "moved.txt", FileType::Regular, b"aaaa");

        run(&catalog, &disk, &scm, 2);
        let entry = entry_of(&catalog, ROOT_INODE, "moved.txt").unwrap();
        assert!(entry.is_materialized());
    }

    #[test]
    fn test_deep_change_rematerializes_ancestors() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();

        // Catalog believes a/ and a/b/ are clean placeholders.
        let a = InodeNumber::new(2);
        let b = InodeNumber::new(3);
        let mut root = OverlayDir::new();
        root.entries.push((
            PathComponent::new("a").unwrap(),
            OverlayEntry {
                mode: 0o040755,
                inode: a,
                id: Some(ObjectId::from_bytes(b"t-a")),
            },
        ));
        let mut a_dir = OverlayDir::new();
        a_dir.entries.push((
            PathComponent::new("b").unwrap(),
            OverlayEntry {
                mode: 0o040755,
                inode: b,
                id: Some(ObjectId::from_bytes(b"t-b")),
            },
        ));
        catalog.save_directory(ROOT_INODE, &root).unwrap();
        catalog.save_directory(a, &a_dir).unwrap();
        catalog.save_directory(b, &OverlayDir::new()).unwrap();

        // On disk, a/ and a/b/ are hydrated and a/b/new.txt is dirty.
        let mut disk = FakeDisk::new();
        disk.add("", "a", FileType::Directory, OnDiskState::HydratedPlaceholder);
        disk.add("a", "b", FileType::Directory, OnDiskState::DirtyPlaceholder);
        disk.add("a/b", "new.txt", FileType::Regular, OnDiskState::Full);
        let mut scm = FakeScm::new();
        scm.add("", "a", FileType::Directory, b"t-a");
        scm.add("a", "b", FileType::Directory, b"t-b");

        let (summary, _) = run(&catalog, &disk, &scm, 4);
        assert_eq!(summary.entries_added, 1);

        // The dirty file forced the whole ancestor chain materialized.
        assert!(entry_of(&catalog, ROOT_INODE, "a").unwrap().is_materialized());
        assert!(entry_of(&catalog, a, "b").unwrap().is_materialized());
        assert!(entry_of(&catalog, b, "new.txt").unwrap().is_materialized());
    }

    #[test]
    fn test_type_change_replaces_stale_directory_contents() {
        let catalog = MemInodeCatalog::new();
        catalog.initialize(true).unwrap();

        // Catalog: thing/ is a directory with a child record.
        let thing = InodeNumber::new(2);
        let mut root = OverlayDir::new();
        root.entries.push((
            PathComponent::new("thing").unwrap(),
            OverlayEntry {
                mode: 0o040755,
                inode: thing,
                id: None,
            },
        ));
        let mut thing_dir = OverlayDir::new();
        thing_dir.entries.push((
            PathComponent::new("old.txt").unwrap(),
            OverlayEntry {
                mode: 0o100644,
                inode: InodeNumber::new(3),
                id: None,
            },
        ));
        catalog.save_directory(ROOT_INODE, &root).unwrap();
        catalog.save_directory(thing, &thing_dir).unwrap();

        // On disk it is now a regular file.
        let mut disk = FakeDisk::new();
        disk.add("", "thing", FileType::Regular, OnDiskState::Full);
        let scm = FakeScm::new();

        let (summary, _) = run(&catalog, &disk, &scm, 4);
        assert_eq!(summary.entries_updated, 1);

        let entry = entry_of(&catalog, ROOT_INODE, "thing").unwrap();
        assert_eq!(FileType::from_mode(entry.mode), FileType::Regular);
        assert!(entry.is_materialized());
        assert!(!catalog.has_directory(thing).unwrap());
    }
}
