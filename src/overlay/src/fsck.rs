//! Post-crash consistency checking and repair.
//!
//! The checker runs when the catalog cannot produce a cleanly persisted
//! next-inode-number, or on demand. It never aborts on a single problem: the
//! scan pass accumulates everything it finds, and the repair pass resolves
//! each problem while preserving damaged data in a `lost+found` area beside
//! the overlay.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info, warn};

use crate::catalog::InodeCatalog;
use crate::codec::OverlayDir;
use crate::dir::{FileType, PathComponent};
use crate::error::{OverlayError, Result};
use crate::header::{Header, HEADER_ID_FILE, HEADER_LENGTH};
use crate::inode::{InodeNumber, ROOT_INODE};
use crate::store::FsFileContentStore;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Scan progress, reported through the progress callback at the configured
/// frequency.
#[derive(Debug, Clone, Copy)]
pub struct FsckProgress {
    pub scanned: u64,
    pub total: u64,
}

pub type ProgressCallback = Box<dyn Fn(FsckProgress) + Send + Sync>;

/// A problem detected by the scan pass.
#[derive(Debug, Clone)]
pub enum FsckError {
    /// A materialized directory entry names an inode with no catalog record.
    MissingMaterializedDir(InodeNumber),
    /// A materialized file entry names an inode with no recorded body.
    MissingMaterializedFile(InodeNumber),
    /// A catalog record exists but cannot be decoded.
    CorruptDirRecord(InodeNumber, String),
    /// A file body exists but its integrity header is unreadable or wrong.
    CorruptFile(InodeNumber, String),
    /// A directory record unreachable from the root.
    OrphanDir(InodeNumber),
    /// A file body unreachable from the root.
    OrphanFile(InodeNumber),
    /// An inode referenced by more than one directory entry.
    HardLink(InodeNumber),
    /// The persisted next inode number lags what is actually in use.
    BadNextInodeNumber {
        read: Option<u64>,
        should_be: u64,
    },
    /// A directory entry still carries an object identifier although the
    /// directory has materialized descendants on disk.
    StaleObjectId {
        parent: InodeNumber,
        name: PathComponent,
    },
}

/// A path rendered relative to the deepest ancestor the checker could
/// resolve: the root, or the top of an unreachable subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodePath {
    pub root: InodeNumber,
    pub parts: Vec<PathComponent>,
}

impl std::fmt::Display for InodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.root == ROOT_INODE {
            if self.parts.is_empty() {
                return write!(f, "/");
            }
            let mut first = true;
            for part in &self.parts {
                if !first {
                    write!(f, "/")?;
                }
                first = false;
                write!(f, "{}", part)?;
            }
            Ok(())
        } else {
            write!(f, "[unlinked({})]", self.root)?;
            for part in &self.parts {
                write!(f, "/{}", part)?;
            }
            Ok(())
        }
    }
}

/// Outcome of a repair pass.
#[derive(Debug)]
pub struct RepairResult {
    pub repair_dir: PathBuf,
    pub total_errors: usize,
    pub fixed_errors: usize,
}

pub struct OverlayChecker<'a> {
    catalog: &'a dyn InodeCatalog,
    store: &'a FsFileContentStore,
    stored_next_inode: Option<InodeNumber>,
    fsck_threads: usize,
    progress_interval: u64,

    errors: Vec<FsckError>,
    /// Every decodable directory record.
    dirs: HashMap<InodeNumber, OverlayDir>,
    /// Directory records that exist but failed to decode.
    corrupt_dirs: HashSet<InodeNumber>,
    /// Observed parent references: child -> [(parent, name)].
    parents: HashMap<InodeNumber, Vec<(InodeNumber, PathComponent)>>,
    /// Every recorded file body.
    files: HashSet<InodeNumber>,
    max_inode: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<'a> OverlayChecker<'a> {
    pub fn new(
        catalog: &'a dyn InodeCatalog,
        store: &'a FsFileContentStore,
        stored_next_inode: Option<InodeNumber>,
        fsck_threads: usize,
        progress_interval: u64,
    ) -> Self {
        OverlayChecker {
            catalog,
            store,
            stored_next_inode,
            fsck_threads: fsck_threads.max(1),
            progress_interval,
            errors: Vec::new(),
            dirs: HashMap::new(),
            corrupt_dirs: HashSet::new(),
            parents: HashMap::new(),
            files: HashSet::new(),
            max_inode: ROOT_INODE.get(),
        }
    }

    pub fn errors(&self) -> &[FsckError] {
        &self.errors
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|err| self.describe(err)).collect()
    }

    /// The corrected next inode number: one past the highest inode observed
    /// anywhere in the catalog or the content store.
    pub fn next_inode_number(&self) -> InodeNumber {
        InodeNumber::new(self.max_inode + 1)
    }

    //----------------------------------------------------------------------------------------------
    // Scan pass
    //----------------------------------------------------------------------------------------------

    pub fn scan_for_errors(&mut self, progress: Option<&ProgressCallback>) -> Result<()> {
        let mut dir_inos = self.catalog.list_directories()?;
        dir_inos.sort();
        let mut file_inos = self.store.list_files()?;
        file_inos.sort();

        let total = (dir_inos.len() + file_inos.len()) as u64;
        let scanned = AtomicU64::new(0);
        let interval = self.progress_interval;
        let report = move |count: u64| {
            if let Some(progress) = progress {
                if interval > 0 && count % interval == 0 {
                    progress(FsckProgress {
                        scanned: count,
                        total,
                    });
                }
            }
        };

        // Phase 1a: decode every directory record, fanned out across the
        // configured number of scan threads.
        let dir_results: Mutex<Vec<(InodeNumber, Result<Option<OverlayDir>>)>> =
            Mutex::new(Vec::with_capacity(dir_inos.len()));
        let chunk_size = dir_inos.len().div_ceil(self.fsck_threads).max(1);
        std::thread::scope(|scope| {
            for chunk in dir_inos.chunks(chunk_size) {
                let dir_results = &dir_results;
                let scanned = &scanned;
                let report = &report;
                let catalog = self.catalog;
                scope.spawn(move || {
                    let mut local = Vec::with_capacity(chunk.len());
                    for &ino in chunk {
                        local.push((ino, catalog.load_directory(ino)));
                        report(scanned.fetch_add(1, Ordering::Relaxed) + 1);
                    }
                    dir_results.lock().unwrap().extend(local);
                });
            }
        });

        let mut dir_results = dir_results.into_inner().unwrap();
        dir_results.sort_by_key(|(ino, _)| *ino);
        for (ino, result) in dir_results {
            self.max_inode = self.max_inode.max(ino.get());
            match result {
                Ok(Some(dir)) => {
                    self.dirs.insert(ino, dir);
                }
                Ok(None) => {}
                Err(OverlayError::Corrupt { reason, .. }) => {
                    self.corrupt_dirs.insert(ino);
                    self.errors.push(FsckError::CorruptDirRecord(ino, reason));
                }
                Err(err) => {
                    self.corrupt_dirs.insert(ino);
                    self.errors
                        .push(FsckError::CorruptDirRecord(ino, err.to_string()));
                }
            }
        }

        // Phase 1b: verify the header of every recorded file body.
        for &ino in &file_inos {
            self.max_inode = self.max_inode.max(ino.get());
            self.files.insert(ino);
            if let Err(reason) = self.check_file_header(ino) {
                self.errors.push(FsckError::CorruptFile(ino, reason));
            }
            report(scanned.fetch_add(1, Ordering::Relaxed) + 1);
        }

        // Phase 2: reconstruct the parent graph and cross-check it.
        self.build_parent_graph();
        self.check_missing_records();
        self.check_orphans_and_hard_links();
        self.check_stale_object_ids();
        self.check_next_inode_number();
        Ok(())
    }

    fn check_file_header(&self, ino: InodeNumber) -> std::result::Result<(), String> {
        let mut file = self
            .store
            .open_file_no_verify(ino)
            .map_err(|err| err.to_string())?;
        let mut buf = [0u8; HEADER_LENGTH];
        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..]).map_err(|err| err.to_string())? {
                0 => break,
                n => read += n,
            }
        }
        Header::parse(&buf[..read])?.check(HEADER_ID_FILE, ino)
    }

    fn build_parent_graph(&mut self) {
        let mut inos: Vec<_> = self.dirs.keys().copied().collect();
        inos.sort();
        for parent in inos {
            let dir = &self.dirs[&parent];
            for (name, entry) in &dir.entries {
                self.max_inode = self.max_inode.max(entry.inode.get());
                self.parents
                    .entry(entry.inode)
                    .or_default()
                    .push((parent, name.clone()));
            }
        }
        for links in self.parents.values_mut() {
            links.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        }
    }

    fn check_missing_records(&mut self) {
        let mut inos: Vec<_> = self.dirs.keys().copied().collect();
        inos.sort();
        for parent in inos {
            for (_, entry) in &self.dirs[&parent].entries {
                if !entry.is_materialized() {
                    continue;
                }
                match FileType::from_mode(entry.mode) {
                    FileType::Directory => {
                        if !self.dirs.contains_key(&entry.inode)
                            && !self.corrupt_dirs.contains(&entry.inode)
                        {
                            self.errors
                                .push(FsckError::MissingMaterializedDir(entry.inode));
                        }
                    }
                    _ => {
                        if !self.files.contains(&entry.inode) {
                            self.errors
                                .push(FsckError::MissingMaterializedFile(entry.inode));
                        }
                    }
                }
            }
        }
    }

    fn reachable_set(&self) -> HashSet<InodeNumber> {
        let mut reachable = HashSet::new();
        let mut queue = vec![ROOT_INODE];
        reachable.insert(ROOT_INODE);
        while let Some(ino) = queue.pop() {
            if let Some(dir) = self.dirs.get(&ino) {
                for (_, entry) in &dir.entries {
                    if reachable.insert(entry.inode)
                        && FileType::from_mode(entry.mode) == FileType::Directory
                    {
                        queue.push(entry.inode);
                    }
                }
            }
        }
        reachable
    }

    fn check_orphans_and_hard_links(&mut self) {
        let reachable = self.reachable_set();

        let mut candidates: Vec<_> = self
            .dirs
            .keys()
            .copied()
            .chain(self.files.iter().copied())
            .collect();
        candidates.sort();
        candidates.dedup();
        for ino in candidates {
            if ino == ROOT_INODE || reachable.contains(&ino) {
                continue;
            }
            // Only the top of an unreachable subtree is reported; its
            // descendants are archived and removed along with it.
            if self.parents.contains_key(&ino) {
                continue;
            }
            if self.dirs.contains_key(&ino) || self.corrupt_dirs.contains(&ino) {
                self.errors.push(FsckError::OrphanDir(ino));
            } else {
                self.errors.push(FsckError::OrphanFile(ino));
            }
        }

        let mut linked: Vec<_> = self
            .parents
            .iter()
            .filter(|(_, links)| links.len() > 1)
            .map(|(ino, _)| *ino)
            .collect();
        linked.sort();
        for ino in linked {
            self.errors.push(FsckError::HardLink(ino));
        }
    }

    fn subtree_has_materialized(
        &self,
        ino: InodeNumber,
        memo: &mut HashMap<InodeNumber, bool>,
        visiting: &mut HashSet<InodeNumber>,
    ) -> bool {
        if let Some(&known) = memo.get(&ino) {
            return known;
        }
        if !visiting.insert(ino) {
            return false;
        }
        let mut result = false;
        if let Some(dir) = self.dirs.get(&ino) {
            for (_, entry) in &dir.entries {
                if entry.is_materialized() {
                    result = true;
                    break;
                }
            }
            if !result {
                for (_, entry) in &dir.entries {
                    if FileType::from_mode(entry.mode) == FileType::Directory
                        && self.subtree_has_materialized(entry.inode, memo, visiting)
                    {
                        result = true;
                        break;
                    }
                }
            }
        }
        visiting.remove(&ino);
        memo.insert(ino, result);
        result
    }

    fn check_stale_object_ids(&mut self) {
        let reachable = self.reachable_set();
        let mut memo = HashMap::new();
        let mut inos: Vec<_> = self.dirs.keys().copied().collect();
        inos.sort();
        let mut found = Vec::new();
        for parent in inos {
            if !reachable.contains(&parent) {
                continue;
            }
            for (name, entry) in &self.dirs[&parent].entries {
                if entry.is_materialized()
                    || FileType::from_mode(entry.mode) != FileType::Directory
                    || !self.dirs.contains_key(&entry.inode)
                {
                    continue;
                }
                let mut visiting = HashSet::new();
                if self.subtree_has_materialized(entry.inode, &mut memo, &mut visiting) {
                    found.push(FsckError::StaleObjectId {
                        parent,
                        name: name.clone(),
                    });
                }
            }
        }
        self.errors.extend(found);
    }

    fn check_next_inode_number(&mut self) {
        let should_be = self.max_inode + 1;
        let read = self.stored_next_inode.map(|ino| ino.get());
        if read.unwrap_or(0) < should_be {
            self.errors.push(FsckError::BadNextInodeNumber { read, should_be });
        }
    }

    //----------------------------------------------------------------------------------------------
    // Path computation
    //----------------------------------------------------------------------------------------------

    /// Resolves an inode to a path from the root, or from the top of its
    /// unreachable subtree when no route to the root exists.
    pub fn compute_path(&self, ino: InodeNumber) -> InodePath {
        let mut parts = Vec::new();
        let mut current = ino;
        let mut seen = HashSet::new();
        loop {
            if current == ROOT_INODE || !seen.insert(current) {
                break;
            }
            match self.parents.get(&current).and_then(|links| links.first()) {
                Some((parent, name)) => {
                    parts.push(name.clone());
                    current = *parent;
                }
                None => break,
            }
        }
        parts.reverse();
        InodePath {
            root: current,
            parts,
        }
    }

    /// The path of a prospective child of `parent`.
    pub fn compute_member_path(&self, parent: InodeNumber, name: &PathComponent) -> InodePath {
        let mut path = self.compute_path(parent);
        path.parts.push(name.clone());
        path
    }

    fn describe(&self, err: &FsckError) -> String {
        match err {
            FsckError::MissingMaterializedDir(ino) => format!(
                "missing overlay file for materialized directory inode {} ({})",
                ino,
                self.compute_path(*ino)
            ),
            FsckError::MissingMaterializedFile(ino) => format!(
                "missing overlay file for materialized file inode {} ({})",
                ino,
                self.compute_path(*ino)
            ),
            FsckError::CorruptDirRecord(ino, reason) | FsckError::CorruptFile(ino, reason) => {
                format!("error reading data for inode {}: {}", ino, reason)
            }
            FsckError::OrphanDir(ino) => format!("found orphan directory inode {}", ino),
            FsckError::OrphanFile(ino) => format!("found orphan file inode {}", ino),
            FsckError::HardLink(ino) => {
                let mut paths: Vec<String> = self
                    .parents
                    .get(ino)
                    .map(|links| {
                        links
                            .iter()
                            .map(|(parent, name)| {
                                self.compute_member_path(*parent, name).to_string()
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                paths.sort();
                let mut message = format!("found hard linked inode {}:", ino);
                for path in paths {
                    message.push_str("\n- ");
                    message.push_str(&path);
                }
                message
            }
            FsckError::BadNextInodeNumber { read, should_be } => match read {
                Some(read) => format!(
                    "bad stored next inode number: read {} but should be at least {}",
                    read, should_be
                ),
                None => format!(
                    "bad stored next inode number: no value recorded but should be at least {}",
                    should_be
                ),
            },
            FsckError::StaleObjectId { parent, name } => format!(
                "directory entry {} carries an object identifier but has materialized descendants",
                self.compute_member_path(*parent, name)
            ),
        }
    }

    //----------------------------------------------------------------------------------------------
    // Repair pass
    //----------------------------------------------------------------------------------------------

    /// Repairs every detected problem. Returns `None` when the scan found
    /// nothing to repair; otherwise the repair directory holds `fsck.log`
    /// and the `lost+found` archive.
    pub fn repair_errors(&mut self) -> Result<Option<RepairResult>> {
        if self.errors.is_empty() {
            return Ok(None);
        }

        let repair_dir = create_repair_dir(self.store.local_dir())?;
        let lost_found = repair_dir.join("lost+found");
        fs::create_dir_all(&lost_found)?;
        let mut log = File::create(repair_dir.join("fsck.log"))?;

        writeln!(
            log,
            "Beginning fsck repair of overlay {}",
            self.store.local_dir().display()
        )?;
        writeln!(log, "{} problems detected", self.errors.len())?;

        let errors = self.errors.clone();
        let total = errors.len();
        let mut fixed = 0usize;
        for err in &errors {
            let message = self.describe(err);
            writeln!(log, "repairing: {}", message)?;
            match self.repair_one(err, &lost_found) {
                Ok(()) => fixed += 1,
                Err(repair_err) => {
                    error!("failed to repair overlay problem ({}): {}", message, repair_err);
                    writeln!(log, "  repair failed: {}", repair_err)?;
                }
            }
        }

        if fixed == total {
            writeln!(log, "successfully repaired all {} problems", total)?;
        } else {
            writeln!(log, "repaired {} of {} problems", fixed, total)?;
        }
        info!(
            "fsck repaired {} of {} problems; details in {}",
            fixed,
            total,
            repair_dir.display()
        );

        Ok(Some(RepairResult {
            repair_dir,
            total_errors: total,
            fixed_errors: fixed,
        }))
    }

    fn repair_one(&mut self, err: &FsckError, lost_found: &Path) -> Result<()> {
        match err {
            FsckError::CorruptDirRecord(ino, _) => {
                // The undecodable blob is preserved wherever the inode sits.
                if let Some(raw) = self.catalog.load_directory_raw(*ino)? {
                    self.archive_bytes(lost_found, *ino, &raw)?;
                }
                if self.compute_path(*ino).root != ROOT_INODE {
                    // Part of an unreachable subtree; its removal covers
                    // the record itself.
                    return Ok(());
                }
                self.catalog.save_directory(*ino, &OverlayDir::new())?;
                self.dirs.insert(*ino, OverlayDir::new());
                Ok(())
            }
            FsckError::MissingMaterializedDir(ino) => {
                if self.compute_path(*ino).root != ROOT_INODE {
                    return Ok(());
                }
                self.catalog.save_directory(*ino, &OverlayDir::new())?;
                self.dirs.insert(*ino, OverlayDir::new());
                Ok(())
            }
            FsckError::MissingMaterializedFile(ino) => {
                if self.compute_path(*ino).root != ROOT_INODE {
                    return Ok(());
                }
                self.store.create_overlay_file(*ino, b"")?;
                self.files.insert(*ino);
                Ok(())
            }
            FsckError::CorruptFile(ino, _) => self.repair_corrupt_file(*ino, lost_found),
            FsckError::OrphanDir(ino) => {
                // An undecodable orphan root was already preserved verbatim
                // when its corrupt record was handled.
                if !self.corrupt_dirs.contains(ino) {
                    let dest = lost_found.join(format!("{}", ino));
                    self.archive_subtree(*ino, &dest)?;
                }
                self.remove_subtree(*ino);
                Ok(())
            }
            FsckError::OrphanFile(ino) => {
                let bytes = self.file_archive_bytes(*ino)?;
                write_archive_file(&lost_found.join(format!("{}", ino)), &bytes)?;
                self.store.remove_overlay_file(*ino)?;
                self.files.remove(ino);
                Ok(())
            }
            FsckError::HardLink(ino) => self.repair_hard_link(*ino),
            FsckError::BadNextInodeNumber { .. } => {
                // The corrected value is served by next_inode_number() and
                // persisted on the next clean shutdown.
                Ok(())
            }
            FsckError::StaleObjectId { parent, name } => {
                let Some(dir) = self.dirs.get_mut(parent) else {
                    return Ok(());
                };
                for (entry_name, entry) in dir.entries.iter_mut() {
                    if entry_name == name {
                        entry.id = None;
                    }
                }
                let updated = dir.clone();
                self.catalog.save_directory(*parent, &updated)?;
                Ok(())
            }
        }
    }

    fn repair_corrupt_file(&mut self, ino: InodeNumber, lost_found: &Path) -> Result<()> {
        if self.compute_path(ino).root != ROOT_INODE {
            // Archived raw as part of its unreachable subtree.
            return Ok(());
        }
        let raw = self.store.read_raw(ino)?;
        self.archive_bytes(lost_found, ino, &raw)?;
        self.store.remove_overlay_file(ino)?;
        self.store.create_overlay_file(ino, b"")?;
        Ok(())
    }

    fn repair_hard_link(&mut self, ino: InodeNumber) -> Result<()> {
        let Some(links) = self.parents.get(&ino).cloned() else {
            return Ok(());
        };
        if links.len() < 2 {
            return Ok(());
        }
        let mut by_path: Vec<(String, InodeNumber, PathComponent)> = links
            .iter()
            .map(|(parent, name)| {
                (
                    self.compute_member_path(*parent, name).to_string(),
                    *parent,
                    name.clone(),
                )
            })
            .collect();
        by_path.sort();

        // The first path is the canonical location; the rest are unlinked.
        let keep = by_path.remove(0);
        for (_, parent, name) in by_path {
            if let Some(dir) = self.dirs.get_mut(&parent) {
                dir.entries.retain(|(entry_name, _)| *entry_name != name);
                let updated = dir.clone();
                self.catalog.save_directory(parent, &updated)?;
            }
        }
        self.parents.insert(ino, vec![(keep.1, keep.2)]);
        Ok(())
    }

    /// Archives raw bytes for an inode at its path under `lost+found`.
    fn archive_bytes(&self, lost_found: &Path, ino: InodeNumber, bytes: &[u8]) -> Result<()> {
        let path = self.compute_path(ino);
        let mut dest = lost_found.join(format!("{}", path.root));
        for part in &path.parts {
            dest = dest.join(part.as_str());
        }
        write_archive_file(&dest, bytes)
    }

    /// The bytes to preserve for a recorded file: the logical contents when
    /// the header is intact, the whole file verbatim when it is not.
    fn file_archive_bytes(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let raw = self.store.read_raw(ino)?;
        let intact = Header::parse(&raw)
            .map(|header| header.check(HEADER_ID_FILE, ino).is_ok())
            .unwrap_or(false);
        if intact {
            Ok(raw[HEADER_LENGTH..].to_vec())
        } else {
            Ok(raw)
        }
    }

    fn archive_subtree(&self, root: InodeNumber, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        let Some(dir) = self.dirs.get(&root) else {
            return Ok(());
        };
        for (name, entry) in &dir.entries {
            let child_dest = dest.join(name.as_str());
            if FileType::from_mode(entry.mode) == FileType::Directory {
                if self.dirs.contains_key(&entry.inode) {
                    self.archive_subtree(entry.inode, &child_dest)?;
                }
            } else if self.files.contains(&entry.inode) {
                let bytes = self.file_archive_bytes(entry.inode)?;
                write_archive_file(&child_dest, &bytes)?;
            }
        }
        Ok(())
    }

    fn remove_subtree(&mut self, root: InodeNumber) {
        let mut queue = vec![root];
        while let Some(ino) = queue.pop() {
            if let Some(dir) = self.dirs.remove(&ino) {
                for (_, entry) in &dir.entries {
                    if FileType::from_mode(entry.mode) == FileType::Directory {
                        queue.push(entry.inode);
                    } else if self.files.remove(&entry.inode) {
                        if let Err(err) = self.store.remove_overlay_file(entry.inode) {
                            warn!(
                                "failed to remove reclaimed file inode {}: {}",
                                entry.inode, err
                            );
                        }
                    }
                }
            }
            if self.files.remove(&ino) {
                if let Err(err) = self.store.remove_overlay_file(ino) {
                    warn!("failed to remove reclaimed file inode {}: {}", ino, err);
                }
            }
            self.corrupt_dirs.remove(&ino);
            if let Err(err) = self.catalog.remove_directory(ino) {
                warn!("failed to remove reclaimed directory inode {}: {}", ino, err);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn write_archive_file(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, bytes)?;
    Ok(())
}

/// Creates `fsck-repair-<timestamp>` beside the overlay directory, adding a
/// numeric suffix when a previous repair ran within the same second.
fn create_repair_dir(overlay_dir: &Path) -> Result<PathBuf> {
    let parent = overlay_dir.parent().unwrap_or_else(|| Path::new("."));
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    for attempt in 0..256 {
        let name = if attempt == 0 {
            format!("fsck-repair-{}", timestamp)
        } else {
            format!("fsck-repair-{}.{}", timestamp, attempt)
        };
        let path = parent.join(name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "unable to create a unique fsck repair directory",
    )
    .into())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
