//! The overlay facade: lifecycle, I/O gating, the reclamation worker, and
//! the public operations the mount layer uses.
//!
//! The overlay records everything that diverges from the source-control
//! tree. Mutating a path materializes it: each ancestor directory's record
//! is updated through this type, and file contents land in the content
//! store under the entry's inode number.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, warn};
use tokio::sync::oneshot;

use crate::catalog::{
    make_inode_catalog, InodeCatalog, InodeCatalogOptions, InodeCatalogType,
};
use crate::codec::{OverlayDir, OverlayEntry};
use crate::dir::{CaseSensitivity, DirContents, DirEntry, FileType, PathComponent};
use crate::disk_state::{self, DiskStateSource, ScmTreeLookup};
use crate::error::{check_invariant, OverlayError, Result};
use crate::file::OverlayFile;
use crate::fsck::{OverlayChecker, ProgressCallback};
use crate::inode::InodeNumber;
use crate::metadata::{metadata_table_path, InodeMetadataTable};
use crate::store::FsFileContentStore;
use crate::telemetry::{FsckEvent, OverlayStats, StructuredLogger};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

// One atomic word carries both the closed flag and the in-flight request
// count, so "check closed and start I/O" is a single atomic action.
const IO_CLOSED_MASK: u64 = 1 << 63;
const IO_COUNT_MASK: u64 = !IO_CLOSED_MASK;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration fixed when the overlay is created.
pub struct OverlayConfig {
    pub case_sensitivity: CaseSensitivity,
    pub catalog_type: InodeCatalogType,
    pub catalog_options: InodeCatalogOptions,
    /// Byte budget for the buffered catalog decorator.
    pub buffer_size: usize,
    /// Silently drop `._*` entries on hosts where they are filesystem
    /// metadata side-channel files.
    pub filter_apple_double: bool,
    /// Parallelism for the consistency checker's scan phase.
    pub fsck_threads: usize,
    /// How often the consistency checker reports progress, in inodes.
    pub log_repair_frequency: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            case_sensitivity: CaseSensitivity::Sensitive,
            catalog_type: InodeCatalogType::Sqlite,
            catalog_options: InodeCatalogOptions::empty(),
            buffer_size: 64 * 1024 * 1024,
            filter_apple_double: false,
            fsck_threads: 4,
            log_repair_frequency: 10_000,
        }
    }
}

/// Adapters for reconciling out-of-band on-disk changes during
/// initialization, on hosts whose virtualization layer mutates the working
/// copy while the overlay is not running.
pub struct LocalChangeScan {
    pub disk: Arc<dyn DiskStateSource>,
    pub scm: Arc<dyn ScmTreeLookup>,
}

/// A request for the background reclamation thread.
enum GcRequest {
    /// Recursively forget overlay data underneath the given directory.
    Reclaim(OverlayDir),
    /// Complete the promise; used to synchronize with the worker.
    Flush(oneshot::Sender<()>),
    /// Run the catalog's periodic upkeep.
    Maintenance,
    Stop,
}

/// A posted-once event a thread can wait on.
struct Baton {
    posted: Mutex<bool>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Baton {
            posted: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn post(&self) {
        *self.posted.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut posted = self.posted.lock().unwrap();
        while !*posted {
            posted = self.cv.wait(posted).unwrap();
        }
    }
}

pub struct Overlay {
    inode_catalog: Box<dyn InodeCatalog>,
    file_content_store: FsFileContentStore,

    /// Whether the catalog prefers fine-grained child operations over
    /// whole-directory rewrites.
    supports_semantic_operations: bool,
    filter_apple_double: bool,
    case_sensitivity: CaseSensitivity,
    local_dir: PathBuf,
    fsck_threads: usize,
    log_repair_frequency: u64,

    /// The next inode number to allocate. Zero until initialization
    /// completes; never 1.
    next_inode_number: AtomicU64,

    /// Closed bit plus in-flight request count; see the masks above.
    outstanding_io: AtomicU64,
    last_io_done: Baton,
    close_started: AtomicBool,

    gc_sender: Sender<GcRequest>,
    gc_receiver: Mutex<Option<Receiver<GcRequest>>>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,

    metadata: Mutex<Option<Arc<InodeMetadataTable>>>,

    had_clean_startup: AtomicBool,
    stats: Arc<OverlayStats>,
    logger: Arc<dyn StructuredLogger>,
}

/// Scoped guard counting one in-flight overlay operation. Construction
/// fails once the overlay is closed; the last guard to drop after the
/// closed-bit transition wakes the closing thread.
pub(crate) struct IoRequest<'a> {
    overlay: &'a Overlay,
}

impl<'a> IoRequest<'a> {
    pub(crate) fn new(overlay: &'a Overlay) -> Result<Self> {
        if overlay.try_inc_outstanding_io() {
            Ok(IoRequest { overlay })
        } else {
            Err(OverlayError::Closed)
        }
    }
}

impl Drop for IoRequest<'_> {
    fn drop(&mut self) {
        self.overlay.dec_outstanding_io();
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Overlay {
    /// Creates a new overlay over the given local directory. Callers must
    /// run `initialize` and wait for it before using any other method.
    pub fn create(
        local_dir: impl Into<PathBuf>,
        config: OverlayConfig,
        logger: Arc<dyn StructuredLogger>,
        stats: Arc<OverlayStats>,
    ) -> Arc<Overlay> {
        let local_dir = local_dir.into();
        let catalog = make_inode_catalog(
            &local_dir,
            config.catalog_type,
            config.catalog_options,
            config.buffer_size,
        );
        Self::create_with_catalog(local_dir, catalog, config, logger, stats)
    }

    fn create_with_catalog(
        local_dir: PathBuf,
        inode_catalog: Box<dyn InodeCatalog>,
        config: OverlayConfig,
        logger: Arc<dyn StructuredLogger>,
        stats: Arc<OverlayStats>,
    ) -> Arc<Overlay> {
        let supports_semantic_operations = inode_catalog.supports_semantic_operations();
        let file_content_store = FsFileContentStore::new(&local_dir);
        let (gc_sender, gc_receiver) = unbounded();
        Arc::new(Overlay {
            inode_catalog,
            file_content_store,
            supports_semantic_operations,
            filter_apple_double: config.filter_apple_double,
            case_sensitivity: config.case_sensitivity,
            local_dir,
            fsck_threads: config.fsck_threads,
            log_repair_frequency: config.log_repair_frequency,
            next_inode_number: AtomicU64::new(0),
            outstanding_io: AtomicU64::new(0),
            last_io_done: Baton::new(),
            close_started: AtomicBool::new(false),
            gc_sender,
            gc_receiver: Mutex::new(Some(gc_receiver)),
            gc_thread: Mutex::new(None),
            metadata: Mutex::new(None),
            had_clean_startup: AtomicBool::new(false),
            stats,
            logger,
        })
    }

    /// Initializes the overlay on the background worker thread, running the
    /// consistency checker when the previous shutdown was unclean. The
    /// returned future resolves once the overlay is usable.
    pub fn initialize(
        self: &Arc<Self>,
        local_scan: Option<LocalChangeScan>,
        progress: Option<ProgressCallback>,
    ) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let receiver = self.gc_receiver.lock().unwrap().take();
        let Some(receiver) = receiver else {
            let _ = tx.send(Err(OverlayError::InvariantViolation(
                "overlay initialized twice".into(),
            )));
            return rx;
        };

        // Initialization may be slow (it can run a full fsck), so it happens
        // on the reclamation thread rather than the caller's.
        let overlay = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("overlay-gc".into())
            .spawn(move || {
                let result = overlay.init_overlay(local_scan, progress);
                let ok = result.is_ok();
                let _ = tx.send(result);
                if ok {
                    overlay.gc_loop(&receiver);
                }
            })
            .expect("failed to spawn overlay reclamation thread");
        *self.gc_thread.lock().unwrap() = Some(handle);
        rx
    }

    fn init_overlay(
        &self,
        local_scan: Option<LocalChangeScan>,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let _io = IoRequest::new(self)?;
        let mut next_inode = self.inode_catalog.initialize(true)?;
        self.file_content_store.initialize(true)?;

        if next_inode.is_none() {
            // No cleanly persisted next-inode-number: the previous shutdown
            // did not complete, so the on-disk state cannot be trusted.
            warn!(
                "overlay {} was not shut down cleanly; performing fsck scan",
                self.local_dir.display()
            );
            let started = Instant::now();
            let mut checker = OverlayChecker::new(
                &*self.inode_catalog,
                &self.file_content_store,
                None,
                self.fsck_threads,
                self.log_repair_frequency,
            );
            checker.scan_for_errors(progress.as_ref())?;
            let repair = checker.repair_errors()?;
            let success = repair
                .as_ref()
                .map_or(true, |result| result.fixed_errors == result.total_errors);
            self.logger.log_fsck(FsckEvent {
                runtime: started.elapsed(),
                success,
                attempted_repair: repair.is_some(),
            });
            next_inode = Some(checker.next_inode_number());
        } else {
            self.had_clean_startup.store(true, Ordering::Release);
        }
        let mut next_inode = next_inode.expect("next inode number resolved above");

        // On hosts whose virtualization layer can change the working copy
        // while we are not running, reconcile those changes now, before any
        // user-visible handle exists.
        if let Some(scan) = local_scan {
            let counter = AtomicU64::new(next_inode.get());
            let summary = disk_state::scan_local_changes(
                &*self.inode_catalog,
                &*scan.disk,
                &*scan.scm,
                &counter,
            )?;
            debug!(
                "out-of-band reconciliation: {} added, {} updated, {} removed",
                summary.entries_added, summary.entries_updated, summary.entries_removed
            );
            next_inode = InodeNumber::new(counter.load(Ordering::Acquire));
        }

        self.next_inode_number
            .store(next_inode.get(), Ordering::Release);

        let table = InodeMetadataTable::open(metadata_table_path(&self.local_dir))?;
        *self.metadata.lock().unwrap() = Some(Arc::new(table));
        Ok(())
    }

    /// Shuts the overlay down: stops the reclamation worker, waits out every
    /// in-flight request, persists the next inode number, and releases the
    /// stores. Idempotent.
    pub fn close(&self) {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.gc_sender.send(GcRequest::Stop);
        if let Some(handle) = self.gc_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        let next_inode = InodeNumber::from_raw(self.next_inode_number.load(Ordering::Acquire));
        self.close_and_wait_for_outstanding_io();

        if let Some(table) = self.metadata.lock().unwrap().take() {
            table.close();
        }
        if self.inode_catalog.initialized() {
            self.inode_catalog.close(next_inode);
        }
        if self.file_content_store.initialized() {
            self.file_content_store.close();
        }
    }

    /// True once `close` has set the closed bit. Primarily for debugging.
    pub fn is_closed(&self) -> bool {
        self.outstanding_io.load(Ordering::Acquire) & IO_CLOSED_MASK != 0
    }

    /// True when initialization found a cleanly shut down overlay (or
    /// created a fresh one) and no consistency check was needed.
    pub fn had_clean_startup(&self) -> bool {
        self.had_clean_startup.load(Ordering::Acquire)
    }

    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.case_sensitivity
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Access to the optional inode metadata side table. `None` before
    /// initialization and after close.
    pub fn inode_metadata_table(&self) -> Option<Arc<InodeMetadataTable>> {
        self.metadata.lock().unwrap().clone()
    }

    //----------------------------------------------------------------------------------------------
    // Inode numbers
    //----------------------------------------------------------------------------------------------

    /// Issues a fresh inode number. The counter is 64 bits wide; practical
    /// exhaustion is impossible, so wraparound is not handled.
    pub fn allocate_inode_number(&self) -> InodeNumber {
        let previous = self.next_inode_number.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            previous != 0,
            "allocate_inode_number called before initialize"
        );
        InodeNumber::new(previous)
    }

    /// The highest inode number ever issued.
    pub fn get_max_inode_number(&self) -> InodeNumber {
        let next = self.next_inode_number.load(Ordering::Acquire);
        debug_assert!(next > 1);
        InodeNumber::new(next - 1)
    }

    //----------------------------------------------------------------------------------------------
    // Directory operations
    //----------------------------------------------------------------------------------------------

    fn serialize_entry(&self, entry: &DirEntry) -> OverlayEntry {
        OverlayEntry {
            mode: entry.initial_mode(),
            inode: entry.inode(),
            id: entry.object_id().cloned(),
        }
    }

    fn serialize_dir(&self, ino: InodeNumber, dir: &DirContents) -> Result<OverlayDir> {
        let next = self.next_inode_number.load(Ordering::Acquire);
        check_invariant!(
            ino.get() < next,
            "serialize_overlay_dir called with unallocated inode number {}",
            ino
        );
        let mut out = OverlayDir::new();
        for (name, entry) in dir.iter() {
            check_invariant!(
                entry.inode().get() < next,
                "directory {} entry {:?} uses unallocated inode number {}",
                ino,
                name.as_str(),
                entry.inode()
            );
            out.entries.push((name.clone(), self.serialize_entry(entry)));
        }
        Ok(out)
    }

    /// The wire form of a directory, as the catalog would store it.
    pub fn serialize_overlay_dir(
        &self,
        ino: InodeNumber,
        dir: &DirContents,
    ) -> Result<OverlayDir> {
        let _io = IoRequest::new(self)?;
        self.serialize_dir(ino, dir)
    }

    fn deserialize_dir(&self, dir: OverlayDir) -> (DirContents, bool) {
        let mut contents = DirContents::new(self.case_sensitivity);
        let mut filtered = false;
        for (name, entry) in dir.entries {
            if self.filter_apple_double && name.as_str().starts_with("._") {
                filtered = true;
                continue;
            }
            let dir_entry = match entry.id {
                Some(id) => DirEntry::new(entry.mode, entry.inode, id),
                None => DirEntry::new_materialized(entry.mode, entry.inode),
            };
            contents.insert(name, dir_entry);
        }
        (contents, filtered)
    }

    /// Loads a directory's contents. An absent record yields empty
    /// contents, not an error.
    pub fn load_overlay_dir(&self, ino: InodeNumber) -> Result<DirContents> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            let Some(dir) = self.inode_catalog.load_directory(ino)? else {
                return Ok(DirContents::new(self.case_sensitivity));
            };
            let (contents, filtered) = self.deserialize_dir(dir);
            if filtered {
                // Metadata side-channel entries were dropped; rewrite the
                // record so they do not come back on the next load.
                let serialized = self.serialize_dir(ino, &contents)?;
                self.inode_catalog.save_directory(ino, &serialized)?;
            }
            Ok(contents)
        })();
        self.stats.load_overlay_dir.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to load overlay dir {}: {}", ino, err);
        }
        result
    }

    pub fn save_overlay_dir(&self, ino: InodeNumber, dir: &DirContents) -> Result<()> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            let serialized = self.serialize_dir(ino, dir)?;
            self.inode_catalog.save_directory(ino, &serialized)
        })();
        self.stats.save_overlay_dir.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to save overlay dir {}: {}", ino, err);
        }
        result
    }

    pub fn has_overlay_dir(&self, ino: InodeNumber) -> Result<bool> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            self.inode_catalog.has_directory(ino)
        })();
        self.stats.has_overlay_dir.record(result.is_ok());
        result
    }

    pub fn remove_overlay_dir(&self, ino: InodeNumber) -> Result<()> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            self.free_inode_from_metadata_table(ino);
            self.inode_catalog.remove_directory(ino)
        })();
        self.stats.remove_overlay_dir.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to remove overlay dir {}: {}", ino, err);
        }
        result
    }

    /// Removes a directory and everything beneath it. The directory's own
    /// record is gone when this returns; the subtree is reclaimed by the
    /// background worker.
    pub fn recursively_remove_overlay_dir(&self, ino: InodeNumber) -> Result<()> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            self.free_inode_from_metadata_table(ino);
            // The record must be gone before we return, so a racing
            // save_overlay_dir for the same inode cannot be clobbered by
            // the worker later.
            let dir = self.inode_catalog.load_and_remove_directory(ino)?;
            if let Some(dir) = dir {
                if self.gc_sender.send(GcRequest::Reclaim(dir)).is_err() {
                    warn!("overlay is shutting down; subtree under {} not reclaimed", ino);
                }
            }
            Ok(())
        })();
        self.stats
            .recursively_remove_overlay_dir
            .record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to recursively remove overlay dir {}: {}", ino, err);
        }
        result
    }

    /// A future that completes once every reclamation request enqueued
    /// before this call has been processed.
    pub fn flush_pending_async(&self) -> Result<oneshot::Receiver<()>> {
        let _io = IoRequest::new(self)?;
        let (tx, rx) = oneshot::channel();
        self.gc_sender
            .send(GcRequest::Flush(tx))
            .map_err(|_| OverlayError::Closed)?;
        Ok(rx)
    }

    /// Schedules periodic catalog upkeep on the background worker.
    pub fn maintenance(&self) -> Result<()> {
        let _io = IoRequest::new(self)?;
        self.gc_sender
            .send(GcRequest::Maintenance)
            .map_err(|_| OverlayError::Closed)
    }

    //----------------------------------------------------------------------------------------------
    // Child-level operations
    //----------------------------------------------------------------------------------------------

    /// Records a new child of `parent`. Uses the catalog's fine-grained
    /// insert when supported, falling back to rewriting the whole
    /// directory from `content`.
    pub fn add_child(
        &self,
        parent: InodeNumber,
        name: &PathComponent,
        entry: &DirEntry,
        content: &DirContents,
    ) -> Result<()> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            if self.supports_semantic_operations {
                self.inode_catalog
                    .add_child(parent, name, self.serialize_entry(entry))
            } else {
                let serialized = self.serialize_dir(parent, content)?;
                self.inode_catalog.save_directory(parent, &serialized)
            }
        })();
        self.stats.add_child.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to add child {:?}: {}", name.as_str(), err);
        }
        result
    }

    pub fn remove_child(
        &self,
        parent: InodeNumber,
        name: &str,
        content: &DirContents,
    ) -> Result<()> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            if self.supports_semantic_operations {
                self.inode_catalog.remove_child(parent, name)?;
                Ok(())
            } else {
                let serialized = self.serialize_dir(parent, content)?;
                self.inode_catalog.save_directory(parent, &serialized)
            }
        })();
        self.stats.remove_child.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to remove child {:?}: {}", name, err);
        }
        result
    }

    /// Removes several children at once; always a whole-directory rewrite.
    pub fn remove_children(&self, parent: InodeNumber, content: &DirContents) -> Result<()> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            let serialized = self.serialize_dir(parent, content)?;
            self.inode_catalog.save_directory(parent, &serialized)
        })();
        self.stats.remove_children.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to remove children of {}: {}", parent, err);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    pub fn rename_child(
        &self,
        src: InodeNumber,
        dst: InodeNumber,
        src_name: &str,
        dst_name: &PathComponent,
        src_content: &DirContents,
        dst_content: &DirContents,
    ) -> Result<()> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            if self.supports_semantic_operations {
                self.inode_catalog
                    .rename_child(src, dst, src_name, dst_name)
            } else {
                let serialized = self.serialize_dir(src, src_content)?;
                self.inode_catalog.save_directory(src, &serialized)?;
                if dst != src {
                    let serialized = self.serialize_dir(dst, dst_content)?;
                    self.inode_catalog.save_directory(dst, &serialized)?;
                }
                Ok(())
            }
        })();
        self.stats.rename_child.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to rename child {:?}: {}", src_name, err);
        }
        result
    }

    //----------------------------------------------------------------------------------------------
    // File operations
    //----------------------------------------------------------------------------------------------

    /// Opens a materialized file, verifying its integrity header.
    pub fn open_file(
        self: &Arc<Self>,
        ino: InodeNumber,
        expected_id: [u8; 4],
    ) -> Result<OverlayFile> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            let file = self.file_content_store.open_file(ino, expected_id)?;
            Ok(OverlayFile::from_file(file, Arc::downgrade(self)))
        })();
        self.stats.open_overlay_file.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to open overlay file {}: {}", ino, err);
        }
        result
    }

    /// Opens a materialized file without header verification; for repair
    /// tooling.
    pub fn open_file_no_verify(self: &Arc<Self>, ino: InodeNumber) -> Result<OverlayFile> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            let file = self.file_content_store.open_file_no_verify(ino)?;
            Ok(OverlayFile::from_file(file, Arc::downgrade(self)))
        })();
        self.stats.open_overlay_file.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to open overlay file {}: {}", ino, err);
        }
        result
    }

    /// Records the body of a newly materialized file.
    pub fn create_overlay_file(
        self: &Arc<Self>,
        ino: InodeNumber,
        contents: &[u8],
    ) -> Result<OverlayFile> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            check_invariant!(
                ino.get() < self.next_inode_number.load(Ordering::Acquire),
                "create_overlay_file called with unallocated inode number {}",
                ino
            );
            let file = self.file_content_store.create_overlay_file(ino, contents)?;
            Ok(OverlayFile::from_file(file, Arc::downgrade(self)))
        })();
        self.stats.create_overlay_file.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to create overlay file {}: {}", ino, err);
        }
        result
    }

    pub fn has_overlay_file(&self, ino: InodeNumber) -> Result<bool> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            self.file_content_store.has_overlay_file(ino)
        })();
        self.stats.has_overlay_file.record(result.is_ok());
        result
    }

    pub fn remove_overlay_file(&self, ino: InodeNumber) -> Result<()> {
        let result = (|| {
            let _io = IoRequest::new(self)?;
            self.free_inode_from_metadata_table(ino);
            self.file_content_store.remove_overlay_file(ino)
        })();
        self.stats.remove_overlay_file.record(result.is_ok());
        if let Err(err) = &result {
            error!("failed to remove overlay file {}: {}", ino, err);
        }
        result
    }

    //----------------------------------------------------------------------------------------------
    // I/O gating
    //----------------------------------------------------------------------------------------------

    fn try_inc_outstanding_io(&self) -> bool {
        let mut current = self.outstanding_io.load(Ordering::SeqCst);
        while current & IO_CLOSED_MASK == 0 {
            match self.outstanding_io.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    fn dec_outstanding_io(&self) {
        let outstanding = self.outstanding_io.fetch_sub(1, Ordering::SeqCst);
        debug_assert_ne!(outstanding & IO_COUNT_MASK, 0, "decremented too far");
        // If the overlay is closed and this was the last in-flight request,
        // wake the thread waiting in close().
        if outstanding & IO_CLOSED_MASK != 0 && outstanding & IO_COUNT_MASK == 1 {
            self.last_io_done.post();
        }
    }

    fn close_and_wait_for_outstanding_io(&self) {
        let outstanding = self.outstanding_io.fetch_or(IO_CLOSED_MASK, Ordering::SeqCst);
        if outstanding & IO_COUNT_MASK != 0 {
            self.last_io_done.wait();
        }
    }

    //----------------------------------------------------------------------------------------------
    // Reclamation worker
    //----------------------------------------------------------------------------------------------

    fn gc_loop(&self, receiver: &Receiver<GcRequest>) {
        while let Ok(request) = receiver.recv() {
            if matches!(request, GcRequest::Stop) {
                return;
            }
            // A single failed request must not take the worker down.
            if let Err(err) = self.handle_gc_request(request) {
                error!("overlay reclamation request failed: {}", err);
            }
        }
    }

    fn handle_gc_request(&self, request: GcRequest) -> Result<()> {
        let _io = IoRequest::new(self)?;
        match request {
            GcRequest::Maintenance => self.inode_catalog.maintenance(),
            GcRequest::Flush(tx) => {
                let _ = tx.send(());
                Ok(())
            }
            GcRequest::Reclaim(dir) => {
                self.reclaim_tree(dir);
                Ok(())
            }
            GcRequest::Stop => unreachable!("handled by the loop"),
        }
    }

    /// Removes every record beneath an already-detached directory.
    /// Individual failures are logged and skipped.
    fn reclaim_tree(&self, dir: OverlayDir) {
        let mut pending: VecDeque<InodeNumber> = VecDeque::new();

        let mut process = |dir: &OverlayDir, pending: &mut VecDeque<InodeNumber>| {
            for (_, entry) in &dir.entries {
                if FileType::from_mode(entry.mode) == FileType::Directory {
                    pending.push_back(entry.inode);
                } else {
                    // Only materialized files have bodies, but removal is
                    // idempotent either way.
                    self.free_inode_from_metadata_table(entry.inode);
                    if let Err(err) = self.file_content_store.remove_overlay_file(entry.inode) {
                        error!(
                            "failed to remove overlay data for file inode {}: {}",
                            entry.inode, err
                        );
                    }
                }
            }
        };

        process(&dir, &mut pending);
        while let Some(ino) = pending.pop_front() {
            self.free_inode_from_metadata_table(ino);
            match self.inode_catalog.load_and_remove_directory(ino) {
                Ok(Some(dir)) => process(&dir, &mut pending),
                Ok(None) => debug!("no directory record for reclaimed inode {}", ino),
                Err(err) => {
                    error!("failed to load subtree data for inode {}: {}", ino, err);
                }
            }
        }
    }

    fn free_inode_from_metadata_table(&self, ino: InodeNumber) {
        if let Some(table) = self.metadata.lock().unwrap().as_ref() {
            table.free_inode(ino);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemInodeCatalog;
    use crate::header::{HEADER_ID_FILE, HEADER_LENGTH};
    use crate::inode::ROOT_INODE;
    use crate::model::ObjectId;
    use crate::telemetry::NullStructuredLogger;
    use std::fs;
    use tempfile::TempDir;

    fn name(s: &str) -> PathComponent {
        PathComponent::new(s).unwrap()
    }

    fn contents() -> DirContents {
        DirContents::new(CaseSensitivity::Sensitive)
    }

    fn config_for(catalog_type: InodeCatalogType) -> OverlayConfig {
        OverlayConfig {
            catalog_type,
            ..OverlayConfig::default()
        }
    }

    fn open_overlay(local_dir: &Path, config: OverlayConfig) -> Arc<Overlay> {
        let overlay = Overlay::create(
            local_dir,
            config,
            Arc::new(NullStructuredLogger),
            Arc::new(OverlayStats::default()),
        );
        overlay
            .initialize(None, None)
            .blocking_recv()
            .unwrap()
            .unwrap();
        overlay
    }

    fn overlay_dir_in(tmp: &TempDir) -> PathBuf {
        let local = tmp.path().join("overlay");
        fs::create_dir(&local).unwrap();
        local
    }

    fn find_repair_dir(tmp: &TempDir) -> PathBuf {
        for entry in fs::read_dir(tmp.path()).unwrap() {
            let entry = entry.unwrap();
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with("fsck-repair-")
            {
                return entry.path();
            }
        }
        panic!("no fsck repair directory found in {}", tmp.path().display());
    }

    #[derive(Default)]
    struct RecordingLogger {
        events: Mutex<Vec<FsckEvent>>,
    }

    impl StructuredLogger for RecordingLogger {
        fn log_fsck(&self, event: FsckEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn scenario_create_persist_reopen(catalog_type: InodeCatalogType) {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let object_id = ObjectId::from_bytes(b"01230123");
        {
            let overlay = open_overlay(&local, config_for(catalog_type));
            assert!(overlay.had_clean_startup());
            assert_eq!(overlay.allocate_inode_number(), InodeNumber::new(2));
            assert_eq!(overlay.allocate_inode_number(), InodeNumber::new(3));
            assert_eq!(overlay.allocate_inode_number(), InodeNumber::new(4));

            let mut root = contents();
            root.insert(
                name("a"),
                DirEntry::new_materialized(0o040755, InodeNumber::new(2)),
            );
            root.insert(
                name("b"),
                DirEntry::new(0o100644, InodeNumber::new(3), object_id.clone()),
            );
            overlay.save_overlay_dir(ROOT_INODE, &root).unwrap();
            overlay
                .save_overlay_dir(InodeNumber::new(2), &contents())
                .unwrap();
            overlay.close();
        }
        {
            let overlay = open_overlay(&local, config_for(catalog_type));
            assert!(overlay.had_clean_startup());

            let root = overlay.load_overlay_dir(ROOT_INODE).unwrap();
            let listed: Vec<_> = root.iter().map(|(n, _)| n.as_str().to_string()).collect();
            assert_eq!(listed, ["a", "b"]);

            let a = root.get("a").unwrap();
            assert!(a.is_materialized());
            assert!(a.is_directory());
            assert_eq!(a.inode(), InodeNumber::new(2));
            assert_eq!(a.initial_mode(), 0o040755);

            let b = root.get("b").unwrap();
            assert_eq!(b.object_id(), Some(&object_id));
            assert_eq!(b.inode(), InodeNumber::new(3));
            assert_eq!(b.initial_mode(), 0o100644);

            assert!(overlay
                .load_overlay_dir(InodeNumber::new(2))
                .unwrap()
                .is_empty());
            assert_eq!(overlay.get_max_inode_number(), InodeNumber::new(4));
            overlay.close();
        }
    }

    #[test]
    fn test_create_persist_reopen_read_fs() {
        scenario_create_persist_reopen(InodeCatalogType::Fs);
    }

    #[test]
    fn test_create_persist_reopen_read_sqlite() {
        scenario_create_persist_reopen(InodeCatalogType::Sqlite);
    }

    #[test]
    fn test_recursive_delete_then_flush() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let overlay = open_overlay(&local, config_for(InodeCatalogType::Fs));

        // root -> a/ -> { b/, f1 }, b/ -> { f2, c/ }, c/ empty.
        let a = overlay.allocate_inode_number();
        let b = overlay.allocate_inode_number();
        let f1 = overlay.allocate_inode_number();
        let f2 = overlay.allocate_inode_number();
        let c = overlay.allocate_inode_number();
        assert_eq!(c, InodeNumber::new(6));

        let mut root = contents();
        root.insert(name("a"), DirEntry::new_materialized(0o040755, a));
        let mut a_dir = contents();
        a_dir.insert(name("b"), DirEntry::new_materialized(0o040755, b));
        a_dir.insert(name("f1"), DirEntry::new_materialized(0o100644, f1));
        let mut b_dir = contents();
        b_dir.insert(name("f2"), DirEntry::new_materialized(0o100644, f2));
        b_dir.insert(name("c"), DirEntry::new_materialized(0o040755, c));

        overlay.save_overlay_dir(ROOT_INODE, &root).unwrap();
        overlay.save_overlay_dir(a, &a_dir).unwrap();
        overlay.save_overlay_dir(b, &b_dir).unwrap();
        overlay.save_overlay_dir(c, &contents()).unwrap();
        overlay.create_overlay_file(f1, b"one").unwrap();
        overlay.create_overlay_file(f2, b"two").unwrap();

        // Returns without waiting on reclamation, with a's record already
        // gone.
        overlay.recursively_remove_overlay_dir(a).unwrap();
        assert!(!overlay.has_overlay_dir(a).unwrap());

        overlay
            .flush_pending_async()
            .unwrap()
            .blocking_recv()
            .unwrap();

        for ino in [a, b, c] {
            assert!(!overlay.has_overlay_dir(ino).unwrap());
        }
        for ino in [f1, f2] {
            assert!(!overlay.has_overlay_file(ino).unwrap());
        }

        // A second flush barrier completes as well.
        overlay
            .flush_pending_async()
            .unwrap()
            .blocking_recv()
            .unwrap();
        overlay.close();
    }

    #[test]
    fn test_unclean_shutdown_recovery() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        {
            let overlay = open_overlay(&local, config_for(InodeCatalogType::Fs));
            for _ in 0..6 {
                overlay.allocate_inode_number();
            }
            assert_eq!(overlay.get_max_inode_number(), InodeNumber::new(7));

            let mut root = contents();
            root.insert(
                name("d4"),
                DirEntry::new_materialized(0o040755, InodeNumber::new(4)),
            );
            root.insert(
                name("f7"),
                DirEntry::new(0o100644, InodeNumber::new(7), ObjectId::from_bytes(b"aa")),
            );
            let mut d4 = contents();
            d4.insert(
                name("f5"),
                DirEntry::new(0o100644, InodeNumber::new(5), ObjectId::from_bytes(b"bb")),
            );
            overlay.save_overlay_dir(ROOT_INODE, &root).unwrap();
            overlay.save_overlay_dir(InodeNumber::new(4), &d4).unwrap();

            // Simulated crash: the overlay is never closed, so no next
            // inode number is persisted.
            std::mem::forget(overlay);
        }

        let logger = Arc::new(RecordingLogger::default());
        let overlay = Overlay::create(
            &local,
            config_for(InodeCatalogType::Fs),
            logger.clone(),
            Arc::new(OverlayStats::default()),
        );
        overlay
            .initialize(None, None)
            .blocking_recv()
            .unwrap()
            .unwrap();

        assert!(!overlay.had_clean_startup());
        assert_eq!(overlay.get_max_inode_number(), InodeNumber::new(7));

        let events = logger.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].attempted_repair);
        assert!(events[0].success);
        drop(events);

        // The only problem was the missing next-inode-number record.
        let log = fs::read_to_string(find_repair_dir(&tmp).join("fsck.log")).unwrap();
        assert!(log.contains("1 problems detected"), "log: {}", log);
        assert!(log.contains("bad stored next inode number"), "log: {}", log);

        overlay.close();
    }

    #[test]
    fn test_corrupt_file_header_repaired_on_reopen() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let ino = InodeNumber::new(5);
        {
            let overlay = open_overlay(&local, config_for(InodeCatalogType::Fs));
            for _ in 0..4 {
                overlay.allocate_inode_number();
            }
            let mut root = contents();
            root.insert(name("f"), DirEntry::new_materialized(0o100644, ino));
            overlay.save_overlay_dir(ROOT_INODE, &root).unwrap();
            overlay.create_overlay_file(ino, b"important data").unwrap();
            std::mem::forget(overlay);
        }

        // Out-of-band corruption of the first 64 bytes of the backing file.
        let backing = local.join("05").join("5");
        let original = fs::read(&backing).unwrap();
        use std::os::unix::fs::FileExt;
        let file = fs::OpenOptions::new().write(true).open(&backing).unwrap();
        file.write_all_at(&[0x55u8; HEADER_LENGTH], 0).unwrap();
        drop(file);

        let overlay = open_overlay(&local, config_for(InodeCatalogType::Fs));

        // The damaged bytes were preserved, original header bytes replaced.
        let archived = fs::read(
            find_repair_dir(&tmp)
                .join("lost+found")
                .join("1")
                .join("f"),
        )
        .unwrap();
        assert_eq!(&archived[..HEADER_LENGTH], &[0x55u8; HEADER_LENGTH]);
        assert_eq!(&archived[HEADER_LENGTH..], &original[HEADER_LENGTH..]);

        // The repaired file opens cleanly and is empty.
        let file = overlay.open_file(ino, HEADER_ID_FILE).unwrap();
        assert_eq!(file.read_all().unwrap(), b"");
        assert_eq!(file.stat().unwrap().size, 0);
        overlay.close();
    }

    #[test]
    fn test_buffered_write_visibility() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let config = OverlayConfig {
            catalog_type: InodeCatalogType::Fs,
            catalog_options: InodeCatalogOptions::BUFFERED,
            buffer_size: 1,
            ..OverlayConfig::default()
        };
        {
            let overlay = open_overlay(&local, config);
            // Allocate dir inodes 2..=21 and child inodes 22..=41.
            for _ in 0..40 {
                overlay.allocate_inode_number();
            }
            for raw in 2u64..22 {
                let ino = InodeNumber::new(raw);
                let mut dir = contents();
                dir.insert(
                    name("child"),
                    DirEntry::new(
                        0o100644,
                        InodeNumber::new(raw + 20),
                        ObjectId::from_bytes(raw.to_be_bytes()),
                    ),
                );
                overlay.save_overlay_dir(ino, &dir).unwrap();
                let loaded = overlay.load_overlay_dir(ino).unwrap();
                let child = loaded.get("child").unwrap();
                assert_eq!(
                    child.object_id(),
                    Some(&ObjectId::from_bytes(raw.to_be_bytes())),
                    "write to inode {} must be immediately visible",
                    raw
                );
            }
            overlay.close();
        }
        // Everything the buffer accepted was durably persisted by close.
        let config = OverlayConfig {
            catalog_type: InodeCatalogType::Fs,
            catalog_options: InodeCatalogOptions::BUFFERED,
            buffer_size: 1,
            ..OverlayConfig::default()
        };
        let overlay = open_overlay(&local, config);
        assert!(overlay.had_clean_startup());
        for raw in 2u64..22 {
            assert!(overlay.has_overlay_dir(InodeNumber::new(raw)).unwrap());
        }
        overlay.close();
    }

    /// A catalog whose saves block until released, to hold an I/O request
    /// in flight while close() runs.
    struct GateCatalog {
        inner: MemInodeCatalog,
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl InodeCatalog for GateCatalog {
        fn initialize(&self, create_if_missing: bool) -> Result<Option<InodeNumber>> {
            self.inner.initialize(create_if_missing)
        }
        fn initialized(&self) -> bool {
            self.inner.initialized()
        }
        fn close(&self, next_inode: Option<InodeNumber>) {
            self.inner.close(next_inode)
        }
        fn load_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
            self.inner.load_directory(ino)
        }
        fn load_directory_raw(&self, ino: InodeNumber) -> Result<Option<Vec<u8>>> {
            self.inner.load_directory_raw(ino)
        }
        fn save_directory(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<()> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            self.inner.save_directory(ino, dir)
        }
        fn has_directory(&self, ino: InodeNumber) -> Result<bool> {
            self.inner.has_directory(ino)
        }
        fn remove_directory(&self, ino: InodeNumber) -> Result<()> {
            self.inner.remove_directory(ino)
        }
        fn load_and_remove_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
            self.inner.load_and_remove_directory(ino)
        }
        fn list_directories(&self) -> Result<Vec<InodeNumber>> {
            self.inner.list_directories()
        }
    }

    #[test]
    fn test_close_waits_for_outstanding_io() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let catalog = Box::new(GateCatalog {
            inner: MemInodeCatalog::new(),
            entered: entered_tx,
            release: release_rx,
        });
        let overlay = Overlay::create_with_catalog(
            local,
            catalog,
            config_for(InodeCatalogType::InMemory),
            Arc::new(NullStructuredLogger),
            Arc::new(OverlayStats::default()),
        );
        overlay
            .initialize(None, None)
            .blocking_recv()
            .unwrap()
            .unwrap();
        let ino = overlay.allocate_inode_number();

        // Thread A: a save that blocks inside the backend.
        let writer = {
            let overlay = Arc::clone(&overlay);
            std::thread::spawn(move || overlay.save_overlay_dir(ino, &contents()))
        };
        entered_rx.recv().unwrap();

        // Thread B: close() must wait for A's request to finish.
        let close_done = Arc::new(AtomicBool::new(false));
        let closer = {
            let overlay = Arc::clone(&overlay);
            let close_done = Arc::clone(&close_done);
            std::thread::spawn(move || {
                overlay.close();
                close_done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(
            !close_done.load(Ordering::SeqCst),
            "close() returned while a request was still in flight"
        );

        release_tx.send(()).unwrap();
        writer.join().unwrap().unwrap();
        closer.join().unwrap();
        assert!(close_done.load(Ordering::SeqCst));
        assert!(overlay.is_closed());

        // Every subsequent operation is refused.
        assert!(matches!(
            overlay.load_overlay_dir(ino),
            Err(OverlayError::Closed)
        ));
        assert!(matches!(
            overlay.save_overlay_dir(ino, &contents()),
            Err(OverlayError::Closed)
        ));
        assert!(matches!(
            overlay.has_overlay_dir(ino),
            Err(OverlayError::Closed)
        ));
        assert!(matches!(
            overlay.flush_pending_async(),
            Err(OverlayError::Closed)
        ));
        assert!(matches!(
            overlay.open_file(ino, HEADER_ID_FILE),
            Err(OverlayError::Closed)
        ));

        // close() is idempotent.
        overlay.close();
    }

    #[test]
    fn test_overlay_file_logical_offsets() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let overlay = open_overlay(&local, config_for(InodeCatalogType::Fs));
        let ino = overlay.allocate_inode_number();

        let file = overlay.create_overlay_file(ino, b"hello world").unwrap();
        assert_eq!(file.stat().unwrap().size, 11);

        let mut buf = [0u8; 5];
        assert_eq!(file.pread(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");

        assert_eq!(file.pwritev(&[b"HE"], 0).unwrap(), 2);
        assert_eq!(file.read_all().unwrap(), b"HEllo world");

        assert_eq!(file.seek(std::io::SeekFrom::Start(6)).unwrap(), 6);
        file.truncate(5).unwrap();
        assert_eq!(file.read_all().unwrap(), b"HEllo");
        assert_eq!(file.stat().unwrap().size, 5);

        file.fsync().unwrap();
        file.fdatasync().unwrap();

        #[cfg(target_os = "linux")]
        {
            file.fallocate(0, 32).unwrap();
            assert_eq!(file.stat().unwrap().size, 32);
        }

        // A scatter write across two buffers.
        let empty = overlay.allocate_inode_number();
        let second = overlay.create_overlay_file(empty, b"").unwrap();
        assert_eq!(second.stat().unwrap().size, 0);
        assert_eq!(second.pwritev(&[b"ab", b"cd"], 0).unwrap(), 4);
        assert_eq!(second.read_all().unwrap(), b"abcd");

        overlay.close();

        // Handles outlive the overlay but refuse to touch it once closed.
        assert!(matches!(file.stat(), Err(OverlayError::Closed)));
        assert!(matches!(file.pread(&mut buf, 0), Err(OverlayError::Closed)));
    }

    #[test]
    fn test_inode_reference_handles_report_unimplemented() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let overlay = open_overlay(&local, config_for(InodeCatalogType::InMemory));
        let ino = overlay.allocate_inode_number();

        let handle = OverlayFile::from_inode(ino, Arc::downgrade(&overlay));
        assert!(matches!(handle.stat(), Err(OverlayError::Unimplemented)));
        assert!(matches!(
            handle.pread(&mut [0u8; 4], 0),
            Err(OverlayError::Unimplemented)
        ));
        assert!(matches!(
            handle.read_all(),
            Err(OverlayError::Unimplemented)
        ));
        overlay.close();
        // Once the overlay is closed the gate takes precedence.
        assert!(matches!(handle.stat(), Err(OverlayError::Closed)));
    }

    #[test]
    fn test_open_file_verifies_header() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let overlay = open_overlay(&local, config_for(InodeCatalogType::Fs));
        let ino = overlay.allocate_inode_number();
        overlay.create_overlay_file(ino, b"data").unwrap();

        assert!(overlay.open_file(ino, HEADER_ID_FILE).is_ok());
        let missing = InodeNumber::new(ino.get() + 1000);
        assert!(matches!(
            overlay.open_file(missing, HEADER_ID_FILE),
            Err(OverlayError::NotFound(_))
        ));
        overlay.close();
    }

    #[test]
    fn test_apple_double_entries_are_filtered_and_rewritten() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let config = OverlayConfig {
            catalog_type: InodeCatalogType::Fs,
            filter_apple_double: true,
            ..OverlayConfig::default()
        };
        let overlay = open_overlay(&local, config);
        let real = overlay.allocate_inode_number();
        let junk = overlay.allocate_inode_number();

        let mut root = contents();
        root.insert(name("real"), DirEntry::new_materialized(0o100644, real));
        root.insert(
            name("._real"),
            DirEntry::new(0o100644, junk, ObjectId::from_bytes(b"xx")),
        );
        overlay.save_overlay_dir(ROOT_INODE, &root).unwrap();

        let loaded = overlay.load_overlay_dir(ROOT_INODE).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.get("real").is_some());

        // The record itself was rewritten without the side-channel entry.
        let reloaded = overlay.load_overlay_dir(ROOT_INODE).unwrap();
        assert_eq!(reloaded.len(), 1);
        overlay.close();
    }

    #[test]
    fn test_child_operations_with_whole_dir_fallback() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        // The filesystem catalog has no fine-grained child operations.
        let overlay = open_overlay(&local, config_for(InodeCatalogType::Fs));
        let child = overlay.allocate_inode_number();

        let mut root = contents();
        let entry = DirEntry::new_materialized(0o100644, child);
        root.insert(name("a.txt"), entry.clone());
        overlay
            .add_child(ROOT_INODE, &name("a.txt"), &entry, &root)
            .unwrap();
        assert!(overlay
            .load_overlay_dir(ROOT_INODE)
            .unwrap()
            .get("a.txt")
            .is_some());

        root.remove("a.txt");
        overlay.remove_child(ROOT_INODE, "a.txt", &root).unwrap();
        assert!(overlay.load_overlay_dir(ROOT_INODE).unwrap().is_empty());
        overlay.close();
    }

    #[test]
    fn test_child_operations_with_semantic_catalog() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let overlay = open_overlay(&local, config_for(InodeCatalogType::Sqlite));
        let subdir = overlay.allocate_inode_number();
        let child = overlay.allocate_inode_number();

        let entry = DirEntry::new_materialized(0o100644, child);
        // With semantic support the contents argument is not consulted, but
        // callers still pass their in-memory view.
        let mut root = contents();
        root.insert(name("a.txt"), entry.clone());
        overlay
            .add_child(ROOT_INODE, &name("a.txt"), &entry, &root)
            .unwrap();
        assert!(overlay
            .load_overlay_dir(ROOT_INODE)
            .unwrap()
            .get("a.txt")
            .is_some());

        overlay
            .save_overlay_dir(subdir, &contents())
            .unwrap();
        overlay
            .rename_child(
                ROOT_INODE,
                subdir,
                "a.txt",
                &name("b.txt"),
                &contents(),
                &contents(),
            )
            .unwrap();
        assert!(overlay.load_overlay_dir(ROOT_INODE).unwrap().is_empty());
        assert!(overlay
            .load_overlay_dir(subdir)
            .unwrap()
            .get("b.txt")
            .is_some());

        overlay
            .remove_child(subdir, "b.txt", &contents())
            .unwrap();
        assert!(overlay.load_overlay_dir(subdir).unwrap().is_empty());
        overlay.close();
    }

    #[test]
    fn test_remove_operations_are_idempotent_on_absent_inodes() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let overlay = open_overlay(&local, config_for(InodeCatalogType::Fs));
        let ino = overlay.allocate_inode_number();
        overlay.remove_overlay_dir(ino).unwrap();
        overlay.remove_overlay_dir(ino).unwrap();
        overlay.remove_overlay_file(ino).unwrap();
        overlay.remove_overlay_file(ino).unwrap();
        overlay.close();
    }

    #[test]
    fn test_maintenance_runs_on_worker() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let overlay = open_overlay(&local, config_for(InodeCatalogType::Sqlite));
        overlay.maintenance().unwrap();
        overlay
            .flush_pending_async()
            .unwrap()
            .blocking_recv()
            .unwrap();
        overlay.close();
    }

    #[test]
    fn test_initialize_twice_is_an_invariant_violation() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let overlay = open_overlay(&local, config_for(InodeCatalogType::InMemory));
        let second = overlay.initialize(None, None).blocking_recv().unwrap();
        assert!(matches!(
            second,
            Err(OverlayError::InvariantViolation(_))
        ));
        overlay.close();
    }

    #[test]
    fn test_stats_count_operations() {
        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let stats = Arc::new(OverlayStats::default());
        let overlay = Overlay::create(
            &local,
            config_for(InodeCatalogType::Fs),
            Arc::new(NullStructuredLogger),
            Arc::clone(&stats),
        );
        overlay
            .initialize(None, None)
            .blocking_recv()
            .unwrap()
            .unwrap();
        let ino = overlay.allocate_inode_number();
        overlay.save_overlay_dir(ino, &contents()).unwrap();
        overlay.load_overlay_dir(ino).unwrap();
        overlay.close();

        assert_eq!(stats.save_overlay_dir.successes(), 1);
        assert_eq!(stats.load_overlay_dir.successes(), 1);
        assert_eq!(stats.save_overlay_dir.failures(), 0);

        // Post-close operations count as failures.
        let _ = overlay.load_overlay_dir(ino);
        assert_eq!(stats.load_overlay_dir.failures(), 1);
    }

    #[test]
    fn test_reconciles_out_of_band_changes_during_initialize() {
        use crate::dir::FileType;
        use crate::disk_state::{DiskChild, DiskStateSource, OnDiskState, ScmTreeEntry, ScmTreeLookup};

        struct OneDirtyFile;
        impl DiskStateSource for OneDirtyFile {
            fn list_children(&self, path: &str) -> Result<Vec<DiskChild>> {
                if path.is_empty() {
                    Ok(vec![DiskChild {
                        name: PathComponent::new("edited.txt").unwrap(),
                        file_type: FileType::Regular,
                        state: OnDiskState::Full,
                    }])
                } else {
                    Ok(Vec::new())
                }
            }
        }
        struct EmptyScm;
        impl ScmTreeLookup for EmptyScm {
            fn lookup_tree(&self, _path: &str) -> Result<Option<Vec<ScmTreeEntry>>> {
                Ok(None)
            }
        }

        let tmp = TempDir::new().unwrap();
        let local = overlay_dir_in(&tmp);
        let overlay = Overlay::create(
            &local,
            config_for(InodeCatalogType::Sqlite),
            Arc::new(NullStructuredLogger),
            Arc::new(OverlayStats::default()),
        );
        let scan = LocalChangeScan {
            disk: Arc::new(OneDirtyFile),
            scm: Arc::new(EmptyScm),
        };
        overlay
            .initialize(Some(scan), None)
            .blocking_recv()
            .unwrap()
            .unwrap();

        let root = overlay.load_overlay_dir(ROOT_INODE).unwrap();
        let entry = root.get("edited.txt").unwrap();
        assert!(entry.is_materialized());
        assert_eq!(entry.inode(), InodeNumber::new(2));
        // The reconciliation's allocation advanced the counter.
        assert_eq!(overlay.get_max_inode_number(), InodeNumber::new(2));
        overlay.close();
    }
}
