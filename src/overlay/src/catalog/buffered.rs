//! Write-buffering decorator for any catalog backend.
//!
//! Writes are accepted into an in-memory buffer bounded by a byte budget and
//! applied to the wrapped backend by a dedicated flusher thread. A write is
//! visible to reads the moment it enters the buffer; `flush` completes only
//! once everything accepted earlier is durably in the wrapped store.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::error;

use crate::codec::{self, OverlayDir};
use crate::error::Result;
use crate::inode::InodeNumber;

use super::InodeCatalog;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

#[derive(Clone)]
enum PendingOp {
    /// A buffered save, with its encoded size for budget accounting.
    Save(OverlayDir, usize),
    Remove,
}

impl PendingOp {
    fn size(&self) -> usize {
        match self {
            PendingOp::Save(_, size) => *size,
            PendingOp::Remove => 0,
        }
    }
}

#[derive(Default)]
struct BufferState {
    /// Writes accepted but not yet picked up by the flusher. One slot per
    /// inode: a newer write to the same inode coalesces over the older one.
    pending: HashMap<InodeNumber, PendingOp>,

    /// The single write the flusher is currently applying. Reads must
    /// consult it so a write stays visible between pickup and completion.
    applying: HashMap<InodeNumber, PendingOp>,

    /// Bytes charged against the budget, across `pending` and `applying`.
    bytes: usize,

    stop: bool,
}

struct Shared {
    state: Mutex<BufferState>,
    /// Wakes the flusher when work arrives or stop is requested.
    work: Condvar,
    /// Wakes writers blocked on the byte budget.
    space: Condvar,
    /// Wakes flush barriers when the buffer fully drains.
    idle: Condvar,
}

pub struct BufferedInodeCatalog {
    inner: Arc<dyn InodeCatalog>,
    buffer_size: usize,
    shared: Arc<Shared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BufferedInodeCatalog {
    pub fn new(inner: Arc<dyn InodeCatalog>, buffer_size: usize) -> Self {
        BufferedInodeCatalog {
            inner,
            buffer_size,
            shared: Arc::new(Shared {
                state: Mutex::new(BufferState::default()),
                work: Condvar::new(),
                space: Condvar::new(),
                idle: Condvar::new(),
            }),
            flusher: Mutex::new(None),
        }
    }

    /// The buffered view of an inode, if the buffer knows about it at all.
    fn buffered_op<'a>(state: &'a BufferState, ino: InodeNumber) -> Option<&'a PendingOp> {
        state.pending.get(&ino).or_else(|| state.applying.get(&ino))
    }

    fn enqueue(&self, ino: InodeNumber, op: PendingOp) {
        let size = op.size();
        let mut state = self.shared.state.lock().unwrap();
        // Admit a write that alone exceeds the budget once the buffer is
        // empty; otherwise nothing larger than the budget could ever land.
        while state.bytes > 0 && state.bytes + size > self.buffer_size {
            state = self.shared.space.wait(state).unwrap();
        }
        if let Some(old) = state.pending.insert(ino, op) {
            state.bytes -= old.size();
        }
        state.bytes += size;
        drop(state);
        self.shared.work.notify_one();
    }

    fn flusher_loop(inner: Arc<dyn InodeCatalog>, shared: Arc<Shared>) {
        loop {
            let (ino, op) = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if let Some(&ino) = state.pending.keys().next() {
                        let op = state.pending.remove(&ino).unwrap();
                        state.applying.insert(ino, op.clone());
                        break (ino, op);
                    }
                    if state.stop {
                        shared.idle.notify_all();
                        return;
                    }
                    state = shared.work.wait(state).unwrap();
                }
            };

            // A failed deferred write can only be reported here; the save
            // that queued it already returned success.
            let result = match &op {
                PendingOp::Save(dir, _) => inner.save_directory(ino, dir),
                PendingOp::Remove => inner.remove_directory(ino),
            };
            if let Err(err) = result {
                error!("buffered catalog write for inode {} failed: {}", ino, err);
            }

            let mut state = shared.state.lock().unwrap();
            state.applying.remove(&ino);
            state.bytes -= op.size();
            self_notify(&shared, &state);
        }
    }
}

fn self_notify(shared: &Shared, state: &BufferState) {
    shared.space.notify_all();
    if state.pending.is_empty() && state.applying.is_empty() {
        shared.idle.notify_all();
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl InodeCatalog for BufferedInodeCatalog {
    fn initialize(&self, create_if_missing: bool) -> Result<Option<InodeNumber>> {
        let next = self.inner.initialize(create_if_missing)?;
        let inner = Arc::clone(&self.inner);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("overlay-buffer-flusher".into())
            .spawn(move || Self::flusher_loop(inner, shared))
            .expect("failed to spawn buffer flusher thread");
        *self.flusher.lock().unwrap() = Some(handle);
        Ok(next)
    }

    fn initialized(&self) -> bool {
        self.inner.initialized()
    }

    fn close(&self, next_inode: Option<InodeNumber>) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
        }
        self.shared.work.notify_all();
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            // The flusher drains every pending write before honoring stop.
            let _ = handle.join();
        }
        self.inner.close(next_inode);
    }

    fn load_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
        let state = self.shared.state.lock().unwrap();
        match Self::buffered_op(&state, ino) {
            Some(PendingOp::Save(dir, _)) => Ok(Some(dir.clone())),
            Some(PendingOp::Remove) => Ok(None),
            None => self.inner.load_directory(ino),
        }
    }

    fn load_directory_raw(&self, ino: InodeNumber) -> Result<Option<Vec<u8>>> {
        let state = self.shared.state.lock().unwrap();
        match Self::buffered_op(&state, ino) {
            Some(PendingOp::Save(dir, _)) => Ok(Some(codec::encode_dir(dir))),
            Some(PendingOp::Remove) => Ok(None),
            None => self.inner.load_directory_raw(ino),
        }
    }

    fn save_directory(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<()> {
        let size = codec::encode_dir(dir).len();
        self.enqueue(ino, PendingOp::Save(dir.clone(), size));
        Ok(())
    }

    fn has_directory(&self, ino: InodeNumber) -> Result<bool> {
        let state = self.shared.state.lock().unwrap();
        match Self::buffered_op(&state, ino) {
            Some(PendingOp::Save(..)) => Ok(true),
            Some(PendingOp::Remove) => Ok(false),
            None => self.inner.has_directory(ino),
        }
    }

    fn remove_directory(&self, ino: InodeNumber) -> Result<()> {
        self.enqueue(ino, PendingOp::Remove);
        Ok(())
    }

    fn load_and_remove_directory(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
        let mut state = self.shared.state.lock().unwrap();
        let current = match Self::buffered_op(&state, ino) {
            Some(PendingOp::Save(dir, _)) => Some(dir.clone()),
            Some(PendingOp::Remove) => None,
            // Not buffered, so the flusher cannot be touching this inode:
            // reading the wrapped store under the lock is race-free.
            None => self.inner.load_directory(ino)?,
        };
        if current.is_some() {
            if let Some(old) = state.pending.insert(ino, PendingOp::Remove) {
                state.bytes -= old.size();
            }
            drop(state);
            self.shared.work.notify_one();
        }
        Ok(current)
    }

    fn list_directories(&self) -> Result<Vec<InodeNumber>> {
        let state = self.shared.state.lock().unwrap();
        let mut set: BTreeSet<InodeNumber> = self.inner.list_directories()?.into_iter().collect();
        for (ino, op) in state.pending.iter().chain(state.applying.iter()) {
            match op {
                PendingOp::Save(..) => {
                    set.insert(*ino);
                }
                PendingOp::Remove => {
                    set.remove(ino);
                }
            }
        }
        Ok(set.into_iter().collect())
    }

    fn maintenance(&self) -> Result<()> {
        self.inner.maintenance()
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        while !(state.pending.is_empty() && state.applying.is_empty()) {
            state = self.shared.idle.wait(state).unwrap();
        }
        drop(state);
        self.inner.flush()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
