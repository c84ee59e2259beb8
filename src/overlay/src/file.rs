//! File handles backed by the overlay's content store.
//!
//! An `OverlayFile` holds a weak reference back to the overlay and takes an
//! I/O request guard on every call, so a handle that outlives the overlay
//! fails with `Closed` instead of touching freed storage. Offsets are
//! logical: byte 0 is the first content byte after the integrity header,
//! and the bias is applied internally.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};

use crate::error::{OverlayError, Result};
use crate::header::HEADER_LENGTH;
use crate::inode::InodeNumber;
use crate::overlay::{IoRequest, Overlay};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where the handle's data lives. Some content stores hand out real file
/// descriptors; others only reference an inode and serve I/O elsewhere.
enum FileData {
    Fd(File),
    Inode(#[allow(dead_code)] InodeNumber),
}

/// Attributes of an open overlay file, in logical terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Content size, excluding the integrity header.
    pub size: u64,
}

pub struct OverlayFile {
    data: FileData,
    overlay: Weak<Overlay>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OverlayFile {
    pub(crate) fn from_file(file: File, overlay: Weak<Overlay>) -> Self {
        OverlayFile {
            data: FileData::Fd(file),
            overlay,
        }
    }

    /// A handle that references an inode without a descriptor, for content
    /// stores that serve I/O through the catalog instead of handing out
    /// file descriptors. Operations such a store cannot serve return
    /// `Unimplemented`.
    pub fn from_inode(ino: InodeNumber, overlay: Weak<Overlay>) -> Self {
        OverlayFile {
            data: FileData::Inode(ino),
            overlay,
        }
    }

    fn with_fd<T>(&self, op: impl FnOnce(&File) -> Result<T>) -> Result<T> {
        let overlay: Arc<Overlay> = self.overlay.upgrade().ok_or(OverlayError::Closed)?;
        let _guard = IoRequest::new(&overlay)?;
        match &self.data {
            FileData::Fd(file) => op(file),
            FileData::Inode(_) => Err(OverlayError::Unimplemented),
        }
    }

    pub fn stat(&self) -> Result<FileStat> {
        self.with_fd(|file| {
            let len = file.metadata()?.len();
            Ok(FileStat {
                size: len.saturating_sub(HEADER_LENGTH as u64),
            })
        })
    }

    /// Reads up to `buf.len()` bytes at the given content offset.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.with_fd(|file| Ok(file.read_at(buf, offset + HEADER_LENGTH as u64)?))
    }

    /// Scatter write at the given content offset.
    pub fn pwritev(&self, bufs: &[&[u8]], offset: u64) -> Result<usize> {
        self.with_fd(|file| {
            let iov: Vec<std::io::IoSlice> = bufs.iter().map(|buf| std::io::IoSlice::new(buf)).collect();
            let written = nix::sys::uio::pwritev(
                file.as_raw_fd(),
                &iov,
                (offset + HEADER_LENGTH as u64) as libc::off_t,
            )
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
            Ok(written)
        })
    }

    /// Moves the handle's cursor, in content offsets, returning the new
    /// position.
    pub fn seek(&self, pos: SeekFrom) -> Result<u64> {
        self.with_fd(|file| {
            let physical = match pos {
                SeekFrom::Start(offset) => SeekFrom::Start(offset + HEADER_LENGTH as u64),
                other => other,
            };
            let landed = (&*file).seek(physical)?;
            landed
                .checked_sub(HEADER_LENGTH as u64)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek landed inside the overlay file header",
                    )
                    .into()
                })
        })
    }

    /// Truncates or extends the content to exactly `len` bytes.
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.with_fd(|file| Ok(file.set_len(len + HEADER_LENGTH as u64)?))
    }

    pub fn fsync(&self) -> Result<()> {
        self.with_fd(|file| Ok(file.sync_all()?))
    }

    pub fn fdatasync(&self) -> Result<()> {
        self.with_fd(|file| Ok(file.sync_data()?))
    }

    /// Preallocates storage for `len` content bytes at `offset`.
    pub fn fallocate(&self, offset: u64, len: u64) -> Result<()> {
        self.with_fd(|file| {
            #[cfg(target_os = "linux")]
            {
                let ret = unsafe {
                    libc::fallocate(
                        file.as_raw_fd(),
                        0,
                        (offset + HEADER_LENGTH as u64) as libc::off_t,
                        len as libc::off_t,
                    )
                };
                if ret < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(())
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = (offset, len, file);
                Err(OverlayError::Unimplemented)
            }
        })
    }

    /// Reads the whole content, header excluded.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.with_fd(|file| {
            let mut file = &*file;
            file.seek(SeekFrom::Start(HEADER_LENGTH as u64))?;
            let mut out = Vec::new();
            file.read_to_end(&mut out)?;
            Ok(out)
        })
    }
}
