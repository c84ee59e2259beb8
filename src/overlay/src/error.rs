use std::io;

use crate::inode::InodeNumber;

/// Result alias used throughout the overlay crate.
pub type Result<T, E = OverlayError> = std::result::Result<T, E>;

/// Errors produced by the overlay engine.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// The overlay has been shut down. Nothing can be done with it until it
    /// is re-opened.
    #[error("cannot access overlay after it is closed")]
    Closed,

    /// No overlay data is recorded for this inode.
    #[error("no overlay data found for inode {0}")]
    NotFound(InodeNumber),

    /// On-disk overlay data failed an integrity check. The next startup will
    /// run a consistency check and attempt a repair.
    #[error("corrupt overlay data for inode {ino}: {reason}")]
    Corrupt { ino: InodeNumber, reason: String },

    /// A name that is not a valid path component (empty, contains a path
    /// separator or NUL, or exceeds the maximum component length).
    #[error("invalid path component {0:?}")]
    InvalidPath(String),

    /// Underlying storage failure.
    #[error("overlay I/O error: {0}")]
    Io(#[from] io::Error),

    /// A caller broke an internal invariant (e.g. allocating an inode number
    /// before initialization). Aborts in debug builds.
    #[error("overlay invariant violated: {0}")]
    InvariantViolation(String),

    /// The operation is not available on this overlay file variant.
    #[error("operation not implemented for this overlay file variant")]
    Unimplemented,
}

impl OverlayError {
    pub(crate) fn corrupt(ino: InodeNumber, reason: impl Into<String>) -> Self {
        OverlayError::Corrupt {
            ino,
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for OverlayError {
    fn from(err: rusqlite::Error) -> Self {
        OverlayError::Io(io::Error::new(io::ErrorKind::Other, err))
    }
}

/// Checks a programmer-error invariant. Aborts in debug builds and degrades
/// to an `InvariantViolation` error in release builds.
macro_rules! check_invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            let msg = format!($($arg)*);
            debug_assert!(false, "{}", msg);
            return Err($crate::error::OverlayError::InvariantViolation(msg));
        }
    };
}

pub(crate) use check_invariant;
