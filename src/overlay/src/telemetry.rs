//! Operation counters and the structured-event seam.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Success/failure counters for one operation family.
#[derive(Default)]
pub struct OpStat {
    success: AtomicU64,
    failure: AtomicU64,
}

impl OpStat {
    pub fn record(&self, ok: bool) {
        if ok {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn successes(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }
}

/// Counters for every public overlay operation.
#[derive(Default)]
pub struct OverlayStats {
    pub load_overlay_dir: OpStat,
    pub save_overlay_dir: OpStat,
    pub has_overlay_dir: OpStat,
    pub has_overlay_file: OpStat,
    pub remove_overlay_dir: OpStat,
    pub remove_overlay_file: OpStat,
    pub recursively_remove_overlay_dir: OpStat,
    pub add_child: OpStat,
    pub remove_child: OpStat,
    pub remove_children: OpStat,
    pub rename_child: OpStat,
    pub open_overlay_file: OpStat,
    pub create_overlay_file: OpStat,
}

/// Outcome of a consistency check run at startup.
#[derive(Debug, Clone)]
pub struct FsckEvent {
    pub runtime: Duration,
    pub success: bool,
    pub attempted_repair: bool,
}

/// Sink for notable overlay lifecycle events.
pub trait StructuredLogger: Send + Sync {
    fn log_fsck(&self, event: FsckEvent);
}

/// Discards every event.
pub struct NullStructuredLogger;

impl StructuredLogger for NullStructuredLogger {
    fn log_fsck(&self, _event: FsckEvent) {}
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_stat_counts() {
        let stat = OpStat::default();
        stat.record(true);
        stat.record(true);
        stat.record(false);
        assert_eq!(stat.successes(), 2);
        assert_eq!(stat.failures(), 1);
    }
}
