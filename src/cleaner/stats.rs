use parking_lot::Mutex;
use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{Relaxed, Release},
};

use crate::{utils::percent, OpCode};

/// cumulative cleaning metrics, shared by the facade and the pass driver
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) compaction_passes: AtomicU64,
    pub(crate) disk_passes: AtomicU64,
    pub(crate) aborted_passes: AtomicU64,
    pub(crate) entries_relocated: AtomicU64,
    pub(crate) bytes_relocated: AtomicU64,
    /// bytes of the seglets survivors kept after being closed
    pub(crate) survivor_bytes: AtomicU64,
    pub(crate) segments_freed: AtomicU64,
    pub(crate) survivors_created: AtomicU64,
    pub(crate) seglets_freed: AtomicU64,
    pub(crate) replica_failures: AtomicU64,
    pub(crate) invariant_faults: AtomicU64,
    pub(crate) deferred_passes: AtomicU64,
    /// f64 bits
    pub(crate) write_cost: AtomicU64,
    pub(crate) disk_suspended: AtomicBool,
    pub(crate) last_error: Mutex<Option<OpCode>>,
}

impl Stats {
    pub(crate) fn add(x: &AtomicU64, n: u64) {
        x.fetch_add(n, Relaxed);
    }

    pub(crate) fn set_write_cost(&self, cost: f64) {
        self.write_cost.store(cost.to_bits(), Relaxed);
    }

    pub(crate) fn record_error(&self, e: OpCode) {
        match e {
            OpCode::ReplicaFailed => Self::add(&self.replica_failures, 1),
            OpCode::NoSpace | OpCode::Again => Self::add(&self.deferred_passes, 1),
            _ => Self::add(&self.invariant_faults, 1),
        }
        Self::add(&self.aborted_passes, 1);
        *self.last_error.lock() = Some(e);
    }

    pub(crate) fn set_disk_suspended(&self, x: bool) {
        self.disk_suspended.store(x, Release);
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        let bytes_relocated = self.bytes_relocated.load(Relaxed);
        Statistics {
            compaction_passes: self.compaction_passes.load(Relaxed),
            disk_passes: self.disk_passes.load(Relaxed),
            aborted_passes: self.aborted_passes.load(Relaxed),
            entries_relocated: self.entries_relocated.load(Relaxed),
            bytes_relocated,
            segments_freed: self.segments_freed.load(Relaxed),
            survivors_created: self.survivors_created.load(Relaxed),
            seglets_freed: self.seglets_freed.load(Relaxed),
            replica_failures: self.replica_failures.load(Relaxed),
            invariant_faults: self.invariant_faults.load(Relaxed),
            deferred_passes: self.deferred_passes.load(Relaxed),
            survivor_utilization: percent(bytes_relocated, self.survivor_bytes.load(Relaxed)),
            write_cost: f64::from_bits(self.write_cost.load(Relaxed)),
            disk_cleaning_suspended: self.disk_suspended.load(Relaxed),
            last_error: *self.last_error.lock(),
        }
    }
}

/// a point in time copy of the cleaner's metrics
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Statistics {
    pub compaction_passes: u64,
    pub disk_passes: u64,
    /// passes given up because of an error, nothing was freed by them
    pub aborted_passes: u64,
    pub entries_relocated: u64,
    pub bytes_relocated: u64,
    pub segments_freed: u64,
    pub survivors_created: u64,
    /// net seglets returned to the directory, sources minus survivors
    pub seglets_freed: u64,
    pub replica_failures: u64,
    pub invariant_faults: u64,
    /// passes deferred because no survivor could be allocated
    pub deferred_passes: u64,
    /// percent of survivor memory filled with relocated data
    pub survivor_utilization: u32,
    /// write cost of the compactions since the last disk cleaning
    pub write_cost: f64,
    pub disk_cleaning_suspended: bool,
    pub last_error: Option<OpCode>,
}
