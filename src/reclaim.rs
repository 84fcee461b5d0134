//! A thin per-participant wrapper around `crossbeam_epoch`, standing in for
//! the hazard-pointer reclaimer the source algorithms were written against.
//!
//! Each participant gets its own `LocalHandle`, registered once at
//! construction time rather than on every call, since `pid` is a stable,
//! dense assignment for the caller's whole lifetime (see the crate's
//! participant-identifier contract). `pin()` plays the role of the
//! reclaimer's `start_op`/`end_op` brackets: the returned `Guard` is kept
//! alive for the whole operation (including any helping it performs on
//! other participants' behalf), so every load made under it is safe to
//! dereference without a separate hazard-pointer slot per role.
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::{Collector, Guard, LocalHandle};
use crossbeam_utils::CachePadded;
use log::trace;

use crate::config::QueueConfig;

pub(crate) struct Reclaimer {
    // Kept alive so the registration below stays valid; each `LocalHandle`
    // also holds its own reference to the shared epoch state.
    _collector: Collector,
    handles: Vec<LocalHandle>,
    ops: Vec<CachePadded<AtomicU64>>,
    empty_ops: Vec<CachePadded<AtomicU64>>,
    config: QueueConfig,
}

// Each handle is only ever touched by the single thread pinned to its
// index; the `Reclaimer` as a whole is shared read-only after construction.
unsafe impl Send for Reclaimer {}
unsafe impl Sync for Reclaimer {}

impl Reclaimer {
    pub(crate) fn new(participants: usize, config: QueueConfig) -> Self {
        let collector = Collector::new();
        let handles = (0..participants).map(|_| collector.register()).collect();
        let ops = (0..participants)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        let empty_ops = (0..participants)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Reclaimer {
            _collector: collector,
            handles,
            ops,
            empty_ops,
            config,
        }
    }

    /// Opens a critical section for `pid`. The caller must keep the
    /// returned guard alive for the duration of its operation, including
    /// any helping performed on other participants' behalf.
    pub(crate) fn pin(&self, pid: usize) -> Guard {
        let guard = self.handles[pid].pin();
        let count = self.ops[pid].fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.config.epoch_frequency as u64 == 0 {
            trace!("pid {pid} reached epoch_frequency, flushing");
            guard.flush();
        }
        guard
    }

    /// Called when `pid` observes the queue to be empty, so the
    /// `empty_frequency` knob can pace reclamation independently of the
    /// general operation count.
    pub(crate) fn note_empty(&self, pid: usize, guard: &Guard) {
        let count = self.empty_ops[pid].fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.config.empty_frequency as u64 == 0 {
            trace!("pid {pid} reached empty_frequency, flushing");
            guard.flush();
        }
    }
}
