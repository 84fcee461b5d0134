//! WfQueue: a bounded wait-free MPMC FIFO built on phase-numbered operation
//! descriptors.
//!
//! Every participant publishes an `OpDesc` carrying a monotone `phase`
//! number before attempting its own work; on the way in, it first helps
//! every other participant whose descriptor is still pending with a phase
//! at or below its own. Because phases only increase and every participant
//! helps everyone behind it, no single operation can be starved
//! indefinitely — the per-operation step bound is polynomial in the
//! participant count, independent of how many steps other threads take.
//!
//! Based on the Kogan-Petrank wait-free queue as adapted by Ramalhete and
//! Correia (ConcurrencyFreaks) for a thread-indexed benchmark harness.
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use log::{debug, trace};

use crate::config::QueueConfig;
use crate::error::{validate_config, validate_participants, QueueError};
use crate::queue::RideableMap;
use crate::reclaim::Reclaimer;

const NONE: isize = -1;

struct Node<V> {
    value: std::cell::UnsafeCell<Option<V>>,
    /// Set once this node's value slot has been consumed by a dequeue and
    /// it has taken over as the new sentinel; the sole signal, per the
    /// algorithm's design, that a payload slot is safe to give up.
    item_deletable: AtomicBool,
    enq_pid: usize,
    deq_pid: AtomicIsize,
    next: Atomic<Node<V>>,
}

impl<V> Node<V> {
    fn sentinel() -> Self {
        Node {
            value: std::cell::UnsafeCell::new(None),
            item_deletable: AtomicBool::new(true),
            enq_pid: 0,
            deq_pid: AtomicIsize::new(NONE),
            next: Atomic::null(),
        }
    }

    fn with_value(value: V, enq_pid: usize) -> Self {
        Node {
            value: std::cell::UnsafeCell::new(Some(value)),
            item_deletable: AtomicBool::new(false),
            enq_pid,
            deq_pid: AtomicIsize::new(NONE),
            next: Atomic::null(),
        }
    }

    /// # Safety
    /// Must be called at most once, only by the participant whose dequeue
    /// resolved to this node's predecessor, and only before `next` is
    /// retired. See the module-level note on `item_deletable`.
    unsafe fn take_value(&self) -> V {
        (*self.value.get())
            .take()
            .expect("dequeued node delivered without a value")
    }
}

struct OpDesc<V> {
    pending: bool,
    is_enqueue: bool,
    phase: i64,
    node: Atomic<Node<V>>,
}

impl<V> OpDesc<V> {
    fn new(phase: i64, pending: bool, is_enqueue: bool, node: Shared<'_, Node<V>>) -> Self {
        let cell = Atomic::null();
        cell.store(node, Ordering::Relaxed);
        OpDesc {
            pending,
            is_enqueue,
            phase,
            node: cell,
        }
    }

    fn terminal() -> Self {
        OpDesc {
            pending: false,
            is_enqueue: true,
            phase: NONE as i64,
            node: Atomic::null(),
        }
    }
}

/// A bounded wait-free MPMC FIFO queue.
///
/// See the module documentation for the algorithm. `V` must be `Send` and
/// `'static` for the same reasons as [`crate::CrTurnQueue`].
pub struct WfQueue<V: Send + 'static> {
    participants: usize,
    reclaimer: Reclaimer,
    head: CachePadded<Atomic<Node<V>>>,
    tail: CachePadded<Atomic<Node<V>>>,
    state: Box<[CachePadded<Atomic<OpDesc<V>>>]>,
    opdesc_end: CachePadded<Atomic<OpDesc<V>>>,
}

unsafe impl<V: Send> Send for WfQueue<V> {}
unsafe impl<V: Send> Sync for WfQueue<V> {}

impl<V: Send + 'static> std::fmt::Debug for WfQueue<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WfQueue")
            .field("participants", &self.participants)
            .finish_non_exhaustive()
    }
}

impl<V: Send + 'static> WfQueue<V> {
    pub fn new(participants: usize) -> Result<Self, QueueError> {
        Self::with_config(participants, QueueConfig::default())
    }

    pub fn with_config(participants: usize, config: QueueConfig) -> Result<Self, QueueError> {
        validate_participants(participants)?;
        validate_config(&config)?;
        let reclaimer = Reclaimer::new(participants, config);
        let guard = reclaimer.pin(0);

        let opdesc_end = Owned::new(OpDesc::terminal()).into_shared(&guard);
        let opdesc_end_cell = CachePadded::new(Atomic::null());
        opdesc_end_cell.store(opdesc_end, Ordering::Relaxed);

        let sentinel = Owned::new(Node::sentinel()).into_shared(&guard);
        let head = CachePadded::new(Atomic::null());
        head.store(sentinel, Ordering::Relaxed);
        let tail = CachePadded::new(Atomic::null());
        tail.store(sentinel, Ordering::Relaxed);

        let state: Box<[_]> = (0..participants)
            .map(|_| {
                let cell = CachePadded::new(Atomic::null());
                cell.store(opdesc_end, Ordering::Relaxed);
                cell
            })
            .collect();

        debug!("WfQueue constructed with {participants} participants");

        Ok(WfQueue {
            participants,
            reclaimer,
            head,
            tail,
            state,
            opdesc_end: opdesc_end_cell,
        })
    }

    fn check_pid(&self, pid: usize) {
        assert!(
            pid < self.participants,
            "pid {pid} out of range for {} participants",
            self.participants
        );
    }

    fn max_phase(&self, guard: &Guard) -> i64 {
        let mut max = NONE as i64;
        for i in 0..self.participants {
            let desc = self.state[i].load(Ordering::Acquire, guard);
            let desc_ref = unsafe { desc.deref() };
            if desc_ref.phase > max {
                max = desc_ref.phase;
            }
        }
        max
    }

    fn is_still_pending(&self, i: usize, phase: i64, guard: &Guard) -> bool {
        let desc = self.state[i].load(Ordering::Acquire, guard);
        let desc_ref = unsafe { desc.deref() };
        desc_ref.pending && desc_ref.phase <= phase
    }

    fn help(&self, phase: i64, guard: &Guard) {
        for i in 0..self.participants {
            let desc = self.state[i].load(Ordering::Acquire, guard);
            let desc_ref = unsafe { desc.deref() };
            if desc_ref.pending && desc_ref.phase <= phase {
                trace!(
                    "phase {phase} dispatching help to participant {i} ({})",
                    if desc_ref.is_enqueue { "enqueue" } else { "dequeue" }
                );
                if desc_ref.is_enqueue {
                    self.help_enq(i, phase, guard);
                } else {
                    self.help_deq(i, phase, guard);
                }
            }
        }
    }

    /// Swaps our own `state[pid]` back to the shared terminal descriptor,
    /// retiring whatever was there unless it has already been swapped to
    /// terminal by a helper (retiring the shared terminal object itself
    /// would be a use-after-free for every other participant).
    fn retire_own_state(&self, pid: usize, guard: &Guard, attempts: usize) {
        let opdesc_end = self.opdesc_end.load(Ordering::Acquire, guard);
        let mut desc = self.state[pid].load(Ordering::Acquire, guard);
        for _ in 0..attempts {
            if desc == opdesc_end {
                break;
            }
            match self.state[pid].compare_exchange(
                desc,
                opdesc_end,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => break,
                Err(e) => desc = e.current,
            }
        }
        if desc != opdesc_end {
            unsafe { guard.defer_destroy(desc) };
        }
    }

    /// Enqueues `value`. Always succeeds.
    pub fn push(&self, value: V, pid: usize) -> bool {
        self.check_pid(pid);
        let guard = self.reclaimer.pin(pid);

        let phase = self.max_phase(&guard) + 1;
        let node = Owned::new(Node::with_value(value, pid)).into_shared(&guard);
        let desc = Owned::new(OpDesc::new(phase, true, true, node)).into_shared(&guard);
        self.state[pid].store(desc, Ordering::Release);

        self.help(phase, &guard);
        self.help_finish_enq(&guard);

        self.retire_own_state(pid, &guard, self.participants * 2);
        true
    }

    /// Dequeues and returns the oldest value, or `None` if the queue was
    /// observed empty at the operation's linearization point.
    pub fn pop(&self, pid: usize) -> Option<V> {
        self.check_pid(pid);
        let guard = self.reclaimer.pin(pid);

        let phase = self.max_phase(&guard) + 1;
        let desc = Owned::new(OpDesc::new(phase, true, false, Shared::null())).into_shared(&guard);
        self.state[pid].store(desc, Ordering::Release);

        self.help(phase, &guard);
        self.help_finish_deq(&guard);

        let cur_desc = self.state[pid].load(Ordering::Acquire, &guard);
        let cur_desc_ref = unsafe { cur_desc.deref() };
        let node = cur_desc_ref.node.load(Ordering::Acquire, &guard);

        if node.is_null() {
            self.reclaimer.note_empty(pid, &guard);
            self.retire_own_state(pid, &guard, self.participants);
            return None;
        }

        let node_ref = unsafe { node.deref() };
        let next = node_ref.next.load(Ordering::Acquire, &guard);
        let next_ref = unsafe { next.deref() };
        let value = unsafe { next_ref.take_value() };
        next_ref.item_deletable.store(true, Ordering::Release);
        unsafe { guard.defer_destroy(node) };

        self.retire_own_state(pid, &guard, self.participants * 2);
        Some(value)
    }

    fn help_enq(&self, i: usize, phase: i64, guard: &Guard) {
        trace!("helping enqueue for participant {i} at phase {phase}");
        while self.is_still_pending(i, phase, guard) {
            let last = self.tail.load(Ordering::Acquire, guard);
            if last != self.tail.load(Ordering::Acquire, guard) {
                continue;
            }
            let last_ref = unsafe { last.deref() };
            let next = last_ref.next.load(Ordering::Acquire, guard);
            if last != self.tail.load(Ordering::Acquire, guard) {
                continue;
            }
            if !next.is_null() {
                self.help_finish_enq(guard);
                continue;
            }
            if !self.is_still_pending(i, phase, guard) {
                continue;
            }
            let cur_desc = self.state[i].load(Ordering::Acquire, guard);
            if cur_desc != self.state[i].load(Ordering::Acquire, guard) {
                continue;
            }
            let cur_desc_ref = unsafe { cur_desc.deref() };
            let target = cur_desc_ref.node.load(Ordering::Acquire, guard);
            if last_ref
                .next
                .compare_exchange(Shared::null(), target, Ordering::AcqRel, Ordering::Relaxed, guard)
                .is_ok()
            {
                self.help_finish_enq(guard);
                return;
            }
        }
    }

    fn help_finish_enq(&self, guard: &Guard) {
        let last = self.tail.load(Ordering::Acquire, guard);
        if last != self.tail.load(Ordering::Acquire, guard) {
            return;
        }
        let last_ref = unsafe { last.deref() };
        let next = last_ref.next.load(Ordering::Acquire, guard);
        if last != self.tail.load(Ordering::Acquire, guard) || next.is_null() {
            return;
        }
        let next_ref = unsafe { next.deref() };
        let tid = next_ref.enq_pid;
        let cur_desc = self.state[tid].load(Ordering::Acquire, guard);
        if cur_desc != self.state[tid].load(Ordering::Acquire, guard) {
            return;
        }
        let cur_desc_ref = unsafe { cur_desc.deref() };
        if last == self.tail.load(Ordering::Acquire, guard)
            && cur_desc_ref.node.load(Ordering::Acquire, guard) == next
        {
            let new_desc =
                Owned::new(OpDesc::new(cur_desc_ref.phase, false, true, next)).into_shared(guard);
            match self.state[tid].compare_exchange(
                cur_desc,
                new_desc,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => unsafe { guard.defer_destroy(cur_desc) },
                Err(_) => unsafe { drop(new_desc.into_owned()) },
            }
            let _ = self.tail.compare_exchange(last, next, Ordering::AcqRel, Ordering::Relaxed, guard);
        }
    }

    fn help_deq(&self, i: usize, phase: i64, guard: &Guard) {
        trace!("helping dequeue for participant {i} at phase {phase}");
        while self.is_still_pending(i, phase, guard) {
            let first = self.head.load(Ordering::Acquire, guard);
            let last = self.tail.load(Ordering::Acquire, guard);
            if first != self.head.load(Ordering::Acquire, guard) || last != self.tail.load(Ordering::Acquire, guard) {
                continue;
            }
            let first_ref = unsafe { first.deref() };
            let next = first_ref.next.load(Ordering::Acquire, guard);
            if first != self.head.load(Ordering::Acquire, guard) {
                continue;
            }

            if first == last {
                if next.is_null() {
                    let cur_desc = self.state[i].load(Ordering::Acquire, guard);
                    if cur_desc != self.state[i].load(Ordering::Acquire, guard) {
                        continue;
                    }
                    if last == self.tail.load(Ordering::Acquire, guard) && self.is_still_pending(i, phase, guard) {
                        let cur_desc_ref = unsafe { cur_desc.deref() };
                        let new_desc = Owned::new(OpDesc::new(cur_desc_ref.phase, false, false, Shared::null()))
                            .into_shared(guard);
                        match self.state[i].compare_exchange(
                            cur_desc,
                            new_desc,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        ) {
                            Ok(_) => unsafe { guard.defer_destroy(cur_desc) },
                            Err(_) => unsafe { drop(new_desc.into_owned()) },
                        }
                    }
                } else {
                    self.help_finish_enq(guard);
                }
                continue;
            }

            let cur_desc = self.state[i].load(Ordering::Acquire, guard);
            if cur_desc != self.state[i].load(Ordering::Acquire, guard) {
                continue;
            }
            let cur_desc_ref = unsafe { cur_desc.deref() };
            let node = cur_desc_ref.node.load(Ordering::Acquire, guard);
            if !self.is_still_pending(i, phase, guard) {
                break;
            }
            if first == self.head.load(Ordering::Acquire, guard) && node != first {
                let new_desc =
                    Owned::new(OpDesc::new(cur_desc_ref.phase, true, false, first)).into_shared(guard);
                match self.state[i].compare_exchange(
                    cur_desc,
                    new_desc,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => unsafe { guard.defer_destroy(cur_desc) },
                    Err(_) => {
                        unsafe { drop(new_desc.into_owned()) };
                        continue;
                    }
                }
            }
            let first_ref = unsafe { first.deref() };
            let _ = first_ref
                .deq_pid
                .compare_exchange(NONE, i as isize, Ordering::AcqRel, Ordering::Acquire);
            self.help_finish_deq(guard);
        }
    }

    fn help_finish_deq(&self, guard: &Guard) {
        let first = self.head.load(Ordering::Acquire, guard);
        if first != self.head.load(Ordering::Acquire, guard) {
            return;
        }
        let first_ref = unsafe { first.deref() };
        let next = first_ref.next.load(Ordering::Acquire, guard);
        let claimant = first_ref.deq_pid.load(Ordering::Acquire);
        if claimant == NONE {
            return;
        }
        let claimant = claimant as usize;
        let cur_desc = self.state[claimant].load(Ordering::Acquire, guard);
        if first == self.head.load(Ordering::Acquire, guard) && !next.is_null() {
            let cur_desc_ref = unsafe { cur_desc.deref() };
            let new_desc = Owned::new(OpDesc::new(
                cur_desc_ref.phase,
                false,
                false,
                cur_desc_ref.node.load(Ordering::Acquire, guard),
            ))
            .into_shared(guard);
            match self.state[claimant].compare_exchange(
                cur_desc,
                new_desc,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => unsafe { guard.defer_destroy(cur_desc) },
                Err(_) => unsafe { drop(new_desc.into_owned()) },
            }
            let _ = self.head.compare_exchange(first, next, Ordering::AcqRel, Ordering::Relaxed, guard);
        }
    }
}

impl<V: Send + 'static> Drop for WfQueue<V> {
    fn drop(&mut self) {
        let guard = self.reclaimer.pin(0);
        while self.pop(0).is_some() {}
        unsafe {
            let head = self.head.load(Ordering::Acquire, &guard);
            if !head.is_null() {
                guard.defer_destroy(head);
            }
            let opdesc_end = self.opdesc_end.load(Ordering::Acquire, &guard);
            if !opdesc_end.is_null() {
                guard.defer_destroy(opdesc_end);
            }
        }
    }
}

impl<V: Send + 'static> RideableMap<(), V> for WfQueue<V> {
    fn get(&self, _key: (), _pid: usize) -> Option<V> {
        None
    }

    fn put(&self, _key: (), _value: V, _pid: usize) -> Option<V> {
        None
    }

    fn replace(&self, _key: (), _value: V, _pid: usize) -> Option<V> {
        None
    }

    fn insert(&self, _key: (), value: V, pid: usize) -> bool {
        self.push(value, pid)
    }

    fn remove(&self, _key: (), pid: usize) -> Option<V> {
        self.pop(pid)
    }
}
