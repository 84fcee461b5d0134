//! CRTurnQueue: a lock-free MPMC FIFO with rotating turn-based helping.
//!
//! Every participant announces intent (an enqueue node, or a dequeue
//! request) in a slot dedicated to it; any other participant that happens
//! to observe `tail`/`head` lagging behind can finish the announcement on
//! the announcer's behalf. Dequeuers hand off "turns" round-robin so that,
//! over any bounded window, every pending dequeue is eventually serviced.
//!
//! Based on the CRTurnQueue algorithm by Ramalhete and Correia
//! (ConcurrencyFreaks), as adapted for a thread-indexed benchmark harness.
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicIsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use log::{debug, trace};

use crate::config::QueueConfig;
use crate::error::{validate_config, validate_participants, QueueError};
use crate::queue::RideableMap;
use crate::reclaim::Reclaimer;

const NONE: isize = -1;

struct Node<V> {
    value: UnsafeCell<Option<V>>,
    enq_pid: usize,
    deq_pid: AtomicIsize,
    next: Atomic<Node<V>>,
}

impl<V> Node<V> {
    fn sentinel() -> Self {
        Node {
            value: UnsafeCell::new(None),
            enq_pid: 0,
            deq_pid: AtomicIsize::new(NONE),
            next: Atomic::null(),
        }
    }

    fn with_value(value: V, enq_pid: usize) -> Self {
        Node {
            value: UnsafeCell::new(Some(value)),
            enq_pid,
            deq_pid: AtomicIsize::new(NONE),
            next: Atomic::null(),
        }
    }

    /// # Safety
    /// Must be called at most once, and only by the participant that has
    /// just become the node's unique claimant (the thread for which
    /// `deq_help[pid]` now points here). At that point no other
    /// participant will read this node's value again; they only ever
    /// traverse `next` from here on.
    unsafe fn take_value(&self) -> V {
        (*self.value.get())
            .take()
            .expect("dequeued node delivered without a value")
    }
}

/// A lock-free MPMC FIFO queue with bounded turn-based helping.
///
/// See the module documentation for the algorithm. `V` must be `Send` and
/// `'static` because values cross thread boundaries and nodes are reclaimed
/// through an epoch-based collector.
pub struct CrTurnQueue<V: Send + 'static> {
    participants: usize,
    reclaimer: Reclaimer,
    head: CachePadded<Atomic<Node<V>>>,
    tail: CachePadded<Atomic<Node<V>>>,
    enqueuers: Box<[CachePadded<Atomic<Node<V>>>]>,
    deq_self: Box<[CachePadded<Atomic<Node<V>>>]>,
    deq_help: Box<[CachePadded<Atomic<Node<V>>>]>,
}

// Every shared field is either an atomic or guarded by the epoch collector;
// the algorithm's own discipline (one pid per thread, never shared) is what
// makes concurrent access to `&CrTurnQueue` sound.
unsafe impl<V: Send> Send for CrTurnQueue<V> {}
unsafe impl<V: Send> Sync for CrTurnQueue<V> {}

impl<V: Send + 'static> std::fmt::Debug for CrTurnQueue<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrTurnQueue")
            .field("participants", &self.participants)
            .finish_non_exhaustive()
    }
}

impl<V: Send + 'static> CrTurnQueue<V> {
    /// Creates a queue for up to `participants` concurrent callers, using
    /// the default reclamation tuning (`QueueConfig::default()`).
    pub fn new(participants: usize) -> Result<Self, QueueError> {
        Self::with_config(participants, QueueConfig::default())
    }

    /// Creates a queue with explicit reclamation tuning.
    pub fn with_config(participants: usize, config: QueueConfig) -> Result<Self, QueueError> {
        validate_participants(participants)?;
        validate_config(&config)?;
        let reclaimer = Reclaimer::new(participants, config);
        let guard = reclaimer.pin(0);

        let sentinel = Owned::new(Node::sentinel()).into_shared(&guard);
        let head = CachePadded::new(Atomic::null());
        head.store(sentinel, Ordering::Relaxed);
        let tail = CachePadded::new(Atomic::null());
        tail.store(sentinel, Ordering::Relaxed);

        let enqueuers = (0..participants)
            .map(|_| CachePadded::new(Atomic::null()))
            .collect();

        let deq_self: Box<[_]> = (0..participants)
            .map(|_| {
                let node = Owned::new(Node::sentinel()).into_shared(&guard);
                let cell = CachePadded::new(Atomic::null());
                cell.store(node, Ordering::Relaxed);
                cell
            })
            .collect();
        let deq_help: Box<[_]> = (0..participants)
            .map(|_| {
                let node = Owned::new(Node::sentinel()).into_shared(&guard);
                let cell = CachePadded::new(Atomic::null());
                cell.store(node, Ordering::Relaxed);
                cell
            })
            .collect();

        debug!("CrTurnQueue constructed with {participants} participants");

        Ok(CrTurnQueue {
            participants,
            reclaimer,
            head,
            tail,
            enqueuers,
            deq_self,
            deq_help,
        })
    }

    fn check_pid(&self, pid: usize) {
        assert!(
            pid < self.participants,
            "pid {pid} out of range for {} participants",
            self.participants
        );
    }

    /// Enqueues `value`. Always succeeds.
    ///
    /// Steps when uncontended: publish the node in `enqueuers[pid]`, link
    /// it onto `tail.next` with a CAS, advance `tail`, clear the slot.
    /// Any of these steps may instead be completed by another participant
    /// passing through its own `push`.
    pub fn push(&self, value: V, pid: usize) -> bool {
        self.check_pid(pid);
        let guard = self.reclaimer.pin(pid);

        let node = Owned::new(Node::with_value(value, pid)).into_shared(&guard);
        self.enqueuers[pid].store(node, Ordering::Release);

        for _ in 0..self.participants {
            if self.enqueuers[pid].load(Ordering::Acquire, &guard).is_null() {
                return true; // Some participant completed all the steps for us.
            }

            let ltail = self.tail.load(Ordering::Acquire, &guard);
            let ltail_ref = unsafe { ltail.deref() };

            // Help the previous enqueuer clear its slot.
            let prior_slot = &self.enqueuers[ltail_ref.enq_pid];
            let published = prior_slot.load(Ordering::Acquire, &guard);
            if published == ltail {
                let _ = prior_slot.compare_exchange(
                    published,
                    Shared::null(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                    &guard,
                );
            }

            // Help link the next round-robin pending enqueuer onto tail.
            for j in 1..=self.participants {
                let idx = (j + ltail_ref.enq_pid) % self.participants;
                let candidate = self.enqueuers[idx].load(Ordering::Acquire, &guard);
                if candidate.is_null() {
                    continue;
                }
                let _ = ltail_ref.next.compare_exchange(
                    Shared::null(),
                    candidate,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                    &guard,
                );
                break;
            }

            // Help advance tail.
            let lnext = ltail_ref.next.load(Ordering::Acquire, &guard);
            if !lnext.is_null() {
                let _ = self.tail.compare_exchange(
                    ltail,
                    lnext,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                    &guard,
                );
            }
        }

        // Make sure our own slot is clear even if no helper got to it.
        self.enqueuers[pid].store(Shared::null(), Ordering::Release);
        true
    }

    /// Dequeues and returns the oldest value, or `None` if the queue was
    /// observed empty at the operation's linearization point.
    pub fn pop(&self, pid: usize) -> Option<V> {
        self.check_pid(pid);
        let guard = self.reclaimer.pin(pid);

        let prev_req = self.deq_self[pid].load(Ordering::Acquire, &guard);
        let my_req = self.deq_help[pid].load(Ordering::Acquire, &guard);
        self.deq_self[pid].store(my_req, Ordering::Release);

        for _ in 0..self.participants {
            if self.deq_help[pid].load(Ordering::Acquire, &guard) != my_req {
                break; // Someone serviced our request.
            }

            let lhead = self.head.load(Ordering::Acquire, &guard);
            if lhead == self.tail.load(Ordering::Acquire, &guard) {
                // The queue looks empty: roll back our request and try to
                // resolve it definitively via give_up.
                self.deq_self[pid].store(prev_req, Ordering::Release);
                self.reclaimer.note_empty(pid, &guard);
                self.give_up(my_req, pid, &guard);
                if self.deq_help[pid].load(Ordering::Acquire, &guard) != my_req {
                    self.deq_self[pid].store(my_req, Ordering::Relaxed);
                    break;
                }
                return None;
            }

            let lhead_ref = unsafe { lhead.deref() };
            let lnext = lhead_ref.next.load(Ordering::Acquire, &guard);
            if self.search_next(lhead, lnext, &guard) != NONE {
                self.cas_deq_and_head(lhead, lnext, pid, &guard);
            }
        }

        let my_node = self.deq_help[pid].load(Ordering::Acquire, &guard);
        let lhead = self.head.load(Ordering::Acquire, &guard);
        if lhead == self.head.load(Ordering::Acquire, &guard) {
            let lhead_ref = unsafe { lhead.deref() };
            if my_node == lhead_ref.next.load(Ordering::Acquire, &guard) {
                let _ = self.head.compare_exchange(
                    lhead,
                    my_node,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                    &guard,
                );
            }
        }

        let my_node_ref = unsafe { my_node.deref() };
        let value = unsafe { my_node_ref.take_value() };
        if !prev_req.is_null() {
            unsafe { guard.defer_destroy(prev_req) };
        }
        Some(value)
    }

    /// Scans for the next pending dequeue request starting at
    /// `head.deq_pid + 1` (the rotating "turn") and assigns it to `lnext`,
    /// unless another participant already claimed it. Returns the
    /// resulting claimant, or `NONE` if no pending request was found.
    fn search_next(&self, lhead: Shared<'_, Node<V>>, lnext: Shared<'_, Node<V>>, guard: &Guard) -> isize {
        let lhead_ref = unsafe { lhead.deref() };
        let lnext_ref = unsafe { lnext.deref() };
        let turn = lhead_ref.deq_pid.load(Ordering::Acquire);

        for offset in 1..=self.participants {
            let idx = (turn + offset as isize).rem_euclid(self.participants as isize) as usize;
            let self_ptr = self.deq_self[idx].load(Ordering::Acquire, guard);
            let help_ptr = self.deq_help[idx].load(Ordering::Acquire, guard);
            if self_ptr != help_ptr {
                continue; // Not a pending request.
            }
            let _ = lnext_ref.deq_pid.compare_exchange(
                NONE,
                idx as isize,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            break;
        }
        lnext_ref.deq_pid.load(Ordering::Acquire)
    }

    /// Awards `lnext` to whichever participant `lnext.deq_pid` names (using
    /// a hazard-free CAS since `deq_help[d]` for `d != pid` may be retired
    /// concurrently) and advances `head` past `lhead`.
    fn cas_deq_and_head(&self, lhead: Shared<'_, Node<V>>, lnext: Shared<'_, Node<V>>, pid: usize, guard: &Guard) {
        let lnext_ref = unsafe { lnext.deref() };
        let claimant = lnext_ref.deq_pid.load(Ordering::Acquire);
        debug_assert_ne!(claimant, NONE, "search_next must assign a claimant first");

        if claimant == pid as isize {
            self.deq_help[pid].store(lnext, Ordering::Release);
        } else {
            let claimant = claimant as usize;
            let current_help = self.deq_help[claimant].load(Ordering::Acquire, guard);
            if current_help != lnext && self.head.load(Ordering::Acquire, guard) == lhead {
                let _ = self.deq_help[claimant].compare_exchange(
                    current_help,
                    lnext,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                    guard,
                );
            }
        }
        let _ = self.head.compare_exchange(lhead, lnext, Ordering::AcqRel, Ordering::Relaxed, guard);
    }

    /// Used when `pop` finds the queue apparently empty. Re-validates head
    /// and, failing to find a peer to assign `head.next` to, claims it for
    /// `pid` itself before awarding and advancing.
    fn give_up(&self, my_req: Shared<'_, Node<V>>, pid: usize, guard: &Guard) {
        trace!("pid {pid} giving up its turn, queue appeared empty");
        let lhead = self.head.load(Ordering::Acquire, guard);
        if self.deq_help[pid].load(Ordering::Acquire, guard) != my_req
            || lhead == self.tail.load(Ordering::Acquire, guard)
        {
            return;
        }
        if lhead != self.head.load(Ordering::Acquire, guard) {
            return;
        }
        let lhead_ref = unsafe { lhead.deref() };
        let lnext = lhead_ref.next.load(Ordering::Acquire, guard);
        if lhead != self.head.load(Ordering::Acquire, guard) {
            return;
        }
        if self.search_next(lhead, lnext, guard) == NONE {
            let lnext_ref = unsafe { lnext.deref() };
            let _ = lnext_ref
                .deq_pid
                .compare_exchange(NONE, pid as isize, Ordering::AcqRel, Ordering::Acquire);
        }
        self.cas_deq_and_head(lhead, lnext, pid, guard);
    }
}

impl<V: Send + 'static> Drop for CrTurnQueue<V> {
    fn drop(&mut self) {
        let guard = self.reclaimer.pin(0);
        while self.pop(0).is_some() {}
        // `head` commonly aliases whichever `deq_help[d]` last had a
        // dequeue resolved in its favor (`cas_deq_and_head` stores the same
        // pointer into both). Collect the distinct live pointers first so
        // none of them gets `defer_destroy`'d twice.
        unsafe {
            let mut live = Vec::with_capacity(1 + self.deq_self.len() + self.deq_help.len());
            let head = self.head.load(Ordering::Acquire, &guard);
            if !head.is_null() {
                live.push(head);
            }
            for slot in self.deq_self.iter().chain(self.deq_help.iter()) {
                let node = slot.load(Ordering::Acquire, &guard);
                if !node.is_null() && !live.contains(&node) {
                    live.push(node);
                }
            }
            for node in live {
                guard.defer_destroy(node);
            }
        }
    }
}

impl<V: Send + 'static> RideableMap<(), V> for CrTurnQueue<V> {
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
