//! Lock-free and wait-free MPMC FIFO queues for concurrent benchmarks and
//! runtime libraries.
//!
//! This crate provides two queue implementations, both designed for a
//! fixed, small set of participants (OS threads or executor workers)
//! identified by a dense `pid` in `[0, participants)`:
//!
//! - [`CrTurnQueue`]: lock-free, built around turn-based round-robin
//!   helping between enqueuers.
//! - [`WfQueue`]: wait-free with a per-operation step bound independent of
//!   contention, built around phase-numbered operation descriptors that
//!   every participant helps complete on its way in.
//!
//! Both reclaim retired nodes with epoch-based reclamation
//! ([`crossbeam_epoch`]) rather than the hand-rolled hazard pointers the
//! source algorithms were originally described against; see each module's
//! documentation for the correspondence.

pub mod config;
pub mod error;
mod reclaim;
pub mod queue;

pub use config::QueueConfig;
pub use error::QueueError;
pub use queue::cr_turn::CrTurnQueue;
pub use queue::wf::WfQueue;
pub use queue::RideableMap;
