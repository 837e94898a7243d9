//! Ordlock: deadlock-avoiding reentrant locks coordinated through a
//! shared wait-for graph.
//!
//! # Overview
//!
//! Every [`OrderedLock`] reports its holds and waits to a
//! [`LockManager`], which maintains the process-wide wait-for graph.
//! Whenever a thread is about to park on a contended lock, the manager
//! searches the graph for a cycle. If one is found, it picks a victim
//! thread, forces the victim's cycle-participating locks to pass to the
//! next queued waiters, and remembers their reentrance depths; the
//! victim reacquires them at the recorded depths once its own wait
//! finishes. Circular waiting therefore cannot persist — at the cost
//! that exclusive access may be interrupted between `acquire` and
//! `release`.
//!
//! # Core Guarantees
//!
//! - **Mutual exclusion**: at most one thread owns a lock at a time
//! - **FIFO fairness**: locks are granted in request-arrival order;
//!   only deadlock resolution reorders a queue
//! - **Deadlock freedom**: no circular wait persists while the detector
//!   is live
//! - **Depth restoration**: a suspended lock returns to its owner at
//!   the exact reentrance depth it was taken at
//! - **Graceful degradation**: an internal detector failure disables
//!   detection permanently instead of poisoning lock operation
//!
//! # Module Structure
//!
//! - [`cancel`]: cancellation tokens for timed acquisition
//! - [`hook`]: host callback around waits and releases
//! - [`lock`]: the reentrant FIFO lock
//! - [`manager`]: the coordinator, suspension records, resume protocol
//! - [`rule`]: scheduling rules and the shared resource handle
//! - [`test_utils`]: logging and assertion helpers for tests
//!
//! # Example
//!
//! ```
//! use ordlock::LockManager;
//!
//! let manager = LockManager::new();
//! let lock = manager.new_lock();
//!
//! lock.acquire();
//! lock.acquire(); // reentrant
//! assert_eq!(lock.depth(), 2);
//! lock.release();
//! lock.release();
//! assert_eq!(lock.depth(), 0);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
mod detector;
pub mod hook;
pub mod lock;
pub mod manager;
mod queue;
pub mod rule;
mod semaphore;
pub mod test_utils;

// Re-exports for convenient access to the core types
pub use cancel::{CancelToken, Cancelled};
pub use hook::LockHook;
pub use lock::OrderedLock;
pub use manager::{LockManager, LockManagerBuilder};
pub use rule::{Resource, SchedulingRule};
