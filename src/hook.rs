//! Host callback notified around lock waits and releases.

use std::thread::Thread;

/// Optional collaborator notified before a thread parks on a lock and
/// before a lock is fully released.
///
/// The hook lets an embedding scheduler service pending work
/// cooperatively: the original use case is a UI thread draining its
/// event queue instead of going to sleep while it waits.
///
/// # Contract
///
/// Callbacks may run on any thread and must not block on any resource
/// owned by the lock manager; both are invoked outside the manager's and
/// the lock's mutexes. A panicking hook is caught, logged, and treated
/// as the neutral return.
pub trait LockHook: Send + Sync {
    /// Called before the current thread parks waiting for a lock held by
    /// `owner` (`None` when ownership changed hands concurrently).
    ///
    /// Returning `true` reports that the host serviced the contention
    /// and the lock should be granted to the caller immediately, without
    /// parking. The caller becomes the owner, so a host must only return
    /// `true` once the previous owner has actually released.
    fn about_to_wait(&self, owner: Option<&Thread>) -> bool {
        let _ = owner;
        false
    }

    /// Called before a lock is fully released (depth reaching zero).
    fn about_to_release(&self) {}
}
