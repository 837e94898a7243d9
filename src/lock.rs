//! A reentrant, FIFO-fair lock with forced release and depth
//! restoration.
//!
//! The lock avoids circular-wait deadlocks by reporting every hold and
//! wait to the manager's shared wait-for graph. When the graph detects a
//! cycle, the manager suspends all locks owned by one thread on the
//! cycle: each suspended lock passes to the next queued waiter, and the
//! victim reacquires it at its recorded depth once its own wait
//! finishes. The price of deadlock freedom is that exclusive access can
//! be interrupted between `acquire` and `release`.
//!
//! Starvation is prevented by granting the lock in arrival order; only
//! deadlock resolution reorders a queue.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::thread::Thread;
use std::time::Duration;

use crate::cancel::{CancelToken, Cancelled};
use crate::manager::{ManagerCore, DEFAULT_WAIT_SLICE};
use crate::queue::WaitQueue;
use crate::rule::{Resource, SchedulingRule};
use crate::semaphore::Semaphore;

/// State guarded by the lock's own mutex.
#[derive(Debug)]
struct LockCore {
    /// The thread currently owning the lock.
    owner: Option<Thread>,
    /// Successive acquires by the owner; the lock is released when the
    /// depth reaches zero.
    depth: u32,
    /// Semaphores of threads waiting on the lock, in arrival order.
    queue: WaitQueue,
}

/// A lock used to control write access to an exclusive resource, granted
/// in request-arrival order and coordinated against deadlock.
///
/// Created through [`LockManager::new_lock`](crate::LockManager::new_lock).
pub struct OrderedLock {
    /// Locks are sequentially numbered per manager for debugging and
    /// deterministic victim tie-breaking.
    id: u64,
    /// The coordinator implementing deadlock detection and resolution.
    /// Weak: a lock outliving its manager degrades to a plain lock.
    manager: Weak<ManagerCore>,
    /// Self-handle for building [`Resource`] values.
    me: Weak<OrderedLock>,
    state: Mutex<LockCore>,
}

impl OrderedLock {
    pub(crate) fn new(id: u64, manager: Weak<ManagerCore>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            manager,
            me: me.clone(),
            state: Mutex::new(LockCore {
                owner: None,
                depth: 0,
                queue: WaitQueue::new(),
            }),
        })
    }

    /// The lock's number within its manager.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current reentrance depth.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.state.lock().expect("lock state poisoned").depth
    }

    /// Acquires the lock, waiting as long as it takes.
    ///
    /// Never observes cancellation. Spinning over the timed path keeps
    /// the thread servicing suspended-lock resumption while it waits.
    pub fn acquire(&self) {
        let token = CancelToken::never();
        loop {
            match self.acquire_timeout(&token, Duration::MAX) {
                Ok(true) => return,
                Ok(false) | Err(Cancelled) => {}
            }
        }
    }

    /// Attempts to acquire the lock within `timeout`.
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` on timeout. Fails
    /// with [`Cancelled`] when `token` is cancelled at entry or while
    /// waiting; the queue slot and wait edge are cleaned up exactly as
    /// on timeout. A zero timeout degenerates to a single immediate
    /// attempt.
    pub fn acquire_timeout(
        &self,
        token: &CancelToken,
        timeout: Duration,
    ) -> Result<bool, Cancelled> {
        token.checkpoint()?;
        if timeout.is_zero() {
            return Ok(self.attempt());
        }
        let Some(semaphore) = self.create_semaphore() else {
            return Ok(true);
        };
        tracing::debug!(lock = %self, thread = ?std::thread::current().id(), "waiting to acquire");
        let result = self.do_acquire(&semaphore, token, timeout);
        if let Some(manager) = self.manager.upgrade() {
            manager.resume_suspended(std::thread::current().id());
        }
        match &result {
            Ok(true) => tracing::debug!(lock = %self, "acquired"),
            Ok(false) => tracing::debug!(lock = %self, "acquire timed out"),
            Err(Cancelled) => tracing::debug!(lock = %self, "acquire cancelled"),
        }
        result
    }

    /// Releases one level of reentrance; hands the lock to the next
    /// queued waiter when the depth reaches zero.
    ///
    /// Releasing an unowned lock is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not own the lock.
    pub fn release(&self) {
        {
            let mut core = self.state.lock().expect("lock state poisoned");
            if core.depth == 0 {
                return;
            }
            let current = std::thread::current();
            assert!(
                core.owner.as_ref().is_some_and(|o| o.id() == current.id()),
                "{self} released by {:?}, which does not own it",
                current.id()
            );
            core.depth -= 1;
            if core.depth > 0 {
                drop(core);
                if let Some(manager) = self.manager.upgrade() {
                    manager.released(&current, &self.resource());
                }
                return;
            }
        }
        self.finish_release();
    }

    /// Immediate grant: the caller already owns the lock, or nobody owns
    /// it and nobody is queued.
    fn attempt(&self) -> bool {
        let mut core = self.state.lock().expect("lock state poisoned");
        self.attempt_locked(&mut core)
    }

    fn attempt_locked(&self, core: &mut LockCore) -> bool {
        let current = std::thread::current();
        let owned_by_current = core.owner.as_ref().is_some_and(|o| o.id() == current.id());
        if owned_by_current || (core.owner.is_none() && core.queue.is_empty()) {
            core.depth += 1;
            self.set_owner(core, Some(current));
            return true;
        }
        false
    }

    /// Returns `None` if the lock was acquired outright. Otherwise
    /// returns the calling thread's queued semaphore: the existing one
    /// if it is still queued, or a freshly enqueued one.
    fn create_semaphore(&self) -> Option<Arc<Semaphore>> {
        let mut core = self.state.lock().expect("lock state poisoned");
        if self.attempt_locked(&mut core) {
            return None;
        }
        let semaphore = Arc::new(Semaphore::new(std::thread::current()));
        if let Some(existing) = core.queue.get(&semaphore) {
            return Some(existing);
        }
        core.queue.enqueue(Arc::clone(&semaphore));
        Some(semaphore)
    }

    /// Blocks on the semaphore until granted, timed out, or cancelled.
    fn do_acquire(
        &self,
        semaphore: &Arc<Semaphore>,
        token: &CancelToken,
        timeout: Duration,
    ) -> Result<bool, Cancelled> {
        let manager = self.manager.upgrade();
        let slice = manager
            .as_ref()
            .map_or(DEFAULT_WAIT_SLICE, |m| m.wait_slice());

        // Give the hook a chance to service pending work before this
        // thread goes to sleep.
        let owner = {
            self.state
                .lock()
                .expect("lock state poisoned")
                .owner
                .clone()
        };
        if manager
            .as_ref()
            .is_some_and(|m| m.about_to_wait(owner.as_ref()))
        {
            // The hook granted immediate access; the semaphore never
            // reaches the wait, so no wait edge is recorded.
            let mut core = self.state.lock().expect("lock state poisoned");
            core.queue.remove(semaphore);
            core.depth += 1;
            self.set_owner(&mut core, Some(std::thread::current()));
            return Ok(true);
        }

        // Re-assert the semaphore is queued: the hook's host work may
        // have removed it. This returns our existing semaphore when it
        // still sits in the queue.
        let Some(semaphore) = self.create_semaphore() else {
            return Ok(true);
        };

        let current = std::thread::current();
        if let Some(manager) = &manager {
            manager.wait_started(&current, &self.resource());
        }

        let granted = semaphore.acquire(token, timeout, slice);
        match granted {
            Ok(true) => {
                let mut core = self.state.lock().expect("lock state poisoned");
                self.grant_locked(&mut core);
                Ok(true)
            }
            Ok(false) | Err(Cancelled) => {
                let mut core = self.state.lock().expect("lock state poisoned");
                if semaphore.is_released() {
                    // The owner handed the lock over just as the wait
                    // gave up; taking the grant keeps the queue moving.
                    self.grant_locked(&mut core);
                    return Ok(true);
                }
                core.queue.remove(&semaphore);
                drop(core);
                if let Some(manager) = &manager {
                    manager.wait_stopped(&current, &self.resource());
                }
                granted
            }
        }
    }

    /// The lock has just been granted to this thread after a wait:
    /// remove the request from the queue and update graph and owner.
    fn grant_locked(&self, core: &mut LockCore) {
        core.depth += 1;
        core.queue.dequeue();
        self.set_owner(core, Some(std::thread::current()));
    }

    /// Full release: notify the hook, clear ownership, wake the head
    /// waiter. The hook runs outside both the lock and manager mutexes.
    /// The head is released under the lock mutex: a waiter abandoning
    /// its slot on timeout holds the same mutex while it re-checks for a
    /// raced handoff, so a grant can never land on a dequeued semaphore.
    fn finish_release(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.about_to_release();
        }
        let mut core = self.state.lock().expect("lock state poisoned");
        core.depth = 0;
        self.set_owner(&mut core, None);
        if let Some(next) = core.queue.peek() {
            next.release();
        }
    }

    /// Suspends the lock by granting it to the next queued waiter.
    /// Returns the depth at suspension, to be restored on resume.
    pub(crate) fn force_release(&self) -> u32 {
        let saved = self.depth();
        tracing::debug!(lock = %self, depth = saved, "forcing release");
        self.finish_release();
        saved
    }

    /// Forces the lock to the given depth. Used when reacquiring a
    /// suspended lock: the caller has just reacquired at depth 1, and
    /// the graph's hold multiplicity is bumped to match.
    pub(crate) fn set_depth(&self, new_depth: u32) {
        let mut core = self.state.lock().expect("lock state poisoned");
        if let Some(manager) = self.manager.upgrade() {
            if let Some(owner) = core.owner.clone() {
                let resource = self.resource();
                for _ in core.depth..new_depth {
                    manager.acquired(&owner, &resource);
                }
            }
        }
        core.depth = new_depth;
    }

    /// Records an ownership change and mirrors it into the wait graph:
    /// dropping an owner removes its whole hold, installing one adds a
    /// hold increment.
    fn set_owner(&self, core: &mut LockCore, new_owner: Option<Thread>) {
        if let Some(manager) = self.manager.upgrade() {
            let resource = self.resource();
            if new_owner.is_none() {
                if let Some(old) = &core.owner {
                    manager.released_completely(old, &resource);
                }
            }
            core.owner = new_owner;
            if let Some(owner) = &core.owner {
                manager.acquired(owner, &resource);
            }
        } else {
            core.owner = new_owner;
        }
    }

    /// This lock as a graph resource.
    fn resource(&self) -> Resource {
        Resource::Lock(self.me.upgrade().expect("lock self-handle vanished"))
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.state.lock().expect("lock state poisoned").queue.len()
    }

    #[cfg(test)]
    pub(crate) fn owner_id(&self) -> Option<std::thread::ThreadId> {
        self.state
            .lock()
            .expect("lock state poisoned")
            .owner
            .as_ref()
            .map(Thread::id)
    }
}

impl SchedulingRule for OrderedLock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    /// A lock covers exactly itself.
    fn contains(&self, other: &dyn SchedulingRule) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| std::ptr::eq(self, o))
    }

    fn conflicts_with(&self, other: &dyn SchedulingRule) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| std::ptr::eq(self, o))
    }
}

impl fmt::Debug for OrderedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderedLock({})", self.id)
    }
}

impl fmt::Display for OrderedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderedLock({})", self.id)
    }
}
