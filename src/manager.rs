//! The lock coordinator.
//!
//! A [`LockManager`] owns the only reference to the wait-for graph and
//! serializes every graph mutation on a single mutex. It also stores the
//! state of suspended locks so a deadlock victim can reacquire them at
//! the proper depth, and routes the optional [`LockHook`] callbacks.
//!
//! An internal failure in the graph is unrecoverable by design: freezing
//! every thread to re-infer the true lock state is not worth attempting.
//! The manager logs a diagnostic with a rendering of the graph and
//! discards the detector for good; locks keep functioning, deadlock
//! detection is forfeit.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{Thread, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use crate::detector::{Deadlock, DeadlockDetector, GraphError};
use crate::hook::LockHook;
use crate::lock::OrderedLock;
use crate::rule::Resource;

/// How long blocking waits sleep between cancellation checks.
pub(crate) const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(10);

/// Captures the state of one suspended lock so it can be reacquired at
/// the correct depth.
#[derive(Debug)]
struct LockState {
    lock: Arc<OrderedLock>,
    depth: u32,
}

impl LockState {
    /// Suspends ownership of the given lock and returns the saved state.
    fn suspend(lock: Arc<OrderedLock>) -> Self {
        let depth = lock.force_release();
        Self { lock, depth }
    }

    /// Reacquires the suspended lock and restores its depth. The wait is
    /// unbounded and absorbs cancellation; reacquisition may itself be
    /// suspended by a new deadlock, composing through the per-thread
    /// record stack.
    fn resume(&self) {
        self.lock.acquire();
        self.lock.set_depth(self.depth);
    }
}

/// The locks suspended by one deadlock resolution, in suspension order.
type SuspensionRecord = Vec<LockState>;

/// Shared coordinator state. Locks hold a weak reference to this.
pub(crate) struct ManagerCore {
    /// The wait-for graph; `None` once permanently disabled.
    graph: Mutex<Option<DeadlockDetector>>,
    /// Per-thread stacks of suspension records. A stack is needed
    /// because reacquiring suspended locks can deadlock again and
    /// suspend more of the thread's locks.
    suspended: Mutex<HashMap<ThreadId, Vec<SuspensionRecord>>>,
    hook: Mutex<Option<Arc<dyn LockHook>>>,
    /// Threads registered as members of the host's worker pool; always
    /// treated as lock owners by [`LockManager::is_lock_owner`].
    workers: Mutex<HashSet<ThreadId>>,
    next_lock_id: AtomicU64,
    wait_slice: Duration,
}

impl ManagerCore {
    pub(crate) fn wait_slice(&self) -> Duration {
        self.wait_slice
    }

    /// Runs a graph operation under the graph mutex. Both an operation
    /// error and a panic disable the detector permanently; neither
    /// surfaces to the caller.
    fn with_graph<T>(
        &self,
        op: impl FnOnce(&mut DeadlockDetector) -> Result<T, GraphError>,
    ) -> Option<T> {
        let mut slot = self.graph.lock();
        let Some(detector) = slot.as_mut() else {
            return None;
        };
        match catch_unwind(AssertUnwindSafe(|| op(detector))) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                Self::disable(&mut slot, &error.to_string());
                None
            }
            Err(_) => {
                Self::disable(&mut slot, "wait graph operation panicked");
                None
            }
        }
    }

    /// Discards the detector for good, logging the reason and the final
    /// graph state.
    fn disable(slot: &mut Option<DeadlockDetector>, reason: &str) {
        if let Some(detector) = slot.as_ref() {
            tracing::error!(
                reason,
                graph = %detector.to_debug_string(),
                "internal error: deadlock detection disabled permanently"
            );
        }
        *slot = None;
    }

    /// This thread has just acquired a resource. Update the graph.
    pub(crate) fn acquired(&self, thread: &Thread, resource: &Resource) {
        self.with_graph(|g| g.lock_acquired(thread, resource));
    }

    /// This thread has just been refused a resource. Update the graph
    /// and check for deadlock; resolve one if found.
    pub(crate) fn wait_started(&self, thread: &Thread, resource: &Resource) {
        let found = self
            .with_graph(|g| g.lock_wait_start(thread, resource))
            .flatten();
        if let Some(deadlock) = found {
            self.resolve(deadlock);
        }
    }

    /// This thread has stopped waiting for a resource. Update the graph.
    pub(crate) fn wait_stopped(&self, thread: &Thread, resource: &Resource) {
        self.with_graph(|g| g.lock_wait_stop(thread, resource));
    }

    /// This thread has released one level of a resource.
    pub(crate) fn released(&self, thread: &Thread, resource: &Resource) {
        self.with_graph(|g| g.lock_released(thread, resource));
    }

    /// This thread has released a resource entirely, regardless of how
    /// many times it acquired it.
    pub(crate) fn released_completely(&self, thread: &Thread, resource: &Resource) {
        self.with_graph(|g| g.lock_released_completely(thread, resource));
    }

    /// Suspends every lock the resolution names and stores the record
    /// for the victim. The victim is blocked in (or entering) its own
    /// wait, so the suspension takes effect immediately and the threads
    /// it was blocking make progress.
    fn resolve(&self, deadlock: Deadlock) {
        let Deadlock { candidate, locks } = deadlock;
        tracing::warn!(
            victim = ?candidate.id(),
            victim_name = candidate.name().unwrap_or("unnamed"),
            locks = locks.len(),
            "resolving deadlock by suspending the victim's locks"
        );
        let record: SuspensionRecord = locks.into_iter().map(LockState::suspend).collect();
        if record.is_empty() {
            return;
        }
        self.suspended
            .lock()
            .entry(candidate.id())
            .or_default()
            .push(record);
    }

    /// Resumes the most recently suspended set of locks belonging to
    /// this thread, if any.
    pub(crate) fn resume_suspended(&self, thread: ThreadId) {
        let record = {
            let mut suspended = self.suspended.lock();
            let Some(stack) = suspended.get_mut(&thread) else {
                return;
            };
            let record = stack.pop();
            if stack.is_empty() {
                suspended.remove(&thread);
            }
            record
        };
        let Some(record) = record else {
            return;
        };
        tracing::debug!(thread = ?thread, locks = record.len(), "resuming suspended locks");
        for state in &record {
            state.resume();
        }
    }

    /// Forwards to the hook. A panicking hook is logged and treated as
    /// having declined.
    pub(crate) fn about_to_wait(&self, owner: Option<&Thread>) -> bool {
        let hook = self.hook.lock().clone();
        let Some(hook) = hook else {
            return false;
        };
        catch_unwind(AssertUnwindSafe(|| hook.about_to_wait(owner))).unwrap_or_else(|_| {
            tracing::error!("lock hook panicked in about_to_wait");
            false
        })
    }

    /// Forwards to the hook. A panicking hook is logged and ignored.
    pub(crate) fn about_to_release(&self) {
        let hook = self.hook.lock().clone();
        let Some(hook) = hook else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| hook.about_to_release())).is_err() {
            tracing::error!("lock hook panicked in about_to_release");
        }
    }
}

/// Handle to the coordinator. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct LockManager {
    core: Arc<ManagerCore>,
}

impl LockManager {
    /// Creates a manager with default settings and no hook.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a manager.
    #[must_use]
    pub fn builder() -> LockManagerBuilder {
        LockManagerBuilder::default()
    }

    /// Creates and returns a new lock coordinated by this manager.
    #[must_use]
    pub fn new_lock(&self) -> Arc<OrderedLock> {
        let id = self.core.next_lock_id.fetch_add(1, Ordering::Relaxed);
        OrderedLock::new(id, Arc::downgrade(&self.core))
    }

    /// Installs or clears the hook.
    pub fn set_hook(&self, hook: Option<Arc<dyn LockHook>>) {
        *self.core.hook.lock() = hook;
    }

    /// Registers the current thread as a member of the host's worker
    /// pool. Worker threads are always treated as lock owners, so an
    /// external thread joining their work observes the correct answer
    /// from [`is_lock_owner`](Self::is_lock_owner).
    pub fn register_worker(&self) {
        self.core
            .workers
            .lock()
            .insert(std::thread::current().id());
    }

    /// Removes the current thread from the worker registry.
    pub fn deregister_worker(&self) {
        self.core
            .workers
            .lock()
            .remove(&std::thread::current().id());
    }

    /// Returns true when the current thread holds or waits for any lock
    /// or rule, or belongs to the registered worker pool.
    #[must_use]
    pub fn is_lock_owner(&self) -> bool {
        let current = std::thread::current().id();
        if self.core.workers.lock().contains(&current) {
            return true;
        }
        self.core
            .with_graph(|g| Ok(g.contains_thread(current)))
            .unwrap_or(false)
    }

    /// Returns true when the wait graph records no holds or waits.
    /// Diagnostic; also true once the detector has been disabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.with_graph(|g| Ok(g.is_empty())).unwrap_or(true)
    }

    /// Records that `thread` acquired `resource`. Host schedulers feed
    /// rule acquisitions through here; locks report themselves.
    pub fn acquired(&self, thread: &Thread, resource: &Resource) {
        self.core.acquired(thread, resource);
    }

    /// Records that `thread` started waiting for `resource`, running
    /// deadlock detection and resolution.
    pub fn wait_started(&self, thread: &Thread, resource: &Resource) {
        self.core.wait_started(thread, resource);
    }

    /// Records that `thread` stopped waiting for `resource`.
    pub fn wait_stopped(&self, thread: &Thread, resource: &Resource) {
        self.core.wait_stopped(thread, resource);
    }

    /// Records a single release of `resource` by `thread`.
    pub fn released(&self, thread: &Thread, resource: &Resource) {
        self.core.released(thread, resource);
    }

    /// Records that `thread` released `resource` entirely. Needs to be
    /// called only once however many times the resource was acquired.
    pub fn released_completely(&self, thread: &Thread, resource: &Resource) {
        self.core.released_completely(thread, resource);
    }

    /// Resumes the current thread's most recently suspended locks.
    /// Locks call this after every timed acquisition attempt; hosts may
    /// call it after rule waits.
    pub fn resume_suspended(&self) {
        self.core.resume_suspended(std::thread::current().id());
    }

    #[cfg(test)]
    pub(crate) fn detection_disabled(&self) -> bool {
        self.core.graph.lock().is_none()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`LockManager`].
#[derive(Default)]
pub struct LockManagerBuilder {
    hook: Option<Arc<dyn LockHook>>,
    wait_slice: Option<Duration>,
}

impl LockManagerBuilder {
    /// Installs a hook at construction.
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn LockHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Overrides the interval at which blocking waits poll for
    /// cancellation. Defaults to 10 ms.
    #[must_use]
    pub fn wait_slice(mut self, slice: Duration) -> Self {
        self.wait_slice = Some(slice);
        self
    }

    /// Builds the manager.
    #[must_use]
    pub fn build(self) -> LockManager {
        LockManager {
            core: Arc::new(ManagerCore {
                graph: Mutex::new(Some(DeadlockDetector::new())),
                suspended: Mutex::new(HashMap::new()),
                hook: Mutex::new(self.hook),
                workers: Mutex::new(HashSet::new()),
                next_lock_id: AtomicU64::new(0),
                wait_slice: self.wait_slice.unwrap_or(DEFAULT_WAIT_SLICE),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use crate::{assert_with_log, test_complete, test_phase};

    #[test]
    fn lock_ids_are_sequential_per_manager() {
        init_test_logging();
        let manager = LockManager::new();
        assert_eq!(manager.new_lock().id(), 0);
        assert_eq!(manager.new_lock().id(), 1);
        let other = LockManager::new();
        assert_eq!(other.new_lock().id(), 0);
    }

    #[test]
    fn internal_error_disables_detection_for_good() {
        init_test_logging();
        test_phase!("internal_error_disables_detection_for_good");
        let manager = LockManager::new();
        let lock = manager.new_lock();
        let resource = Resource::Lock(Arc::clone(&lock));
        let thread = std::thread::current();

        // Releasing a resource the graph never saw is an internal
        // inconsistency: detection shuts down rather than guess.
        manager.released(&thread, &resource);
        assert_with_log!(
            manager.detection_disabled(),
            "detector disabled",
            true,
            manager.detection_disabled()
        );

        // Disable is absorbing: graph operations become no-ops and the
        // lock itself keeps working.
        manager.acquired(&thread, &resource);
        assert_with_log!(
            manager.detection_disabled(),
            "still disabled",
            true,
            manager.detection_disabled()
        );
        lock.acquire();
        assert_with_log!(lock.depth() == 1, "lock functional", 1, lock.depth());
        assert_with_log!(
            !manager.is_lock_owner(),
            "ownership unknown once disabled",
            false,
            manager.is_lock_owner()
        );
        lock.release();
        test_complete!("internal_error_disables_detection_for_good");
    }

    #[test]
    fn panicking_hook_is_neutral() {
        init_test_logging();
        struct ExplodingHook;
        impl LockHook for ExplodingHook {
            fn about_to_wait(&self, _owner: Option<&Thread>) -> bool {
                panic!("hook failure");
            }
            fn about_to_release(&self) {
                panic!("hook failure");
            }
        }

        let manager = LockManager::builder().hook(Arc::new(ExplodingHook)).build();
        assert!(!manager.core.about_to_wait(None));
        manager.core.about_to_release();

        // The neutral return keeps the lock protocol intact.
        let lock = manager.new_lock();
        lock.acquire();
        lock.release();
        assert!(manager.is_empty());
    }

    #[test]
    fn worker_registration_drives_is_lock_owner() {
        init_test_logging();
        let manager = LockManager::new();
        assert!(!manager.is_lock_owner());
        manager.register_worker();
        assert!(manager.is_lock_owner());
        manager.deregister_worker();
        assert!(!manager.is_lock_owner());

        let lock = manager.new_lock();
        lock.acquire();
        assert!(manager.is_lock_owner());
        lock.release();
        assert!(!manager.is_lock_owner());
    }

    #[test]
    fn resume_without_suspensions_is_a_no_op() {
        init_test_logging();
        let manager = LockManager::new();
        manager.resume_suspended();
        assert!(manager.is_empty());
    }
}
