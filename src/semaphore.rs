//! Binary handoff semaphore for queued lock waiters.
//!
//! Each thread that fails an immediate lock grant parks on its own
//! [`Semaphore`]. The releasing thread hands the lock over by releasing
//! the queue head. The grant flag is sticky so that a release racing a
//! timeout is never lost: the waiter re-checks [`Semaphore::is_released`]
//! before abandoning its slot.

use std::sync::{Condvar, Mutex};
use std::thread::{Thread, ThreadId};
use std::time::{Duration, Instant};

use crate::cancel::{CancelToken, Cancelled};

/// A one-shot handoff owned by exactly one waiting thread.
#[derive(Debug)]
pub(crate) struct Semaphore {
    /// The thread this semaphore parks. Queue identity is keyed on it.
    waiter: Thread,
    granted: Mutex<bool>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore owned by the given waiter thread.
    pub(crate) fn new(waiter: Thread) -> Self {
        Self {
            waiter,
            granted: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Returns the owning waiter thread.
    pub(crate) fn waiter(&self) -> &Thread {
        &self.waiter
    }

    /// Returns the owning waiter's id.
    pub(crate) fn waiter_id(&self) -> ThreadId {
        self.waiter.id()
    }

    /// Blocks until released or until `timeout` elapses.
    ///
    /// Returns `Ok(true)` when released, `Ok(false)` on timeout, and
    /// `Err(Cancelled)` when the token is cancelled mid-wait. The wait
    /// re-checks the grant flag on every wakeup, so spurious wakeups and
    /// repeated releases are harmless. The condition variable is waited
    /// in `slice`-sized intervals so cancellation is observed promptly.
    pub(crate) fn acquire(
        &self,
        token: &CancelToken,
        timeout: Duration,
        slice: Duration,
    ) -> Result<bool, Cancelled> {
        let deadline = Instant::now().checked_add(timeout);
        let mut granted = self.granted.lock().expect("semaphore lock poisoned");
        loop {
            if *granted {
                return Ok(true);
            }
            token.checkpoint()?;

            let mut wait = slice;
            if let Some(deadline) = deadline {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Ok(false);
                };
                wait = wait.min(remaining);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(granted, wait)
                .expect("semaphore lock poisoned");
            granted = guard;
        }
    }

    /// Releases the waiter. Idempotent.
    pub(crate) fn release(&self) {
        let mut granted = self.granted.lock().expect("semaphore lock poisoned");
        *granted = true;
        self.cond.notify_all();
        tracing::trace!(waiter = ?self.waiter.id(), "semaphore released");
    }

    /// Returns true once [`release`](Self::release) has been called.
    pub(crate) fn is_released(&self) -> bool {
        *self.granted.lock().expect("semaphore lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::Arc;

    const SLICE: Duration = Duration::from_millis(10);

    #[test]
    fn release_before_acquire_grants_immediately() {
        init_test_logging();
        let sem = Semaphore::new(std::thread::current());
        sem.release();
        let granted = sem
            .acquire(&CancelToken::never(), Duration::from_secs(5), SLICE)
            .expect("not cancelled");
        assert!(granted);
        assert!(sem.is_released());
    }

    #[test]
    fn acquire_times_out_without_release() {
        init_test_logging();
        let sem = Semaphore::new(std::thread::current());
        let granted = sem
            .acquire(&CancelToken::never(), Duration::from_millis(30), SLICE)
            .expect("not cancelled");
        assert!(!granted);
        assert!(!sem.is_released());
    }

    #[test]
    fn acquire_observes_cross_thread_release() {
        init_test_logging();
        let sem = Arc::new(Semaphore::new(std::thread::current()));
        let releaser = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                sem.release();
            })
        };
        let granted = sem
            .acquire(&CancelToken::never(), Duration::from_secs(5), SLICE)
            .expect("not cancelled");
        assert!(granted);
        releaser.join().expect("releaser panicked");
    }

    #[test]
    fn cancellation_surfaces_mid_wait() {
        init_test_logging();
        let token = CancelToken::new();
        let sem = Semaphore::new(std::thread::current());
        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                token.cancel();
            })
        };
        let result = sem.acquire(&token, Duration::from_secs(5), SLICE);
        assert_eq!(result, Err(Cancelled));
        canceller.join().expect("canceller panicked");
    }

    #[test]
    fn release_is_idempotent() {
        init_test_logging();
        let sem = Semaphore::new(std::thread::current());
        sem.release();
        sem.release();
        assert!(sem.is_released());
    }
}
