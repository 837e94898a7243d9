#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

pub use ordlock::test_utils::init_test_logging;

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default ceiling for scenario threads; anything slower is a hang.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawns a named thread, so hangs and panics identify themselves.
pub fn spawn_named<F, T>(name: &str, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("failed to spawn test thread")
}

/// Joins every handle, panicking if any of them is still running after
/// the timeout. A deadlock the coordinator failed to resolve shows up
/// here instead of wedging the test binary.
pub fn join_all_within<T>(handles: Vec<JoinHandle<T>>, timeout: Duration) -> Vec<T> {
    let deadline = Instant::now() + timeout;
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        while !handle.is_finished() {
            assert!(
                Instant::now() < deadline,
                "test threads still running after {timeout:?}; see the trace log"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
        results.push(handle.join().expect("test thread panicked"));
    }
    results
}

/// Polls a predicate until it holds or the deadline passes.
pub fn wait_until(what: &str, timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
