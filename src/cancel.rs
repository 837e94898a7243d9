//! Cancellation tokens for blocking waits.
//!
//! A [`CancelToken`] is the host's handle for interrupting a timed
//! acquisition. Blocking operations poll the token while they wait:
//! timed acquires surface [`Cancelled`] to the caller, while untimed
//! acquires and suspended-lock resumption absorb it and keep waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Error returned when a blocking wait observes a cancelled token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock acquisition cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// A clonable cancellation flag shared between a waiter and its host.
///
/// Cancellation is level-triggered and sticky: once cancelled, every
/// subsequent [`checkpoint`](Self::checkpoint) fails until the token is
/// dropped. The default token is never cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a token that no holder will ever cancel.
    ///
    /// Used by the untimed acquisition loop and by suspended-lock
    /// resumption, both of which are required to absorb cancellation.
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    /// Requests cancellation of any wait polling this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        tracing::trace!("cancel requested");
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with [`Cancelled`] if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
