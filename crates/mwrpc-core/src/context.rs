//! Cancellation and deadline context for calls.
//!
//! A [`Context`] travels with every `call`/`call_job`. It can be cancelled
//! explicitly from any clone, and optionally carries a deadline. Waiting on
//! [`Context::done`] tells the caller which of the two fired, so "deadline
//! exceeded" and "cancelled" surface as different errors.
//!
//! # Example
//!
//! ```
//! use mwrpc::Context;
//! use std::time::Duration;
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(5));
//! let ctx_clone = ctx.clone();
//!
//! // Cancel from another task
//! ctx_clone.cancel();
//! assert!(ctx.is_cancelled());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancellation signal plus optional deadline.
///
/// Clones and children derived with [`Context::with_timeout`] share the same
/// cancellation state: cancelling any of them cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct Context {
    state: Arc<CancelState>,
    deadline: Option<Instant>,
}

/// Why a context finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl Context {
    /// A context that is never done unless cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context whose deadline is `timeout` from now, or the parent's
    /// deadline if that is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with the given deadline, keeping the parent's if it is
    /// earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            state: Arc::clone(&self.state),
            deadline: Some(deadline),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// The deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Return the reason this context is finished, or `Ok` if it is still live.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Wait until the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.cancelled() => ContextError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag so a concurrent cancel()
            // cannot slip between the check and the wait.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
