//! Shared cancellation handle threaded through the query loop, the tool
//! executor, and the provider client.
//!
//! One handle is created per REPL turn. Signalling it aborts the in-flight
//! LLM stream read, asks running tools to stop yielding, and makes the
//! executor synthesize error results for anything still queued. The handle
//! is an explicit value passed through `ToolContext` rather than ambient
//! state, so independent sessions in one process never interfere.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Cooperative cancellation handle.
///
/// Cheap to clone; all clones observe the same flag. Tools poll
/// [`is_cancelled`](CancelHandle::is_cancelled) at natural suspension
/// points, while async code that needs to race against cancellation awaits
/// [`cancelled`](CancelHandle::cancelled).
///
/// # Examples
///
/// ```
/// use panpan::CancelHandle;
///
/// let cancel = CancelHandle::new();
/// assert!(!cancel.is_cancelled());
///
/// cancel.cancel();
/// assert!(cancel.is_cancelled());
///
/// // Idempotent
/// cancel.cancel();
/// assert!(cancel.is_cancelled());
/// ```
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    /// Create a fresh, un-signalled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Safe to call multiple times.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is signalled. Resolves immediately if the
    /// handle was already cancelled.
    pub async fn cancelled(&self) {
        // Register interest before re-checking the flag so a concurrent
        // cancel() between the check and the await cannot be missed.
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
