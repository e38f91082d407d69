//! Cooperative cancellation token.
//!
//! Threaded into every collaborator call so that work abandoned by a stage
//! timeout (or by the caller) actually stops. Cancelling a token cancels
//! every child derived from it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();

        let children = {
            let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Cloneable handle; clones share the same cancellation state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a new token (not cancelled).
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token that is cancelled together with `self`, but can also be
    /// cancelled on its own without affecting the parent.
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut guard = self.inner.children.lock().unwrap_or_else(|e| e.into_inner());
            guard.retain(|w| w.strong_count() > 0);
            guard.push(Arc::downgrade(&child.inner));
        }
        // Parent may have been cancelled before registration completed.
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Deadline and cancellation handed to every collaborator call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }
}
