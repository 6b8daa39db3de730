//! Cancellation primitive (spec §4.1).
//!
//! A `CancelToken` is level-triggered: once cancelled it stays cancelled,
//! and any number of readers can poll `is_cancelled()` at their own pace
//! from whatever "safe point" they run at (provider reads, tool
//! dispatch, per-iteration checks). Callbacks registered via `on_cancel`
//! fire exactly once, in registration order, the first time cancellation
//! is observed — either at the moment `cancel()` is called if callbacks
//! are already registered, or immediately upon registration if the
//! token is already cancelled.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

type Callback = Box<dyn FnOnce() + Send>;

struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

/// A cancellation handle shared between whoever can request cancellation
/// (the dispatcher's `cancel` RPC) and whoever must observe it (the
/// turn engine, the provider client, tool execution, MCP transports).
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Signal cancellation. Idempotent: calling this more than once only
    /// fires registered callbacks on the first call.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fire_callbacks();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Register a callback to run once, the first time cancellation is
    /// observed. If the token is already cancelled, the callback runs
    /// immediately (on the calling thread) instead of being queued.
    /// A callback that panics has its panic swallowed — one observer's
    /// bug must not take down the cancelling caller or other observers.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            Self::run_guarded(Box::new(callback));
            return;
        }
        let mut callbacks = self.inner.callbacks.lock();
        // Re-check under the lock: cancel() may have run between the
        // is_cancelled() check above and acquiring the lock.
        if self.is_cancelled() {
            drop(callbacks);
            Self::run_guarded(Box::new(callback));
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    fn fire_callbacks(&self) {
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for cb in callbacks {
            Self::run_guarded(cb);
        }
    }

    fn run_guarded(cb: Callback) {
        let _ = catch_unwind(AssertUnwindSafe(cb));
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request handle tracked by a dispatcher: the token plus bookkeeping
/// needed to report it back over `get_tokens`/`status` and to compute
/// dispatch-level timeouts.
#[derive(Clone)]
pub struct RequestToken {
    pub request_id: String,
    pub cancellation: CancelToken,
    pub started_at: Instant,
}

impl RequestToken {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            cancellation: CancelToken::new(),
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_is_idempotent_and_observable() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn on_cancel_fires_once_on_later_cancel() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_cancel_fires_immediately_if_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multiple_callbacks_run_in_registration_order() {
        let token = CancelToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            token.on_cancel(move || order.lock().push(i));
        }
        token.cancel();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let token = CancelToken::new();
        let ran = Arc::new(AtomicUsize::new(0));
        token.on_cancel(|| panic!("boom"));
        let r = ran.clone();
        token.on_cancel(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clone_shares_cancellation_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn request_token_tracks_elapsed_time() {
        let rt = RequestToken::new("req-1");
        assert_eq!(rt.request_id, "req-1");
        assert!(!rt.cancellation.is_cancelled());
        assert!(rt.elapsed().as_nanos() < 1_000_000_000);
    }
}
