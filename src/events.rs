//! Shared event-emitter plumbing used by every core component.
//!
//! Each component (session manager, transport, conversation state machine...)
//! exposes `on_*` subscription methods following the teacher's
//! `Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>`
//! callback pattern from `core::realtime::base`. [`Emitter`] centralizes the
//! bookkeeping: registration, disposal, and tolerant dispatch.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

pub type AsyncHandler<T> = Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Handle<T> {
    id: u64,
    handler: AsyncHandler<T>,
}

/// A disposable subscription handle. Dropping it does nothing; call
/// [`Subscription::dispose`] (or let the owning emitter be dropped) to
/// actually remove the handler.
pub struct Subscription<T> {
    id: u64,
    emitter: Arc<RwLock<Vec<Handle<T>>>>,
}

impl<T> Subscription<T> {
    pub fn dispose(&self) {
        self.emitter.write().retain(|h| h.id != self.id);
    }
}

/// Multi-subscriber async event emitter.
///
/// Handlers are invoked sequentially against a snapshot of the subscriber
/// list taken at dispatch time, so a handler disposing itself (or another
/// handler) mid-dispatch never panics or skips entries unpredictably.
/// Handler errors can't propagate (the callback signature returns `()`);
/// if a component needs to surface a failure it must do so through its own
/// error emitter, matching the teacher's `on_error` convention.
pub struct Emitter<T> {
    handlers: Arc<RwLock<Vec<Handle<T>>>>,
    next_id: AtomicU64,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: AsyncHandler<T>) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.write().push(Handle { id, handler });
        Subscription {
            id,
            emitter: self.handlers.clone(),
        }
    }

    /// Number of currently-registered handlers. Exposed for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Dispatch `value` to every handler registered at the moment of the
    /// call. Handlers are awaited sequentially, matching the teacher's
    /// ordered-delivery guarantee for transcript and state-change events.
    pub async fn emit(&self, value: T) {
        let snapshot: Vec<_> = self.handlers.read().iter().map(|h| h.handler.clone()).collect();
        for handler in snapshot {
            handler(value.clone()).await;
        }
    }
}

/// Logs a handler panic-equivalent (a `Result::Err` surfaced from a fallible
/// bridging adapter) without propagating it, per the "errors are logged,
/// never propagated" dispatch rule.
pub fn log_handler_error(component: &str, err: impl std::fmt::Display) {
    error!(component, %err, "event handler failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn dispatches_to_all_subscribers() {
        let emitter: Emitter<u32> = Emitter::new();
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = total.clone();
            emitter.subscribe(Arc::new(move |v: u32| {
                let total = total.clone();
                Box::pin(async move {
                    total.fetch_add(v as usize, Ordering::SeqCst);
                })
            }));
        }

        emitter.emit(5).await;
        assert_eq!(total.load(Ordering::SeqCst), 15);
    }

    #[tokio::test]
    async fn disposed_subscriber_stops_receiving() {
        let emitter: Emitter<u32> = Emitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let sub = emitter.subscribe(Arc::new(move |_: u32| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        }));

        emitter.emit(1).await;
        sub.dispose();
        emitter.emit(1).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.subscriber_count(), 0);
    }
}
