//! Priority-ordered disposal orchestrator.
//!
//! Per the design notes, each component registers its disposables with a
//! priority; teardown invokes them in ascending priority, aggregating
//! errors and never aborting the sequence. The extension controller uses
//! this to unwind its strict init order (credentials → config → key
//! service → session → transport → interruption engine → UI) by assigning
//! decreasing priorities as it initializes, so the last thing brought up
//! is the first thing torn down.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Anything the controller owns that must release resources on shutdown.
///
/// `dispose` must be idempotent: calling it twice has the same effect as
/// calling it once, since a failed teardown may be retried by the registry.
pub trait Disposable: Send + Sync {
    fn dispose<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

    /// Human-readable name used in disposal logs.
    fn name(&self) -> &str;
}

struct Entry {
    priority: i64,
    disposable: Arc<dyn Disposable>,
    disposed: AtomicBool,
}

/// Registry of disposables, disposed in ascending priority order.
#[derive(Default)]
pub struct DisposalRegistry {
    entries: parking_lot::Mutex<Vec<Entry>>,
    next_auto_priority: AtomicI64,
}

impl DisposalRegistry {
    pub fn new() -> Self {
        Self {
            entries: parking_lot::Mutex::new(Vec::new()),
            next_auto_priority: AtomicI64::new(0),
        }
    }

    /// Register with an explicit priority. Lower values are disposed first.
    pub fn register_with_priority(&self, priority: i64, disposable: Arc<dyn Disposable>) {
        self.entries.lock().push(Entry {
            priority,
            disposable,
            disposed: AtomicBool::new(false),
        });
    }

    /// Register with an automatically decreasing priority, so that the most
    /// recently registered resource is disposed first (LIFO), matching the
    /// controller's reverse-of-init-order teardown.
    pub fn register(&self, disposable: Arc<dyn Disposable>) {
        let priority = self.next_auto_priority.fetch_sub(1, Ordering::SeqCst);
        self.register_with_priority(priority, disposable);
    }

    /// Dispose every registered resource in ascending priority order.
    /// Errors are collected, never short-circuit the remaining disposals.
    pub async fn dispose_all(&self) -> Vec<(String, String)> {
        let mut snapshot: Vec<_> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .map(|e| (e.priority, e.disposable.clone()))
                .collect()
        };
        snapshot.sort_by_key(|(priority, _)| *priority);

        let mut errors = Vec::new();
        for (_, disposable) in snapshot {
            if let Some(err) = self.dispose_one(&disposable).await {
                errors.push((disposable.name().to_string(), err));
            }
        }
        errors
    }

    async fn dispose_one(&self, disposable: &Arc<dyn Disposable>) -> Option<String> {
        let already = {
            let entries = self.entries.lock();
            entries
                .iter()
                .find(|e| Arc::ptr_eq(&e.disposable, disposable))
                .map(|e| e.disposed.swap(true, Ordering::SeqCst))
                .unwrap_or(false)
        };

        if already {
            warn!(name = disposable.name(), "disposable already disposed, skipping");
            return None;
        }

        disposable.dispose().await.err()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// A disposable wrapping a plain async closure, for resources that don't
/// warrant their own type (e.g. a one-off background task handle).
pub struct ClosureDisposable<F> {
    label: String,
    f: parking_lot::Mutex<Option<F>>,
}

impl<F> ClosureDisposable<F>
where
    F: FnOnce() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f: parking_lot::Mutex::new(Some(f)),
        }
    }
}

impl<F> Disposable for ClosureDisposable<F>
where
    F: FnOnce() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync,
{
    fn dispose<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            let maybe_f = self.f.lock().take();
            match maybe_f {
                Some(f) => f().await,
                None => Ok(()),
            }
        })
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn disposes_in_reverse_registration_order_by_default() {
        let order = Arc::new(AsyncMutex::new(Vec::new()));
        let registry = DisposalRegistry::new();

        for id in 0..3 {
            let order = order.clone();
            registry.register(Arc::new(ClosureDisposable::new(
                format!("resource-{id}"),
                move || {
                    let order = order.clone();
                    Box::pin(async move {
                        order.lock().await.push(id);
                        Ok(())
                    })
                },
            )));
        }

        let errors = registry.dispose_all().await;
        assert!(errors.is_empty());
        assert_eq!(*order.lock().await, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn explicit_priority_overrides_registration_order() {
        let order = Arc::new(AsyncMutex::new(Vec::new()));
        let registry = DisposalRegistry::new();

        let order_a = order.clone();
        registry.register_with_priority(
            10,
            Arc::new(ClosureDisposable::new("late-but-low-priority", move || {
                let order = order_a.clone();
                Box::pin(async move {
                    order.lock().await.push("low");
                    Ok(())
                })
            })),
        );
        let order_b = order.clone();
        registry.register_with_priority(
            0,
            Arc::new(ClosureDisposable::new("early-but-high-priority", move || {
                let order = order_b.clone();
                Box::pin(async move {
                    order.lock().await.push("high");
                    Ok(())
                })
            })),
        );

        registry.dispose_all().await;
        assert_eq!(*order.lock().await, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_aggregates_errors() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let registry = DisposalRegistry::new();
        let calls_clone = calls.clone();
        registry.register(Arc::new(ClosureDisposable::new("failing", move || {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
        })));

        assert_eq!(registry.len(), 1);
        let errors = registry.dispose_all().await;
        assert_eq!(errors, vec![("failing".to_string(), "boom".to_string())]);

        let errors_second = registry.dispose_all().await;
        assert!(errors_second.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
