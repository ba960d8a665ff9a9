//! Ordered asynchronous listener fan-out.
//!
//! Every registered listener gets its own unbounded queue drained by a dedicated task, so
//! callbacks reach each listener in the order they were enqueued while the enqueuing side never
//! waits for a listener. A listener whose callback panics is cancelled.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// A callback applied to one listener
pub type Callback<L> = Arc<dyn Fn(Arc<L>) -> BoxFuture<'static, ()> + Send + Sync>;

struct ListenerQueue<L: ?Sized> {
    tx: mpsc::UnboundedSender<Callback<L>>,
    cancelled: Arc<AtomicBool>,
}

/// Fans callbacks out to listeners, preserving per-listener order
pub struct OrderedCallbackManager<L: ?Sized + Send + Sync + 'static> {
    name: &'static str,
    queues: DashMap<ListenerId, ListenerQueue<L>>,
    next_id: AtomicU64,
}

impl<L: ?Sized + Send + Sync + 'static> OrderedCallbackManager<L> {
    /// Create a manager; `name` is used in log output
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            queues: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener; `initial` is guaranteed to run before any later callback.
    ///
    /// Must be called within a tokio runtime.
    pub fn add_listener(&self, listener: Arc<L>, initial: Option<Callback<L>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<Callback<L>>();
        let cancelled = Arc::new(AtomicBool::new(false));

        if let Some(initial) = initial {
            // receiver is alive, cannot fail
            let _ = tx.send(initial);
        }

        let name = self.name;
        let worker_cancelled = cancelled.clone();
        tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                let listener = listener.clone();
                let outcome = AssertUnwindSafe(async move { callback(listener).await })
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    error!(
                        "Listener {:?} of {} panicked in a callback; cancelling it",
                        id, name
                    );
                    worker_cancelled.store(true, Ordering::Release);
                    break;
                }
            }
            debug!("Callback worker for listener {:?} of {} stopped", id, name);
        });

        self.queues.insert(id, ListenerQueue { tx, cancelled });
        id
    }

    /// Unregister a listener; already queued callbacks are still delivered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.queues.remove(&id).is_some()
    }

    /// Enqueue a callback for every active listener
    pub fn enqueue(&self, callback: Callback<L>) {
        let mut dead = Vec::new();
        for entry in self.queues.iter() {
            let queue = entry.value();
            if queue.cancelled.load(Ordering::Acquire) || queue.tx.send(callback.clone()).is_err()
            {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.queues.remove(&id);
        }
    }

    /// Number of active listeners
    pub fn listener_count(&self) -> usize {
        self.queues
            .iter()
            .filter(|q| !q.cancelled.load(Ordering::Acquire))
            .count()
    }
}

/// Build a [`Callback`] from a closure returning a future
pub fn callback<L, F, Fut>(f: F) -> Callback<L>
where
    L: ?Sized + Send + Sync + 'static,
    F: Fn(Arc<L>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |listener| f(listener).boxed())
}
