//! Typed publish/subscribe fabric.
//!
//! Every subscription owns a bounded queue drained by its own task:
//!
//! ```text
//! publish(event)
//!     ├──► [queue 1] ──► worker 1 ──► handler1.handle()
//!     └──► [queue N] ──► worker N ──► handlerN.handle()
//! ```
//!
//! - `publish()` never blocks; a full queue drops the event for that
//!   subscription only.
//! - A subscription sees events in publish order; distinct subscriptions are
//!   unordered relative to each other.
//! - A panicking handler is logged and its worker moves on to the next event.
//! - No persistence, no retry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::events::event::{Event, EventType};

/// Default per-subscription queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Receives events of the types it was subscribed to
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);

    /// Name used in logs
    fn name(&self) -> &str {
        "handler"
    }
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, event: &Event) {
        (self.f)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Subscription {
    name: String,
    sender: mpsc::Sender<Arc<Event>>,
}

/// In-process event bus
pub struct EventBus {
    subscriptions: RwLock<HashMap<EventType, Vec<Subscription>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus whose subscriptions buffer up to `capacity` events (min 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register `handler` for `event_type`.
    ///
    /// Spawns the subscription's worker, so it must be called from within a
    /// tokio runtime.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        let (tx, mut rx) = mpsc::channel::<Arc<Event>>(self.capacity);
        let name = handler.name().to_string();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let fut = handler.handle(event.as_ref());
                if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    error!(
                        handler = handler.name(),
                        event_type = %event.event_type,
                        "Event handler panicked"
                    );
                }
            }
            debug!(handler = handler.name(), "Event subscription closed");
        });

        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscriptions
            .entry(event_type)
            .or_default()
            .push(Subscription { name, sender: tx });
    }

    /// Register an async closure for `event_type`
    pub fn subscribe_fn<F, Fut>(&self, event_type: EventType, name: &str, f: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(
            event_type,
            Arc::new(FnHandler {
                name: name.to_string(),
                f,
            }),
        );
    }

    /// Queue `event` for every subscription of its type without waiting
    pub fn publish(&self, event: Event) {
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(subs) = subscriptions.get(&event.event_type) else {
            return;
        };

        let event = Arc::new(event);
        for sub in subs {
            match sub.sender.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        handler = %sub.name,
                        event_type = %event.event_type,
                        app_id = %event.app_id,
                        "Event queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(handler = %sub.name, "Event queue closed");
                }
            }
        }
    }

    /// Number of subscriptions registered for `event_type`
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Remove every subscription; their workers exit once their queues drain
    pub fn clear(&self) {
        self.subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}
