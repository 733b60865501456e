//! Event Bus
//!
//! In-process publish/subscribe dispatcher keyed by event type.
//!
//! # Delivery Guarantees
//! - handlers for a type run synchronously, in subscription order
//! - a failing (or panicking) handler is logged and skipped; later handlers
//!   still receive the event
//! - events are delivered in publish order; a publish made from inside a
//!   handler is queued behind the event currently fanning out
//! - unsubscribing from inside a handler affects the next publish only

use crate::engine::events::{Event, EventType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Event handler. Errors are contained at the handler boundary.
pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_errors: u64,
}

#[derive(Default)]
struct Registry {
    by_type: HashMap<EventType, Vec<(SubscriptionId, Handler)>>,
    all: Vec<(SubscriptionId, Handler)>,
}

struct BusInner {
    registry: Mutex<Registry>,
    queue: Mutex<VecDeque<Event>>,
    dispatching: AtomicBool,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    handler_errors: AtomicU64,
}

/// Cheaply clonable handle; clones share subscriptions.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry::default()),
                queue: Mutex::new(VecDeque::new()),
                dispatching: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                handler_errors: AtomicU64::new(0),
            }),
        }
    }

    /// Register a handler for one event type.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_subscription_id();
        self.inner
            .registry
            .lock()
            .by_type
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        tracing::debug!(event_type = %event_type, subscription = %id, "Subscribed handler");
        id
    }

    /// Register a handler for every event type. Runs after the typed handlers.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_subscription_id();
        self.inner.registry.lock().all.push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered for that type.
    pub fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) -> bool {
        let mut registry = self.inner.registry.lock();
        let Some(handlers) = registry.by_type.get_mut(&event_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        before != handlers.len()
    }

    /// Remove a handler registered with `subscribe_all`.
    pub fn unsubscribe_all(&self, id: SubscriptionId) -> bool {
        let mut registry = self.inner.registry.lock();
        let before = registry.all.len();
        registry.all.retain(|(sub, _)| *sub != id);
        before != registry.all.len()
    }

    /// Number of handlers registered for a type (excluding catch-all handlers).
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner
            .registry
            .lock()
            .by_type
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver an event to every handler registered for its type.
    ///
    /// When called from inside a handler, the event is queued and delivered
    /// once the current fan-out completes, before the outermost `publish`
    /// returns.
    pub fn publish(&self, event: Event) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.lock().push_back(event);

        if self.inner.dispatching.swap(true, Ordering::AcqRel) {
            return;
        }

        loop {
            let next = self.inner.queue.lock().pop_front();
            match next {
                Some(event) => self.dispatch(&event),
                None => {
                    self.inner.dispatching.store(false, Ordering::Release);
                    // Another thread may have queued after our last pop.
                    if self.inner.queue.lock().is_empty()
                        || self.inner.dispatching.swap(true, Ordering::AcqRel)
                    {
                        break;
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            handler_errors: self.inner.handler_errors.load(Ordering::Relaxed),
        }
    }

    fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn dispatch(&self, event: &Event) {
        let event_type = event.event_type();
        let handlers: Vec<(SubscriptionId, Handler)> = {
            let registry = self.inner.registry.lock();
            registry
                .by_type
                .get(&event_type)
                .into_iter()
                .flatten()
                .chain(registry.all.iter())
                .cloned()
                .collect()
        };

        for (id, handler) in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.inner.handler_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event_type = %event_type,
                        subscription = %id,
                        timestamp = event.timestamp,
                        order = ?event.client_order_id(),
                        error = %format!("{:#}", e),
                        "Event handler failed"
                    );
                }
                Err(_) => {
                    self.inner.handler_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        event_type = %event_type,
                        subscription = %id,
                        timestamp = event.timestamp,
                        "Event handler panicked"
                    );
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("stats", &self.stats()).finish()
    }
}
