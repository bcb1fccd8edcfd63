//! Event Bus
//!
//! A registry mapping event kinds to subscriber closures. Handlers are type-erased
//! `Arc<dyn Fn>` so different callers can subscribe to the same kind, and publishing
//! takes a snapshot of the subscriber list before invoking it so a handler may itself
//! subscribe or publish without deadlocking.

use super::types::{EventKind, GridEvent};

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Type alias for a thread-safe event handler.
pub type EventHandlerFn = Arc<dyn Fn(&GridEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventBus {
    handlers: DashMap<EventKind, Vec<(SubscriptionId, EventHandlerFn)>>,
    published: DashMap<EventKind, u64>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` for every future event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&GridEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        tracing::debug!("Subscribed {:?} to {:?}", id, kind);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        for mut entry in self.handlers.iter_mut() {
            let subscribers = entry.value_mut();
            let before = subscribers.len();
            subscribers.retain(|(sub_id, _)| *sub_id != id);
            if subscribers.len() != before {
                return true;
            }
        }
        false
    }

    /// Delivers `event` synchronously to every subscriber of its kind.
    pub fn publish(&self, event: GridEvent) {
        let kind = event.kind();
        *self.published.entry(kind).or_insert(0) += 1;

        let handlers: Vec<EventHandlerFn> = self
            .handlers
            .get(&kind)
            .map(|entry| entry.value().iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        tracing::debug!(
            "Publishing {:?} to {} subscriber(s)",
            kind,
            handlers.len()
        );

        for handler in handlers {
            handler(&event);
        }
    }

    pub fn published_count(&self, kind: EventKind) -> u64 {
        self.published.get(&kind).map(|count| *count).unwrap_or(0)
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers
            .get(&kind)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
            published: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}
