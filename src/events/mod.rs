//! The orchestrator's event bus: synchronous typed pub/sub over [`OrchEvent`].
//!
//! Unlike the teacher crate's `events` module — which appends mutation
//! records to `.janus/events.ndjson` for external audit — this bus is a
//! pure in-process dispatcher. It is constructed once at startup as an
//! `Arc<EventBus>` and threaded through every component via dependency
//! injection (SPEC_FULL §4.1, §9); there is no process-global singleton.

pub mod types;

pub use types::{LogLevel, OrchEvent};

use parking_lot::Mutex;

type Handler = Box<dyn Fn(&OrchEvent) + Send + Sync>;

struct Subscription {
    id: u64,
    tag: Option<&'static str>,
    handler: Handler,
}

/// Synchronous typed pub/sub bus.
///
/// `publish` delivers to tag-specific subscribers first, then to
/// subscribe-all listeners, both in registration order. A handler that
/// panics is caught so it can't prevent delivery to subscribers registered
/// after it; the panic is reported through `tracing::error!` rather than
/// re-entering the bus.
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscriptions: Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Register a handler for a single event tag (see [`OrchEvent::tag`]).
    pub fn subscribe<F>(&self, tag: &'static str, handler: F) -> u64
    where
        F: Fn(&OrchEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.subscriptions.lock().push(Subscription {
            id,
            tag: Some(tag),
            handler: Box::new(handler),
        });
        id
    }

    /// Register a handler invoked for every event, regardless of tag.
    pub fn subscribe_all<F>(&self, handler: F) -> u64
    where
        F: Fn(&OrchEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.subscriptions.lock().push(Subscription {
            id,
            tag: None,
            handler: Box::new(handler),
        });
        id
    }

    /// Remove a subscription by id. Idempotent: removing an id twice (or an
    /// id that never existed) is a no-op.
    pub fn unsubscribe(&self, id: u64) {
        self.subscriptions.lock().retain(|s| s.id != id);
    }

    /// Deliver `event` synchronously to every matching subscriber in
    /// registration order: tag-specific subscribers first, then
    /// subscribe-all listeners. Handlers must not block on anything other
    /// than acquiring their own locks — they should `tokio::spawn` their own
    /// async work and return promptly.
    pub fn publish(&self, event: OrchEvent) {
        // Snapshot the handler list before invoking: a handler that
        // subscribes or unsubscribes during delivery must not deadlock or
        // observe a half-mutated list.
        let tag = event.tag();
        let (tagged, untagged): (Vec<_>, Vec<_>) = {
            let subs = self.subscriptions.lock();
            subs.iter()
                .map(|s| (s.id, s.tag))
                .partition(|(_, t)| *t == Some(tag))
        };

        for (id, _) in tagged {
            self.invoke(id, &event);
        }
        for (id, _) in untagged {
            self.invoke(id, &event);
        }
    }

    fn invoke(&self, id: u64, event: &OrchEvent) {
        // Re-fetch under the lock each time rather than holding it across
        // the call, so a handler is free to subscribe/unsubscribe.
        let found = {
            let subs = self.subscriptions.lock();
            subs.iter()
                .find(|s| s.id == id)
                .map(|_| ())
        };
        if found.is_none() {
            return;
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let subs = self.subscriptions.lock();
            if let Some(sub) = subs.iter().find(|s| s.id == id) {
                (sub.handler)(event);
            }
        }));
        if result.is_err() {
            tracing::error!(subscriber_id = id, "event subscriber panicked; swallowed");
        }
    }

    /// Remove every subscription. Used only in teardown and tests — this is
    /// the rewrite's analogue of the teacher's `resetEventBus`, but scoped
    /// to an instance rather than a process-global.
    pub fn clear(&self) {
        self.subscriptions.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_in_registration_order_tag_then_all() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        bus.subscribe("tickets:ready", move |_| o1.lock().push("tagged"));
        let o2 = Arc::clone(&order);
        bus.subscribe_all(move |_| o2.lock().push("all"));

        bus.publish(OrchEvent::TicketsReady {
            timestamp: jiff::Timestamp::now(),
            ticket_ids: vec![],
        });

        assert_eq!(*order.lock(), vec!["tagged", "all"]);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(OrchEvent::info("one"));
        bus.unsubscribe(id);
        bus.unsubscribe(id); // no-op second call
        bus.publish(OrchEvent::info("two"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_block_later_subscribers() {
        let bus = EventBus::new();
        bus.subscribe_all(|_| panic!("boom"));
        let hit = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hit);
        bus.subscribe_all(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(OrchEvent::info("x"));
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_removes_all_subscriptions() {
        let bus = EventBus::new();
        bus.subscribe_all(|_| {});
        bus.subscribe("log:entry", |_| {});
        assert_eq!(bus.subscriber_count(), 2);
        bus.clear();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
