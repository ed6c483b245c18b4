//! Topic-indexed fan-out of textual events.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Returned by [`EventBus::subscribe`]; pass to [`EventBus::unsubscribe`]
/// to remove the callback. Cloneable so a callback can retain its own
/// token and unsubscribe itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionToken {
    topic: String,
    id: u64,
}

struct Subscriber {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<String, Vec<Subscriber>>,
}

/// Per-pipeline publish/subscribe bus.
///
/// `publish` snapshots the current subscribers for the topic under a short
/// lock and invokes them on the publisher's thread with the lock released,
/// so callbacks may freely subscribe, unsubscribe or publish without
/// deadlocking. A panicking subscriber is caught and logged; the remaining
/// subscribers still run.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `topic`.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> SubscriptionToken
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        SubscriptionToken {
            topic: topic.to_string(),
            id,
        }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let mut registry = self.registry.lock();
        let Some(subscribers) = registry.topics.get_mut(&token.topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != token.id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            registry.topics.remove(&token.topic);
        }
        removed
    }

    /// Synchronously deliver `message` to every subscriber of `topic` as of
    /// the moment the snapshot is taken. Subscriptions made from inside a
    /// callback are visible only to the next publish.
    pub fn publish(&self, topic: &str, message: &str) {
        let snapshot: Vec<Callback> = {
            let registry = self.registry.lock();
            match registry.topics.get(topic) {
                Some(subscribers) => subscribers.iter().map(|s| Arc::clone(&s.callback)).collect(),
                None => return,
            }
        };

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                tracing::error!("event subscriber on '{}' panicked; isolating", topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(count: Arc<AtomicUsize>) -> impl Fn(&str) + Send + Sync {
        move |_msg| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_topic_routing() {
        let bus = EventBus::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        bus.subscribe("plugin_event", counting(Arc::clone(&a)));
        bus.subscribe("other", counting(Arc::clone(&b)));

        bus.publish("plugin_event", "{\"event\":\"StreamConnected\"}");
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_publish_to_empty_topic_is_noop() {
        let bus = EventBus::new();
        bus.publish("nobody-home", "{}");
    }

    #[test]
    fn test_publish_order_within_topic() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe("t", move |msg| seen.lock().push(msg.to_string()));
        }
        bus.publish("t", "first");
        bus.publish("t", "second");
        bus.publish("t", "third");
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let token = bus.subscribe("t", counting(Arc::clone(&count)));
        bus.publish("t", "one");
        assert!(bus.unsubscribe(&token));
        assert!(!bus.unsubscribe(&token));
        bus.publish("t", "two");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_from_callback_visible_next_publish() {
        let bus = Arc::new(EventBus::new());
        let late_count = Arc::new(AtomicUsize::new(0));
        {
            let bus = Arc::clone(&bus);
            let late_count = Arc::clone(&late_count);
            bus.clone().subscribe("t", move |_msg| {
                bus.subscribe("t", counting(Arc::clone(&late_count)));
            });
        }
        bus.publish("t", "during");
        // The callback registered a new subscriber, which must not have
        // seen the in-flight message.
        assert_eq!(late_count.load(Ordering::SeqCst), 0);
        bus.publish("t", "after");
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_self_unsubscribe_during_callback() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let later_count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<SubscriptionToken>>> = Arc::new(Mutex::new(None));

        let token = {
            let bus = Arc::clone(&bus);
            let count = Arc::clone(&count);
            let slot = Arc::clone(&slot);
            bus.clone().subscribe("t", move |_msg| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(token) = slot.lock().as_ref() {
                    bus.unsubscribe(token);
                }
            })
        };
        *slot.lock() = Some(token);
        bus.subscribe("t", counting(Arc::clone(&later_count)));

        bus.publish("t", "m1");
        // The self-removing subscriber ran once and did not block the later
        // subscriber from running.
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(later_count.load(Ordering::SeqCst), 1);

        bus.publish("t", "m2");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(later_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("t", |_msg| panic!("subscriber bug"));
        bus.subscribe("t", counting(Arc::clone(&count)));

        bus.publish("t", "m");
        bus.publish("t", "m");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
