//! Publish/subscribe capabilities and the in-process bus.

use crate::event::Event;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream of delivered events.
pub type EventStream = mpsc::UnboundedReceiver<Event>;

/// Publishing side of the bus. Must tolerate concurrent callers.
pub trait Publisher: Send + Sync {
    /// Publishes an event. Delivery is best-effort.
    fn emit(&self, event: Event);
}

/// Subscribing side of the bus.
pub trait Subscriber: Send + Sync {
    /// Subscribes to the given topics (empty = every topic).
    ///
    /// Retained last-known values for matching topics are delivered first,
    /// with their `retained` flag set.
    fn subscribe(&self, topics: &[&str]) -> EventStream;

    /// Subscribes to every topic.
    fn subscribe_all(&self) -> EventStream {
        self.subscribe(&[])
    }
}

struct Subscription {
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<Event>,
}

impl Subscription {
    fn wants(&self, topic: &str) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|t| t == topic)
    }
}

#[derive(Default)]
struct Inner {
    subscriptions: Vec<Subscription>,
    /// Last retained event per (topic, entity).
    retained: BTreeMap<(String, String), Event>,
}

/// In-process bus with retained last-value semantics.
///
/// Live deliveries always arrive with `retained == false`; only the replay
/// a new subscriber receives is flagged as retained.
#[derive(Default)]
pub struct LocalBus {
    inner: Mutex<Inner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared bus.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Returns the retained value for a topic/entity pair.
    pub fn retained(&self, topic: &str, entity: &str) -> Option<Event> {
        self.inner
            .lock()
            .retained
            .get(&(topic.to_string(), entity.to_string()))
            .cloned()
    }
}

impl Publisher for LocalBus {
    fn emit(&self, event: Event) {
        let mut inner = self.inner.lock();
        tracing::trace!(topic = %event.topic, entity = %event.entity, "emit");

        let mut live = event;
        if live.retained {
            inner
                .retained
                .insert((live.topic.clone(), live.entity.clone()), live.clone());
            live.retained = false;
        }

        // Drop subscriptions whose receiver has gone away.
        inner.subscriptions.retain(|sub| {
            if !sub.wants(&live.topic) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(live.clone()).is_ok()
        });
    }
}

impl Subscriber for LocalBus {
    fn subscribe(&self, topics: &[&str]) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Subscription {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            tx,
        };

        let mut inner = self.inner.lock();
        for event in inner.retained.values() {
            if subscription.wants(&event.topic) {
                let _ = subscription.tx.send(event.clone().with_retained(true));
            }
        }
        inner.subscriptions.push(subscription);

        rx
    }
}
