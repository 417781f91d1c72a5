//! # Event Broker
//!
//! Pub/sub over string topics with bounded per-subscriber delivery and
//! per-topic history. Publishing never blocks: a subscriber whose buffer
//! is full at publish time loses that event (with a warning), everyone
//! else is unaffected. History is recorded regardless of subscriber
//! state, so late subscribers replay the retained window first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::config::RetentionConfig;
use crate::constants::{DEFAULT_HISTORY, SUBSCRIBER_BUFFER};
use crate::event::{device_topic, gateway_topic, Event, ERRORS_TOPIC, SYSTEM_TOPIC};
use crate::util::ring::RingBuffer;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

struct Topic {
    history: RingBuffer<Event>,
    subscribers: Vec<Subscriber>,
}

struct BrokerInner {
    topics: Mutex<HashMap<String, Topic>>,
    retention: RetentionConfig,
    next_event_id: AtomicU64,
    next_subscriber_id: AtomicU64,
}

/// Fan-out hub for simulator events.
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

impl EventBroker {
    pub fn new(retention: RetentionConfig) -> Self {
        EventBroker {
            inner: Arc::new(BrokerInner {
                topics: Mutex::new(HashMap::new()),
                retention,
                next_event_id: AtomicU64::new(1),
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    fn history_capacity(&self, topic: &str) -> usize {
        if topic.starts_with("device:") {
            self.inner.retention.history_per_device
        } else if topic.starts_with("gateway:") {
            self.inner.retention.history_per_gateway
        } else {
            DEFAULT_HISTORY
        }
    }

    /// Subscribes to a topic.
    ///
    /// Returns the live stream (bounded buffer), the topic's historical
    /// snapshot in insertion order, and an idempotent cancel handle. The
    /// snapshot and the subscription are taken atomically: no event is
    /// ever missing from both, or present in both.
    pub fn subscribe(
        &self,
        topic: &str,
    ) -> (mpsc::Receiver<Event>, Vec<Event>, SubscriptionHandle) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.inner.topics.lock().expect("broker lock poisoned");
        let capacity = self.history_capacity(topic);
        let entry = topics.entry(topic.to_string()).or_insert_with(|| Topic {
            history: RingBuffer::new(capacity),
            subscribers: Vec::new(),
        });
        let snapshot = entry.history.snapshot();
        entry.subscribers.push(Subscriber { id, tx });

        let handle = SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            topic: topic.to_string(),
            id,
            cancelled: AtomicBool::new(false),
        };
        (rx, snapshot, handle)
    }

    /// Publishes to a device topic.
    pub fn publish_device(&self, dev_eui: u64, event: Event) {
        self.publish_to(&device_topic(dev_eui), event);
    }

    /// Publishes to a gateway topic.
    pub fn publish_gateway(&self, mac: u64, event: Event) {
        self.publish_to(&gateway_topic(mac), event);
    }

    /// Publishes a simulator-wide event.
    pub fn publish_system(&self, event: Event) {
        self.publish_to(SYSTEM_TOPIC, event);
    }

    fn publish_to(&self, topic: &str, mut event: Event) {
        if event.id.is_empty() {
            let n = self.inner.next_event_id.fetch_add(1, Ordering::Relaxed);
            event.id = format!("{n:012}");
        }

        let mirror_error = event.kind.is_error() && topic != ERRORS_TOPIC;

        let mut topics = self.inner.topics.lock().expect("broker lock poisoned");
        self.deliver(&mut topics, topic, event.clone());
        if mirror_error {
            self.deliver(&mut topics, ERRORS_TOPIC, event);
        }
    }

    /// Appends to history and fans out to live subscribers. Must run
    /// under the topics lock so that subscribe/publish are linearized.
    fn deliver(&self, topics: &mut HashMap<String, Topic>, topic: &str, event: Event) {
        let capacity = self.history_capacity(topic);
        let entry = topics.entry(topic.to_string()).or_insert_with(|| Topic {
            history: RingBuffer::new(capacity),
            subscribers: Vec::new(),
        });
        entry.history.push(event.clone());
        entry.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("subscriber {} lagging on topic {topic}, event dropped", sub.id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Drops a device topic's history and closes its live subscriptions.
    pub fn remove_device(&self, dev_eui: u64) {
        self.remove_topic(&device_topic(dev_eui));
    }

    /// Drops a gateway topic's history and closes its live subscriptions.
    pub fn remove_gateway(&self, mac: u64) {
        self.remove_topic(&gateway_topic(mac));
    }

    fn remove_topic(&self, topic: &str) {
        let removed = {
            let mut topics = self.inner.topics.lock().expect("broker lock poisoned");
            topics.remove(topic)
        };
        if removed.is_some() {
            debug!("removed topic {topic}");
        }
        // Dropping the Topic drops every sender, closing the receivers.
    }
}

/// Unsubscribe handle. Idempotent and callable from any task.
pub struct SubscriptionHandle {
    inner: Weak<BrokerInner>,
    topic: String,
    id: u64,
    cancelled: AtomicBool,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut topics = inner.topics.lock().expect("broker lock poisoned");
        if let Some(topic) = topics.get_mut(&self.topic) {
            topic.subscribers.retain(|sub| sub.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn broker() -> EventBroker {
        EventBroker::new(RetentionConfig::default())
    }

    #[tokio::test]
    async fn history_then_live_in_order() {
        let broker = broker();
        for i in 0..3 {
            broker.publish_device(1, Event::device(1, EventKind::Uplink, format!("u{i}")));
        }
        let (mut rx, history, _handle) = broker.subscribe(&device_topic(1));
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "u0");
        broker.publish_device(1, Event::device(1, EventKind::Uplink, "live"));
        assert_eq!(rx.recv().await.unwrap().message, "live");
    }

    #[tokio::test]
    async fn errors_are_mirrored() {
        let broker = broker();
        let (mut errors_rx, _, _handle) = broker.subscribe(ERRORS_TOPIC);
        broker.publish_device(2, Event::device(2, EventKind::Error, "boom"));
        assert_eq!(errors_rx.recv().await.unwrap().message, "boom");
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let broker = broker();
        let (mut rx, _, handle) = broker.subscribe(SYSTEM_TOPIC);
        handle.cancel();
        handle.cancel();
        broker.publish_system(Event::system(EventKind::Started, "up"));
        assert!(rx.recv().await.is_none());
    }
}
