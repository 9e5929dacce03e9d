//! In-process broker.
//!
//! A [`MemoryBus`] is the shared "server"; every [`MemoryBroker`] created
//! from it is one client. Delivery is synchronous fan-out in subscribe
//! order, including back to the publisher — the same echo behavior a real
//! pub/sub broker has.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::{Broker, BrokerError, BrokerEvent};

/// Per-client event capacity; laggards skip, they are not waited for.
const EVENT_CAPACITY: usize = 512;

struct Subscriber {
    client_id: u64,
    tx: broadcast::Sender<BrokerEvent>,
}

/// The shared in-process "broker server".
#[derive(Default)]
pub struct MemoryBus {
    subscriptions: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_client: AtomicU64,
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field(
                "topics",
                &self
                    .subscriptions
                    .lock()
                    .expect("bus lock poisoned")
                    .len(),
            )
            .finish()
    }
}

impl MemoryBus {
    /// Create a bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a client of this bus.
    pub fn client(self: &Arc<Self>) -> Arc<MemoryBroker> {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(MemoryBroker {
            bus: Arc::clone(self),
            client_id: self.next_client.fetch_add(1, Ordering::Relaxed),
            tx,
            connected: AtomicBool::new(false),
        })
    }

    fn deliver(&self, topic: &str, payload: &[u8]) {
        let subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
        if let Some(subscribers) = subscriptions.get(topic) {
            for subscriber in subscribers {
                let _ = subscriber.tx.send(BrokerEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
    }

    fn add_subscriber(&self, topic: &str, client_id: u64, tx: broadcast::Sender<BrokerEvent>) {
        let mut subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
        let entry = subscriptions.entry(topic.to_string()).or_default();
        if !entry.iter().any(|s| s.client_id == client_id) {
            entry.push(Subscriber { client_id, tx });
        }
    }

    fn drop_client(&self, client_id: u64) {
        let mut subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
        for subscribers in subscriptions.values_mut() {
            subscribers.retain(|s| s.client_id != client_id);
        }
    }
}

/// One client of a [`MemoryBus`].
pub struct MemoryBroker {
    bus: Arc<MemoryBus>,
    client_id: u64,
    tx: broadcast::Sender<BrokerEvent>,
    connected: AtomicBool,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("client_id", &self.client_id)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::Release);
        let _ = self.tx.send(BrokerEvent::Connected);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        self.bus.add_subscriber(topic, self.client_id, self.tx.clone());
        let _ = self.tx.send(BrokerEvent::Subscribed {
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        self.bus.deliver(topic, &payload);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.bus.drop_client(self.client_id);
            let _ = self.tx.send(BrokerEvent::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_self() {
        let bus = MemoryBus::new();
        let a = bus.client();
        let b = bus.client();

        let mut a_events = a.events();
        let mut b_events = b.events();

        a.connect().await.expect("connect a");
        b.connect().await.expect("connect b");
        a.subscribe("room/1").await.expect("subscribe a");
        b.subscribe("room/1").await.expect("subscribe b");

        a.publish("room/1", b"hello".to_vec()).await.expect("publish");

        // Both clients see the message, the publisher included.
        for events in [&mut a_events, &mut b_events] {
            loop {
                match events.recv().await.expect("event") {
                    BrokerEvent::Message { topic, payload } => {
                        assert_eq!(topic, "room/1");
                        assert_eq!(payload, b"hello");
                        break;
                    }
                    _ => continue,
                }
            }
        }
    }

    #[tokio::test]
    async fn test_unrelated_topic_not_delivered() {
        let bus = MemoryBus::new();
        let a = bus.client();
        let b = bus.client();

        a.connect().await.expect("connect");
        b.connect().await.expect("connect");
        b.subscribe("room/other").await.expect("subscribe");

        let mut b_events = b.events();
        a.publish("room/1", b"x".to_vec()).await.expect("publish");

        // Nothing should arrive for b
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(50),
            b_events.recv()
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let bus = MemoryBus::new();
        let a = bus.client();
        assert!(matches!(
            a.subscribe("t").await,
            Err(BrokerError::Closed)
        ));
        assert!(matches!(
            a.publish("t", vec![]).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let bus = MemoryBus::new();
        let a = bus.client();
        let b = bus.client();

        a.connect().await.expect("connect");
        b.connect().await.expect("connect");
        b.subscribe("room/1").await.expect("subscribe");
        b.close().await;

        let mut b_events = b.events();
        a.publish("room/1", b"late".to_vec()).await.expect("publish");
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(50),
            b_events.recv()
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_subscribed_event_emitted() {
        let bus = MemoryBus::new();
        let a = bus.client();
        let mut events = a.events();

        a.connect().await.expect("connect");
        a.subscribe("room/9").await.expect("subscribe");

        let mut saw_subscribed = false;
        for _ in 0..2 {
            match events.recv().await.expect("event") {
                BrokerEvent::Subscribed { topic } => {
                    assert_eq!(topic, "room/9");
                    saw_subscribed = true;
                    break;
                }
                _ => continue,
            }
        }
        assert!(saw_subscribed);
    }
}
