//! Publish/subscribe broker boundary.
//!
//! The broker is a commodity service that carries signaling frames only; it
//! is never trusted with anything beyond delivery. A client needs four
//! things from it: connect, subscribe to the room topic, publish bytes, and
//! a stream of [`BrokerEvent`]s. Reconnection is the broker client's own
//! business — the signaling layer does not replay history.
//!
//! Like a real broker, implementations deliver a publish back to the
//! publisher when it subscribes to the topic; the signaling layer filters
//! those echoes by sender.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use memory::{MemoryBroker, MemoryBus};
pub use websocket::WebSocketBroker;

/// Errors raised by a broker client.
#[derive(Debug)]
pub enum BrokerError {
    /// Initial connection failed.
    Connect(String),
    /// Subscription failed.
    Subscribe(String),
    /// Publish failed.
    Publish(String),
    /// The client is closed or was never connected.
    Closed,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "broker connect failed: {msg}"),
            Self::Subscribe(msg) => write!(f, "broker subscribe failed: {msg}"),
            Self::Publish(msg) => write!(f, "broker publish failed: {msg}"),
            Self::Closed => write!(f, "broker client closed"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Events observable on a broker client.
#[derive(Clone, Debug)]
pub enum BrokerEvent {
    /// The connection is up (also after a reconnect).
    Connected,
    /// The broker acknowledged a subscription.
    Subscribed {
        /// The subscribed topic.
        topic: String,
    },
    /// A message arrived on a subscribed topic.
    Message {
        /// Topic it arrived on.
        topic: String,
        /// Raw payload bytes.
        payload: Vec<u8>,
    },
    /// The connection dropped; the client reconnects on its own.
    Disconnected,
}

/// A publish/subscribe broker client.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish the connection.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Connect` when the broker is unreachable. This
    /// is the one fatal broker error: it fails the whole load routine.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Subscribe to a topic. Emits [`BrokerEvent::Subscribed`] once the
    /// broker acknowledges.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError` when not connected or the request cannot be
    /// sent.
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    /// Publish bytes to a topic.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError` when not connected or the send fails.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Subscribe to client events. Each call returns an independent
    /// receiver; subscribe before calling [`Broker::connect`] to observe
    /// the initial `Connected`.
    fn events(&self) -> broadcast::Receiver<BrokerEvent>;

    /// Tear the connection down for good.
    async fn close(&self);
}
