//! WebSocket broker client.
//!
//! Speaks a minimal JSON pub/sub framing over a WebSocket:
//!
//! - client → broker: `{"command":"subscribe","topic":T}` and
//!   `{"command":"publish","topic":T,"payload":B64}`
//! - broker → client: `{"type":"welcome"}` on connect,
//!   `{"type":"subscribed","topic":T}` as the subscription ack, and
//!   `{"type":"message","topic":T,"payload":B64}` for deliveries.
//!
//! The initial connect is the caller's problem (fatal at load time); any
//! later drop reconnects with exponential backoff plus jitter and replays
//! the subscriptions. Queued publishes survive a reconnect up to the
//! command-queue capacity.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message, MaybeTlsStream,
    WebSocketStream,
};

use super::{Broker, BrokerError, BrokerEvent};

/// Reconnection backoff bounds.
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;
/// How long to wait for the welcome frame.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
/// Outgoing command queue capacity.
const COMMAND_CAPACITY: usize = 256;
/// Event fan-out capacity.
const EVENT_CAPACITY: usize = 512;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client → broker frames.
#[derive(Debug, Serialize)]
struct OutgoingFrame<'a> {
    command: &'a str,
    topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

/// Broker → client frames.
#[derive(Debug, Deserialize)]
struct IncomingFrame {
    #[serde(rename = "type")]
    frame_type: String,
    topic: Option<String>,
    payload: Option<String>,
}

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Publish { topic: String, payload: Vec<u8> },
}

/// WebSocket-backed [`Broker`] implementation.
pub struct WebSocketBroker {
    url: String,
    tx: broadcast::Sender<BrokerEvent>,
    command_tx: Mutex<Option<mpsc::Sender<Command>>>,
    topics: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for WebSocketBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketBroker")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebSocketBroker {
    /// Create a client for `url` (`ws://` or `wss://`). Nothing happens
    /// until [`Broker::connect`].
    pub fn new(url: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            url: url.into(),
            tx,
            command_tx: Mutex::new(None),
            topics: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Open the socket and wait for the welcome frame.
    async fn open(url: &str) -> Result<WsStream, BrokerError> {
        let request = url
            .into_client_request()
            .map_err(|e| BrokerError::Connect(format!("invalid URL: {e}")))?;

        let (mut stream, _) = connect_async(request)
            .await
            .map_err(|e| BrokerError::Connect(format!("WebSocket connect failed: {e}")))?;

        let welcome = tokio::time::timeout(WELCOME_TIMEOUT, async {
            while let Some(msg) = stream.next().await {
                if let Ok(Message::Text(text)) = msg {
                    if let Ok(frame) = serde_json::from_str::<IncomingFrame>(&text) {
                        if frame.frame_type == "welcome" {
                            return Ok(());
                        }
                    }
                }
            }
            Err(BrokerError::Connect("socket closed before welcome".into()))
        })
        .await;

        match welcome {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BrokerError::Connect("timeout waiting for welcome".into())),
        }
    }

    fn encode_command(command: &Command) -> String {
        let frame = match command {
            Command::Subscribe(topic) => OutgoingFrame {
                command: "subscribe",
                topic,
                payload: None,
            },
            Command::Publish { topic, payload } => OutgoingFrame {
                command: "publish",
                topic,
                payload: Some(BASE64.encode(payload)),
            },
        };
        serde_json::to_string(&frame).expect("command frame serializable")
    }

    fn handle_text(tx: &broadcast::Sender<BrokerEvent>, text: &str) {
        let frame: IncomingFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("[Broker] unparseable frame ignored: {e}");
                return;
            }
        };

        match frame.frame_type.as_str() {
            "subscribed" => {
                if let Some(topic) = frame.topic {
                    let _ = tx.send(BrokerEvent::Subscribed { topic });
                }
            }
            "message" => {
                let (Some(topic), Some(payload)) = (frame.topic, frame.payload) else {
                    return;
                };
                match BASE64.decode(payload) {
                    Ok(payload) => {
                        let _ = tx.send(BrokerEvent::Message { topic, payload });
                    }
                    Err(e) => log::debug!("[Broker] undecodable payload ignored: {e}"),
                }
            }
            other => log::debug!("[Broker] frame type {other:?} ignored"),
        }
    }

    /// Connection loop: pump commands and deliveries, reconnect on drop.
    async fn run_loop(
        url: String,
        tx: broadcast::Sender<BrokerEvent>,
        topics: Arc<Mutex<Vec<String>>>,
        mut command_rx: mpsc::Receiver<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
        mut stream: WsStream,
    ) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        'connection: loop {
            let (mut write, mut read) = stream.split();

            // Replay subscriptions after a reconnect.
            let resubscribe: Vec<String> = topics.lock().expect("topics lock poisoned").clone();
            for topic in resubscribe {
                let frame = Self::encode_command(&Command::Subscribe(topic));
                if write.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }

            let dropped = loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        let Some(command) = command else { return };
                        let frame = Self::encode_command(&command);
                        if write.send(Message::Text(frame)).await.is_err() {
                            break true;
                        }
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => Self::handle_text(&tx, &text),
                            Some(Ok(Message::Ping(data))) => {
                                if write.send(Message::Pong(data)).await.is_err() {
                                    break true;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break true,
                            Some(Err(e)) => {
                                log::warn!("[Broker] socket error: {e}");
                                break true;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                    _ = &mut shutdown_rx => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            };

            if dropped {
                let _ = tx.send(BrokerEvent::Disconnected);
                log::warn!("[Broker] connection lost, reconnecting");
            }

            // Backoff with jitter until the broker answers again.
            loop {
                let jitter_ms = rand::random::<u64>() % 1000;
                let wait = Duration::from_millis(backoff_secs * 1000 + jitter_ms);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = &mut shutdown_rx => return,
                }

                match Self::open(&url).await {
                    Ok(next) => {
                        stream = next;
                        backoff_secs = INITIAL_BACKOFF_SECS;
                        let _ = tx.send(BrokerEvent::Connected);
                        continue 'connection;
                    }
                    Err(e) => {
                        log::warn!("[Broker] reconnect failed: {e}");
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Broker for WebSocketBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let stream = Self::open(&self.url).await?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.command_tx.lock().expect("command lock poisoned") = Some(command_tx);
        *self.shutdown_tx.lock().expect("shutdown lock poisoned") = Some(shutdown_tx);

        tokio::spawn(Self::run_loop(
            self.url.clone(),
            self.tx.clone(),
            Arc::clone(&self.topics),
            command_rx,
            shutdown_rx,
            stream,
        ));

        let _ = self.tx.send(BrokerEvent::Connected);
        log::info!("[Broker] connected to {}", self.url);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.topics
            .lock()
            .expect("topics lock poisoned")
            .push(topic.to_string());

        let command_tx = self
            .command_tx
            .lock()
            .expect("command lock poisoned")
            .clone()
            .ok_or(BrokerError::Closed)?;
        command_tx
            .send(Command::Subscribe(topic.to_string()))
            .await
            .map_err(|_| BrokerError::Closed)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let command_tx = self
            .command_tx
            .lock()
            .expect("command lock poisoned")
            .clone()
            .ok_or(BrokerError::Closed)?;
        command_tx
            .send(Command::Publish {
                topic: topic.to_string(),
                payload,
            })
            .await
            .map_err(|_| BrokerError::Closed)
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    async fn close(&self) {
        if let Some(shutdown) = self
            .shutdown_tx
            .lock()
            .expect("shutdown lock poisoned")
            .take()
        {
            let _ = shutdown.send(());
        }
        self.command_tx.lock().expect("command lock poisoned").take();
        let _ = self.tx.send(BrokerEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        let frame = WebSocketBroker::encode_command(&Command::Subscribe("room/1".into()));
        let value: serde_json::Value = serde_json::from_str(&frame).expect("parse");
        assert_eq!(value["command"], "subscribe");
        assert_eq!(value["topic"], "room/1");
        assert!(value.get("payload").is_none());

        let frame = WebSocketBroker::encode_command(&Command::Publish {
            topic: "room/1".into(),
            payload: b"hi".to_vec(),
        });
        let value: serde_json::Value = serde_json::from_str(&frame).expect("parse");
        assert_eq!(value["command"], "publish");
        assert_eq!(value["payload"], BASE64.encode(b"hi"));
    }

    #[test]
    fn test_incoming_message_decodes() {
        let (tx, mut rx) = broadcast::channel(8);
        let text = format!(
            r#"{{"type":"message","topic":"room/1","payload":"{}"}}"#,
            BASE64.encode(b"payload")
        );
        WebSocketBroker::handle_text(&tx, &text);

        match rx.try_recv().expect("event") {
            BrokerEvent::Message { topic, payload } => {
                assert_eq!(topic, "room/1");
                assert_eq!(payload, b"payload");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_incoming_garbage_ignored() {
        let (tx, mut rx) = broadcast::channel(8);
        WebSocketBroker::handle_text(&tx, "not json");
        WebSocketBroker::handle_text(&tx, r#"{"type":"message","topic":"t"}"#);
        WebSocketBroker::handle_text(&tx, r#"{"type":"message","topic":"t","payload":"@@"}"#);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subscribed_ack() {
        let (tx, mut rx) = broadcast::channel(8);
        WebSocketBroker::handle_text(&tx, r#"{"type":"subscribed","topic":"room/2"}"#);
        match rx.try_recv().expect("event") {
            BrokerEvent::Subscribed { topic } => assert_eq!(topic, "room/2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let broker = WebSocketBroker::new("ws://localhost:1");
        assert!(matches!(
            broker.subscribe("t").await,
            Err(BrokerError::Closed)
        ));
        assert!(matches!(
            broker.publish("t", vec![]).await,
            Err(BrokerError::Closed)
        ));
    }
}
