//! Signaling envelope and room transport.
//!
//! Every broker message on the room topic is one [`SignalFrame`]:
//! `{sender, timestamp, subtopic, data}`. The subtopic discriminates the
//! payload; decoding is an exhaustive match into [`SignalPayload`], never a
//! string-keyed handler table. The transport publishes frames (compressed
//! past the configured threshold), filters its own echoes on receive,
//! keeps a bounded history ring, and re-announces presence while the
//! client has no healthy peer.

pub mod compression;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerError, BrokerEvent};
use crate::config::CompressionConfig;
use crate::events::{ClientEvent, EventBus};
use crate::rtc::{IceCandidate, SessionDescription};

/// Early announce phase: this many ticks at [`ANNOUNCE_EARLY_INTERVAL`].
const ANNOUNCE_EARLY_TICKS: u32 = 5;
/// Tick interval right after joining, to win simultaneous-join races.
const ANNOUNCE_EARLY_INTERVAL: Duration = Duration::from_secs(3);
/// Steady-state announce interval.
const ANNOUNCE_STEADY_INTERVAL: Duration = Duration::from_secs(30);

/// Errors from signaling encode/decode/publish.
#[derive(Debug)]
pub enum SignalError {
    /// Gzip framing failed.
    Compression(String),
    /// A frame did not parse.
    Decode(String),
    /// A frame could not be encoded.
    Encode(String),
    /// The broker refused the publish.
    Broker(BrokerError),
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compression(msg) => write!(f, "signal compression failed: {msg}"),
            Self::Decode(msg) => write!(f, "signal frame unreadable: {msg}"),
            Self::Encode(msg) => write!(f, "signal frame unwritable: {msg}"),
            Self::Broker(e) => write!(f, "signal publish failed: {e}"),
        }
    }
}

impl std::error::Error for SignalError {}

impl From<BrokerError> for SignalError {
    fn from(e: BrokerError) -> Self {
        Self::Broker(e)
    }
}

/// What a peer announces about itself.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// Display name (with tab suffix when present).
    pub name: String,
    /// Base64 public key; present in signed mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_string: Option<String>,
    /// Anything else the application wants to piggyback.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The description + routing target inside an offer frame.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OfferDetail {
    /// The offerer's local description.
    pub local_description: SessionDescription,
    /// Identity string of the peer this offer is for.
    pub target: String,
}

/// `RTCOffer` payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    /// The offerer's user info.
    pub user_info: UserInfo,
    /// Description and target.
    pub offer: OfferDetail,
}

/// `RTCAnswer` payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    /// The answerer's local description.
    pub local_description: SessionDescription,
    /// Identity string of the peer this answer is for.
    pub target: String,
}

/// Every frame kind that travels on the room topic.
#[derive(Clone, Debug, PartialEq)]
pub enum SignalPayload {
    /// Presence announcement.
    Connect(UserInfo),
    /// A peer renamed itself.
    NameChange {
        /// Previous identity string.
        old_name: String,
        /// New identity string.
        new_name: String,
    },
    /// A peer is leaving; content is ignored.
    Unload(String),
    /// Connection offer for a specific target.
    RtcOffer(OfferPayload),
    /// Connection answer for a specific target.
    RtcAnswer(AnswerPayload),
    /// Trickle candidate; `None` marks the end of the trickle.
    RtcIceCandidate(Option<IceCandidate>),
}

impl SignalPayload {
    /// Wire subtopic of this payload.
    pub fn subtopic(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::NameChange { .. } => "nameChange",
            Self::Unload(_) => "unload",
            Self::RtcOffer(_) => "RTCOffer",
            Self::RtcAnswer(_) => "RTCAnswer",
            Self::RtcIceCandidate(_) => "RTCIceCandidate",
        }
    }

    fn to_data(&self) -> Result<Value, SignalError> {
        let encode = |e: serde_json::Error| SignalError::Encode(e.to_string());
        match self {
            Self::Connect(info) => serde_json::to_value(info).map_err(encode),
            Self::NameChange { old_name, new_name } => Ok(serde_json::json!({
                "oldName": old_name,
                "newName": new_name,
            })),
            Self::Unload(note) => serde_json::to_value(note).map_err(encode),
            Self::RtcOffer(offer) => serde_json::to_value(offer).map_err(encode),
            Self::RtcAnswer(answer) => serde_json::to_value(answer).map_err(encode),
            Self::RtcIceCandidate(candidate) => serde_json::to_value(candidate).map_err(encode),
        }
    }

    fn from_parts(subtopic: &str, data: Value) -> Result<Self, SignalError> {
        let decode = |e: serde_json::Error| SignalError::Decode(e.to_string());
        match subtopic {
            "connect" => Ok(Self::Connect(serde_json::from_value(data).map_err(decode)?)),
            "nameChange" => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Rename {
                    old_name: String,
                    new_name: String,
                }
                let rename: Rename = serde_json::from_value(data).map_err(decode)?;
                Ok(Self::NameChange {
                    old_name: rename.old_name,
                    new_name: rename.new_name,
                })
            }
            "unload" => Ok(Self::Unload(
                serde_json::from_value(data).unwrap_or_default(),
            )),
            "RTCOffer" => Ok(Self::RtcOffer(
                serde_json::from_value(data).map_err(decode)?,
            )),
            "RTCAnswer" => Ok(Self::RtcAnswer(
                serde_json::from_value(data).map_err(decode)?,
            )),
            "RTCIceCandidate" => Ok(Self::RtcIceCandidate(
                serde_json::from_value(data).map_err(decode)?,
            )),
            other => Err(SignalError::Decode(format!("unknown subtopic {other:?}"))),
        }
    }
}

/// JSON shape on the wire.
#[derive(Serialize, Deserialize, Debug)]
struct RawFrame {
    sender: String,
    timestamp: i64,
    subtopic: String,
    data: Value,
}

/// One decoded signaling frame.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalFrame {
    /// Sender identity string.
    pub sender: String,
    /// Sender-side wall clock, milliseconds since the epoch.
    pub timestamp: i64,
    /// The typed payload.
    pub payload: SignalPayload,
}

impl SignalFrame {
    /// Encode for the wire, compressing past the threshold.
    ///
    /// # Errors
    ///
    /// Returns `SignalError` when JSON encoding or gzip fails.
    pub fn encode(&self, compression: &CompressionConfig) -> Result<Vec<u8>, SignalError> {
        let raw = RawFrame {
            sender: self.sender.clone(),
            timestamp: self.timestamp,
            subtopic: self.payload.subtopic().to_string(),
            data: self.payload.to_data()?,
        };
        let json = serde_json::to_vec(&raw).map_err(|e| SignalError::Encode(e.to_string()))?;
        let threshold = compression.enabled.then_some(compression.threshold);
        compression::compress_frame(&json, threshold)
    }

    /// Decode from the wire: try the compressed framing first, then fall
    /// back to treating the bytes as plain JSON.
    ///
    /// # Errors
    ///
    /// Returns `SignalError::Decode` when neither attempt parses.
    pub fn decode(bytes: &[u8]) -> Result<Self, SignalError> {
        let raw: RawFrame = match compression::decompress_frame(bytes)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
        {
            Some(raw) => raw,
            None => serde_json::from_slice(bytes)
                .map_err(|e| SignalError::Decode(e.to_string()))?,
        };
        Ok(Self {
            sender: raw.sender,
            timestamp: raw.timestamp,
            payload: SignalPayload::from_parts(&raw.subtopic, raw.data)?,
        })
    }
}

/// A received frame plus its arrival stamp, as kept in the history ring.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    /// The decoded frame.
    pub frame: SignalFrame,
    /// Local arrival time, milliseconds since the epoch.
    pub received_at: i64,
}

/// Room transport: publish + inbound dispatch + presence announcements.
pub struct SignalTransport {
    broker: Arc<dyn Broker>,
    topic: String,
    sender_id: RwLock<String>,
    compression: CompressionConfig,
    history: Mutex<VecDeque<HistoryEntry>>,
    history_cap: usize,
    bus: Arc<EventBus>,
    announcing: AtomicBool,
}

impl std::fmt::Debug for SignalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalTransport")
            .field("topic", &self.topic)
            .field("sender", &self.sender())
            .finish_non_exhaustive()
    }
}

impl SignalTransport {
    /// Build a transport for one room.
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: String,
        sender_id: String,
        compression: CompressionConfig,
        history_cap: usize,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            topic,
            sender_id: RwLock::new(sender_id),
            compression,
            history: Mutex::new(VecDeque::new()),
            history_cap,
            bus,
            announcing: AtomicBool::new(false),
        })
    }

    /// Current sender identity string.
    pub fn sender(&self) -> String {
        self.sender_id.read().expect("sender lock poisoned").clone()
    }

    /// Replace the sender identity string (rename).
    pub fn set_sender(&self, sender: String) {
        *self.sender_id.write().expect("sender lock poisoned") = sender;
    }

    /// Frame and publish a payload on the room topic.
    ///
    /// # Errors
    ///
    /// Returns `SignalError` on encoding or broker failure.
    pub async fn publish(&self, payload: SignalPayload) -> Result<(), SignalError> {
        let frame = SignalFrame {
            sender: self.sender(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        };
        let bytes = frame.encode(&self.compression)?;
        self.broker.publish(&self.topic, bytes).await?;
        Ok(())
    }

    /// Snapshot of the history ring, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .expect("history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Start the inbound loop.
    ///
    /// Decoded frames from other senders are recorded, emitted as
    /// [`ClientEvent::BrokerMessage`] and forwarded into `frame_tx`. On the
    /// subscription ack a presence announcer starts: one immediate
    /// `connect`, then short ticks for the join-race window, then a slow
    /// steady tick — announcing only while `healthy()` is false.
    pub fn start(
        self: &Arc<Self>,
        frame_tx: mpsc::UnboundedSender<SignalFrame>,
        user_info: Arc<dyn Fn() -> UserInfo + Send + Sync>,
        healthy: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        let mut events = self.broker.events();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Signal] broker event stream lagged by {n}");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    BrokerEvent::Connected => {
                        transport.bus.emit(ClientEvent::BrokerConnected);
                    }
                    BrokerEvent::Subscribed { topic } if topic == transport.topic => {
                        if !transport.announcing.swap(true, Ordering::AcqRel) {
                            let announcer = Arc::clone(&transport);
                            let user_info = Arc::clone(&user_info);
                            let healthy = Arc::clone(&healthy);
                            tokio::spawn(async move {
                                announcer.announce_loop(user_info, healthy).await;
                            });
                        }
                    }
                    BrokerEvent::Message { topic, payload } if topic == transport.topic => {
                        transport.handle_message(&payload, &frame_tx);
                    }
                    BrokerEvent::Disconnected => {
                        log::warn!("[Signal] broker connection lost");
                    }
                    _ => {}
                }
            }
        })
    }

    fn handle_message(&self, payload: &[u8], frame_tx: &mpsc::UnboundedSender<SignalFrame>) {
        let frame = match SignalFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[Signal] dropping malformed frame: {e}");
                return;
            }
        };

        // Never dispatch our own echoes.
        if frame.sender == self.sender() {
            return;
        }

        {
            let mut history = self.history.lock().expect("history lock poisoned");
            if history.len() >= self.history_cap {
                history.pop_front();
            }
            history.push_back(HistoryEntry {
                frame: frame.clone(),
                received_at: chrono::Utc::now().timestamp_millis(),
            });
        }

        self.bus.emit(ClientEvent::BrokerMessage(frame.clone()));
        let _ = frame_tx.send(frame);
    }

    async fn announce_loop(
        &self,
        user_info: Arc<dyn Fn() -> UserInfo + Send + Sync>,
        healthy: Arc<dyn Fn() -> bool + Send + Sync>,
    ) {
        // Announce immediately on subscribe-ack.
        if let Err(e) = self.publish(SignalPayload::Connect(user_info.as_ref()())).await {
            log::warn!("[Signal] presence announce failed: {e}");
        }

        let mut ticks = 0u32;
        loop {
            let interval = if ticks < ANNOUNCE_EARLY_TICKS {
                ANNOUNCE_EARLY_INTERVAL
            } else {
                ANNOUNCE_STEADY_INTERVAL
            };
            tokio::time::sleep(interval).await;
            ticks = ticks.saturating_add(1);

            if healthy.as_ref()() {
                continue;
            }
            if let Err(e) = self.publish(SignalPayload::Connect(user_info.as_ref()())).await {
                log::warn!("[Signal] presence announce failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBus;
    use crate::config::CompressionConfig;
    use crate::rtc::SdpKind;

    fn frame(payload: SignalPayload) -> SignalFrame {
        SignalFrame {
            sender: "alice|KEY".to_string(),
            timestamp: 1_700_000_000_000,
            payload,
        }
    }

    fn no_compression() -> CompressionConfig {
        CompressionConfig {
            enabled: false,
            threshold: 0,
        }
    }

    #[test]
    fn test_connect_frame_wire_shape() {
        let frame = frame(SignalPayload::Connect(UserInfo {
            name: "alice".to_string(),
            public_key_string: Some("KEY".to_string()),
            extra: serde_json::Map::new(),
        }));
        let bytes = frame.encode(&no_compression()).expect("encode");
        // Strip the raw marker and inspect the JSON
        let value: Value = serde_json::from_slice(&bytes[1..]).expect("json");
        assert_eq!(value["sender"], "alice|KEY");
        assert_eq!(value["subtopic"], "connect");
        assert_eq!(value["data"]["name"], "alice");
        assert_eq!(value["data"]["publicKeyString"], "KEY");
    }

    #[test]
    fn test_encode_decode_roundtrip_all_kinds() {
        let candidates = vec![
            SignalPayload::Connect(UserInfo {
                name: "a".into(),
                public_key_string: None,
                extra: serde_json::Map::new(),
            }),
            SignalPayload::NameChange {
                old_name: "a|K".into(),
                new_name: "b|K".into(),
            },
            SignalPayload::Unload("bye".into()),
            SignalPayload::RtcOffer(OfferPayload {
                user_info: UserInfo {
                    name: "a".into(),
                    public_key_string: None,
                    extra: serde_json::Map::new(),
                },
                offer: OfferDetail {
                    local_description: SessionDescription {
                        kind: SdpKind::Offer,
                        sdp: "v=0".into(),
                    },
                    target: "b|K".into(),
                },
            }),
            SignalPayload::RtcAnswer(AnswerPayload {
                local_description: SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: "v=0".into(),
                },
                target: "a|K".into(),
            }),
            SignalPayload::RtcIceCandidate(Some(IceCandidate {
                candidate: "candidate:0".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            })),
            SignalPayload::RtcIceCandidate(None),
        ];

        for payload in candidates {
            let original = frame(payload);
            let bytes = original.encode(&no_compression()).expect("encode");
            let decoded = SignalFrame::decode(&bytes).expect("decode");
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_compressed_roundtrip_is_byte_equal() {
        let mut extra = serde_json::Map::new();
        extra.insert("blob".to_string(), Value::String("x".repeat(8_192)));
        let original = frame(SignalPayload::Connect(UserInfo {
            name: "alice".into(),
            public_key_string: None,
            extra,
        }));

        let config = CompressionConfig {
            enabled: true,
            threshold: 1024,
        };
        let bytes = original.encode(&config).expect("encode");
        assert_eq!(bytes[0], 0x1f, "payload over threshold must compress");

        let decoded = SignalFrame::decode(&bytes).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_plain_json_still_decodes() {
        let json = br#"{"sender":"bob","timestamp":1,"subtopic":"unload","data":"x"}"#;
        let decoded = SignalFrame::decode(json).expect("decode");
        assert_eq!(decoded.sender, "bob");
        assert_eq!(decoded.payload, SignalPayload::Unload("x".into()));
    }

    #[test]
    fn test_unknown_subtopic_rejected() {
        let json = br#"{"sender":"bob","timestamp":1,"subtopic":"mystery","data":null}"#;
        assert!(SignalFrame::decode(json).is_err());
    }

    #[tokio::test]
    async fn test_own_echo_never_dispatched() {
        let bus_events = EventBus::new();
        let broker_bus = MemoryBus::new();
        let broker = broker_bus.client();

        let broker_dyn: Arc<dyn Broker> = broker.clone();
        let transport = SignalTransport::new(
            broker_dyn,
            "parlor/test".to_string(),
            "alice|KEY".to_string(),
            no_compression(),
            16,
            Arc::clone(&bus_events),
        );

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let _task = transport.start(
            frame_tx,
            Arc::new(UserInfo::default),
            Arc::new(|| true),
        );

        broker.connect().await.expect("connect");
        broker.subscribe("parlor/test").await.expect("subscribe");

        transport
            .publish(SignalPayload::Unload(String::new()))
            .await
            .expect("publish");

        // The echo must be filtered: nothing forwarded, nothing recorded.
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(100),
            frame_rx.recv()
        )
        .await
        .is_err());
        assert!(transport.history().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_frame_dispatched_and_recorded() {
        let bus_events = EventBus::new();
        let broker_bus = MemoryBus::new();
        let alice_broker = broker_bus.client();
        let bob_broker = broker_bus.client();

        let broker_dyn: Arc<dyn Broker> = alice_broker.clone();
        let transport = SignalTransport::new(
            broker_dyn,
            "parlor/test".to_string(),
            "alice|KEY".to_string(),
            no_compression(),
            16,
            Arc::clone(&bus_events),
        );

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let _task = transport.start(
            frame_tx,
            Arc::new(UserInfo::default),
            Arc::new(|| true),
        );

        alice_broker.connect().await.expect("connect");
        alice_broker.subscribe("parlor/test").await.expect("subscribe");
        bob_broker.connect().await.expect("connect");

        let bob_frame = SignalFrame {
            sender: "bob|K2".to_string(),
            timestamp: 42,
            payload: SignalPayload::Unload(String::new()),
        };
        bob_broker
            .publish(
                "parlor/test",
                bob_frame.encode(&no_compression()).expect("encode"),
            )
            .await
            .expect("publish");

        let received = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            frame_rx.recv(),
        )
        .await
        .expect("timely")
        .expect("frame");
        assert_eq!(received.sender, "bob|K2");
        assert_eq!(transport.history().len(), 1);
    }
}
