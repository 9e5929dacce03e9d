//! Typed application protocol over the data channels.
//!
//! Each peer connection carries a fixed, ordered set of named channels: one
//! per message kind plus the four call-control channels. The router decodes
//! by channel kind through one exhaustive match, keeps the per-peer
//! question/answer correlation state, auto-answers liveness probes, and
//! hands the call-control frames to the call manager.
//!
//! Ordering is guaranteed per channel only; nothing here may assume
//! cross-channel ordering (an `answer` can legally race the readiness
//! handshake).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection::ConnectionManager;
use crate::events::{ClientEvent, EventBus};
use crate::rtc::{IceCandidate, MediaIntent, SessionDescription};

/// Errors from the data-channel protocol.
#[derive(Debug)]
pub enum ProtocolError {
    /// No link exists for that peer.
    NoSuchPeer(String),
    /// The channel did not open within the send timeout.
    ChannelOpenTimeout(String),
    /// The channel is closed or the send failed.
    ChannelClosed(String),
    /// A payload did not decode.
    Decode(String),
    /// A payload did not encode.
    Encode(String),
    /// The peer went away mid-exchange.
    PeerGone(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchPeer(peer) => write!(f, "no connection to {peer}"),
            Self::ChannelOpenTimeout(label) => {
                write!(f, "channel {label:?} did not open in time")
            }
            Self::ChannelClosed(msg) => write!(f, "channel send failed: {msg}"),
            Self::Decode(msg) => write!(f, "payload unreadable: {msg}"),
            Self::Encode(msg) => write!(f, "payload unwritable: {msg}"),
            Self::PeerGone(peer) => write!(f, "{peer} disconnected mid-exchange"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The closed set of channel kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Readiness handshake; payload ignored.
    ConnectedViaRtc,
    /// Broadcast text.
    Chat,
    /// Direct text.
    Dm,
    /// Correlated request.
    Question,
    /// Correlated response.
    Answer,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Media sub-connection offer.
    StreamOffer,
    /// Media sub-connection answer.
    StreamAnswer,
    /// Media sub-connection trickle candidate.
    StreamIce,
    /// Media teardown.
    EndCall,
}

impl ChannelKind {
    /// Fixed creation order; the offerer creates channels in exactly this
    /// sequence and a connection is ready only when all of them opened.
    pub const ALL: [ChannelKind; 11] = [
        ChannelKind::ConnectedViaRtc,
        ChannelKind::Chat,
        ChannelKind::Dm,
        ChannelKind::Question,
        ChannelKind::Answer,
        ChannelKind::Ping,
        ChannelKind::Pong,
        ChannelKind::StreamOffer,
        ChannelKind::StreamAnswer,
        ChannelKind::StreamIce,
        ChannelKind::EndCall,
    ];

    /// Wire label of the channel.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ConnectedViaRtc => "connectedViaRTC",
            Self::Chat => "chat",
            Self::Dm => "dm",
            Self::Question => "question",
            Self::Answer => "answer",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::StreamOffer => "streamoffer",
            Self::StreamAnswer => "streamanswer",
            Self::StreamIce => "streamice",
            Self::EndCall => "endcall",
        }
    }

    /// Reverse of [`ChannelKind::label`].
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label() == label)
    }
}

/// A question body: topic plus free-form content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QuestionBody {
    /// What the question is about.
    pub topic: String,
    /// Topic-specific content.
    pub content: Value,
}

/// Wire payload on the `question` channel.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QuestionPayload {
    /// Per-sender correlation number.
    pub n: u64,
    /// The question itself.
    pub question: QuestionBody,
}

/// Wire payload on the `answer` channel.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AnswerPayload {
    /// Correlation number being answered.
    pub n: u64,
    /// The answer value.
    pub answer: Value,
    /// Echo of the question, for context.
    pub question: QuestionBody,
}

/// Wire payload on the `streamoffer` channel.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StreamOfferPayload {
    /// Media sub-connection offer.
    pub offer: SessionDescription,
    /// Which tracks the caller wants.
    pub stream_info: MediaIntent,
}

/// Wire payload on the `streamanswer` channel.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StreamAnswerPayload {
    /// Media sub-connection answer.
    pub answer: SessionDescription,
}

/// Call-control messages extracted for the call manager.
#[derive(Debug)]
pub enum CallControl {
    /// `streamoffer` arrived.
    Offer(StreamOfferPayload),
    /// `streamanswer` arrived.
    Answer(StreamAnswerPayload),
    /// `streamice` arrived.
    Ice(IceCandidate),
    /// `endcall` arrived.
    End,
}

/// One message as delivered by the connection manager's channel readers.
#[derive(Debug)]
pub struct ChannelInbound {
    /// Which peer sent it.
    pub peer: String,
    /// Which channel it arrived on.
    pub kind: ChannelKind,
    /// Raw payload bytes.
    pub bytes: Vec<u8>,
}

/// Answers questions on a topic without involving the application.
#[async_trait]
pub trait QuestionResponder: Send + Sync {
    /// Produce an answer, or `None` to stay silent.
    async fn respond(&self, peer: &str, content: &Value) -> Option<Value>;
}

struct PeerCorrelation {
    next_n: u64,
    pending: HashMap<u64, oneshot::Sender<Value>>,
    ping_waiters: Vec<oneshot::Sender<()>>,
}

impl PeerCorrelation {
    fn new() -> Self {
        Self {
            next_n: 0,
            pending: HashMap::new(),
            ping_waiters: Vec::new(),
        }
    }
}

/// The protocol router.
pub struct ProtocolRouter {
    manager: Arc<ConnectionManager>,
    bus: Arc<EventBus>,
    correlation: Mutex<HashMap<String, PeerCorrelation>>,
    responders: RwLock<HashMap<String, Arc<dyn QuestionResponder>>>,
    call_tx: mpsc::UnboundedSender<(String, CallControl)>,
}

impl std::fmt::Debug for ProtocolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRouter").finish_non_exhaustive()
    }
}

impl ProtocolRouter {
    /// Build the router. The returned receiver carries call-control
    /// messages for the call manager.
    pub fn new(
        manager: Arc<ConnectionManager>,
        bus: Arc<EventBus>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, CallControl)>) {
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                manager,
                bus,
                correlation: Mutex::new(HashMap::new()),
                responders: RwLock::new(HashMap::new()),
                call_tx,
            }),
            call_rx,
        )
    }

    /// Install a responder for a question topic.
    pub fn register_responder(&self, topic: &str, responder: Arc<dyn QuestionResponder>) {
        self.responders
            .write()
            .expect("responders lock poisoned")
            .insert(topic.to_string(), responder);
    }

    /// Start the dispatch loop over the connection manager's inbound queue.
    pub fn start(
        self: &Arc<Self>,
        mut inbound_rx: mpsc::UnboundedReceiver<ChannelInbound>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                router.dispatch(inbound).await;
            }
        })
    }

    /// Drop the correlation state for a departed peer. In-flight asks and
    /// pings resolve with `PeerGone`.
    pub fn forget_peer(&self, peer: &str) {
        self.correlation
            .lock()
            .expect("correlation lock poisoned")
            .remove(peer);
    }

    async fn dispatch(self: &Arc<Self>, inbound: ChannelInbound) {
        let ChannelInbound { peer, kind, bytes } = inbound;
        match kind {
            ChannelKind::ConnectedViaRtc => {
                // Payload deliberately ignored.
                self.manager.mark_remote_ready(&peer);
            }
            ChannelKind::Chat => match decode::<String>(&bytes) {
                Ok(text) => self.bus.emit(ClientEvent::Chat { peer, text }),
                Err(e) => log::warn!("[Protocol] chat from {peer} dropped: {e}"),
            },
            ChannelKind::Dm => match decode::<String>(&bytes) {
                Ok(text) => self.bus.emit(ClientEvent::Dm { peer, text }),
                Err(e) => log::warn!("[Protocol] dm from {peer} dropped: {e}"),
            },
            ChannelKind::Question => match decode::<QuestionPayload>(&bytes) {
                Ok(question) => self.on_question(peer, question).await,
                Err(e) => log::warn!("[Protocol] question from {peer} dropped: {e}"),
            },
            ChannelKind::Answer => match decode::<AnswerPayload>(&bytes) {
                Ok(answer) => self.on_answer(&peer, answer),
                Err(e) => log::warn!("[Protocol] answer from {peer} dropped: {e}"),
            },
            ChannelKind::Ping => {
                // Probes answer themselves.
                if let Err(e) = self.send_raw(&peer, ChannelKind::Pong, &Value::Null).await {
                    log::debug!("[Protocol] pong to {peer} failed: {e}");
                }
                self.bus.emit(ClientEvent::Ping { peer });
            }
            ChannelKind::Pong => {
                let waiters = {
                    let mut correlation =
                        self.correlation.lock().expect("correlation lock poisoned");
                    correlation
                        .get_mut(&peer)
                        .map(|c| std::mem::take(&mut c.ping_waiters))
                        .unwrap_or_default()
                };
                for waiter in waiters {
                    let _ = waiter.send(());
                }
                self.bus.emit(ClientEvent::Pong { peer });
            }
            ChannelKind::StreamOffer => match decode::<StreamOfferPayload>(&bytes) {
                Ok(offer) => {
                    let _ = self.call_tx.send((peer, CallControl::Offer(offer)));
                }
                Err(e) => log::warn!("[Protocol] stream offer from {peer} dropped: {e}"),
            },
            ChannelKind::StreamAnswer => match decode::<StreamAnswerPayload>(&bytes) {
                Ok(answer) => {
                    let _ = self.call_tx.send((peer, CallControl::Answer(answer)));
                }
                Err(e) => log::warn!("[Protocol] stream answer from {peer} dropped: {e}"),
            },
            ChannelKind::StreamIce => match decode::<IceCandidate>(&bytes) {
                Ok(candidate) => {
                    let _ = self.call_tx.send((peer, CallControl::Ice(candidate)));
                }
                Err(e) => log::warn!("[Protocol] stream candidate from {peer} dropped: {e}"),
            },
            ChannelKind::EndCall => {
                let _ = self.call_tx.send((peer, CallControl::End));
            }
        }
    }

    async fn on_question(self: &Arc<Self>, peer: String, payload: QuestionPayload) {
        let responder = {
            let responders = self.responders.read().expect("responders lock poisoned");
            responders.get(&payload.question.topic).cloned()
        };

        match responder {
            Some(responder) => {
                if let Some(answer) = responder.respond(&peer, &payload.question.content).await {
                    let reply = AnswerPayload {
                        n: payload.n,
                        answer,
                        question: payload.question,
                    };
                    if let Err(e) = self.send_raw(&peer, ChannelKind::Answer, &reply).await {
                        log::warn!("[Protocol] answer to {peer} failed: {e}");
                    }
                }
            }
            None => {
                self.bus.emit(ClientEvent::Question {
                    peer,
                    n: payload.n,
                    topic: payload.question.topic,
                    content: payload.question.content,
                });
            }
        }
    }

    fn on_answer(&self, peer: &str, payload: AnswerPayload) {
        let resolver = {
            let mut correlation = self.correlation.lock().expect("correlation lock poisoned");
            correlation
                .get_mut(peer)
                .and_then(|c| c.pending.remove(&payload.n))
        };
        match resolver {
            // First answer wins; the entry is gone, so a duplicate cannot
            // resolve twice.
            Some(resolver) => {
                let _ = resolver.send(payload.answer);
            }
            None => log::debug!(
                "[Protocol] answer {} from {peer} has no outstanding question",
                payload.n
            ),
        }
    }

    /// Broadcast chat text to every connected peer.
    pub async fn send_chat(&self, text: &str) -> Result<(), ProtocolError> {
        let mut last_error = None;
        for peer in self.manager.connected_peers() {
            if let Err(e) = self.send_raw(&peer, ChannelKind::Chat, &text).await {
                log::warn!("[Protocol] chat to {peer} failed: {e}");
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Send a direct message.
    pub async fn send_dm(&self, peer: &str, text: &str) -> Result<(), ProtocolError> {
        self.send_raw(peer, ChannelKind::Dm, &text).await
    }

    /// Ask `peer` a question and wait for the first matching answer.
    ///
    /// No timeout is applied here; wrap the future when one is wanted.
    ///
    /// # Errors
    ///
    /// `ProtocolError` on send failure, or `PeerGone` when the peer's
    /// correlation state is dropped before an answer arrives.
    pub async fn ask(
        &self,
        peer: &str,
        topic: &str,
        content: Value,
    ) -> Result<Value, ProtocolError> {
        let (resolve_tx, resolve_rx) = oneshot::channel();
        let n = {
            let mut correlation = self.correlation.lock().expect("correlation lock poisoned");
            let entry = correlation
                .entry(peer.to_string())
                .or_insert_with(PeerCorrelation::new);
            let n = entry.next_n;
            entry.next_n += 1;
            entry.pending.insert(n, resolve_tx);
            n
        };

        let payload = QuestionPayload {
            n,
            question: QuestionBody {
                topic: topic.to_string(),
                content,
            },
        };
        if let Err(e) = self.send_raw(peer, ChannelKind::Question, &payload).await {
            // Clean the dangling resolver up before surfacing the error.
            let mut correlation = self.correlation.lock().expect("correlation lock poisoned");
            if let Some(entry) = correlation.get_mut(peer) {
                entry.pending.remove(&n);
            }
            return Err(e);
        }

        resolve_rx
            .await
            .map_err(|_| ProtocolError::PeerGone(peer.to_string()))
    }

    /// Probe a peer; resolves when its `pong` arrives.
    ///
    /// # Errors
    ///
    /// `ProtocolError` on send failure, or `PeerGone` when the peer leaves
    /// before answering.
    pub async fn ping(&self, peer: &str) -> Result<(), ProtocolError> {
        let (resolve_tx, resolve_rx) = oneshot::channel();
        {
            let mut correlation = self.correlation.lock().expect("correlation lock poisoned");
            correlation
                .entry(peer.to_string())
                .or_insert_with(PeerCorrelation::new)
                .ping_waiters
                .push(resolve_tx);
        }

        self.send_raw(peer, ChannelKind::Ping, &Value::Null).await?;
        resolve_rx
            .await
            .map_err(|_| ProtocolError::PeerGone(peer.to_string()))
    }

    /// Send a call-control payload on the matching channel.
    pub async fn send_call(
        &self,
        peer: &str,
        control: &CallControl,
    ) -> Result<(), ProtocolError> {
        match control {
            CallControl::Offer(offer) => {
                self.send_raw(peer, ChannelKind::StreamOffer, offer).await
            }
            CallControl::Answer(answer) => {
                self.send_raw(peer, ChannelKind::StreamAnswer, answer).await
            }
            CallControl::Ice(candidate) => {
                self.send_raw(peer, ChannelKind::StreamIce, candidate).await
            }
            CallControl::End => self.send_raw(peer, ChannelKind::EndCall, &Value::Null).await,
        }
    }

    async fn send_raw<T: Serialize>(
        &self,
        peer: &str,
        kind: ChannelKind,
        payload: &T,
    ) -> Result<(), ProtocolError> {
        let bytes =
            serde_json::to_vec(payload).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        self.manager.send_on(peer, kind, bytes).await
    }
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_order_is_fixed_and_complete() {
        assert_eq!(ChannelKind::ALL.len(), 11);
        assert_eq!(ChannelKind::ALL[0], ChannelKind::ConnectedViaRtc);
        // The four call-control channels close the set.
        assert_eq!(
            &ChannelKind::ALL[7..],
            &[
                ChannelKind::StreamOffer,
                ChannelKind::StreamAnswer,
                ChannelKind::StreamIce,
                ChannelKind::EndCall,
            ]
        );
    }

    #[test]
    fn test_labels_roundtrip() {
        for kind in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_label(kind.label()), Some(kind));
        }
        assert_eq!(ChannelKind::from_label("mystery"), None);
    }

    #[test]
    fn test_stream_offer_wire_shape() {
        let payload = StreamOfferPayload {
            offer: SessionDescription {
                kind: crate::rtc::SdpKind::Offer,
                sdp: "v=0".into(),
            },
            stream_info: MediaIntent {
                audio: true,
                video: false,
            },
        };
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["streamInfo"]["audio"], true);
        assert_eq!(json["streamInfo"]["video"], false);
        assert_eq!(json["offer"]["type"], "offer");
    }

    #[test]
    fn test_question_payload_roundtrip() {
        let payload = QuestionPayload {
            n: 7,
            question: QuestionBody {
                topic: "validate".into(),
                content: serde_json::json!({"challenge": "abc"}),
            },
        };
        let bytes = serde_json::to_vec(&payload).expect("serialize");
        let back: QuestionPayload = serde_json::from_slice(&bytes).expect("parse");
        assert_eq!(back.n, 7);
        assert_eq!(back.question.topic, "validate");
    }
}
