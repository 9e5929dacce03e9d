//! Boundary contract for the real-time-communication engine.
//!
//! The crate never implements transport-level RTC itself; it drives an
//! engine through these traits. An engine supplies peer sessions (session
//! descriptions, trickle ICE, connection state), named data channels and
//! media tracks, and answers stats queries. [`memory::MemoryRtc`] is the
//! in-process engine used by tests and demos; production embeddings adapt a
//! real stack (a browser bridge, a native WebRTC crate) to the same traits.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{IceServerConfig, IceTransportPolicy};

/// Errors surfaced by an RTC engine.
#[derive(Debug)]
pub enum RtcError {
    /// Session could not be created.
    Setup(String),
    /// An SDP operation failed or was applied in the wrong state.
    Sdp(String),
    /// An ICE candidate was rejected.
    Ice(String),
    /// A data channel operation failed.
    Channel(String),
    /// The channel is not open.
    ChannelNotOpen(String),
    /// Track acquisition failed.
    Media(String),
    /// The session is closed.
    Closed,
}

impl std::fmt::Display for RtcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup(msg) => write!(f, "session setup failed: {msg}"),
            Self::Sdp(msg) => write!(f, "description error: {msg}"),
            Self::Ice(msg) => write!(f, "ice error: {msg}"),
            Self::Channel(msg) => write!(f, "data channel error: {msg}"),
            Self::ChannelNotOpen(label) => write!(f, "data channel {label:?} not open"),
            Self::Media(msg) => write!(f, "media error: {msg}"),
            Self::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for RtcError {}

/// Which side of the offer/answer exchange a description is.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offerer's description.
    Offer,
    /// Answerer's description.
    Answer,
}

/// A session description as exchanged through signaling.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// The SDP body, opaque to this crate.
    pub sdp: String,
}

/// One trickle ICE candidate as exchanged through signaling.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line.
    pub candidate: String,
    /// Media-section identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media-section index.
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Offer/answer negotiation state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    /// No outstanding exchange.
    Stable,
    /// We set a local offer and await the answer.
    HaveLocalOffer,
    /// We installed a remote offer and owe an answer.
    HaveRemoteOffer,
    /// The session is closed.
    Closed,
}

/// Overall connection state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// Created, not yet negotiating.
    New,
    /// Negotiating / checking paths.
    Connecting,
    /// Transport established.
    Connected,
    /// Transport lost, may recover.
    Disconnected,
    /// Transport failed permanently.
    Failed,
    /// Closed locally.
    Closed,
}

/// ICE agent state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceState {
    /// Not yet gathering.
    New,
    /// Checking candidate pairs.
    Checking,
    /// A pair succeeded.
    Connected,
    /// All checks finished.
    Completed,
    /// Connectivity lost.
    Disconnected,
    /// No pair works.
    Failed,
    /// Agent shut down.
    Closed,
}

/// Kind of a media track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Audio track.
    Audio,
    /// Video track.
    Video,
}

/// Which media kinds a call wants; the `streamInfo` of the wire protocol.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaIntent {
    /// Request an audio track.
    pub audio: bool,
    /// Request a video track.
    pub video: bool,
}

impl MediaIntent {
    /// Audio-only intent.
    pub fn audio() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Audio + video intent.
    pub fn video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Whether anything is requested at all.
    pub fn wants_any(&self) -> bool {
        self.audio || self.video
    }
}

#[derive(Debug)]
struct TrackShared {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// A live media track handle.
///
/// Clones share state: disabling or stopping any clone affects all of them,
/// which is what lets one local stream feed several calls.
#[derive(Clone, Debug)]
pub struct MediaTrack {
    inner: Arc<TrackShared>,
}

impl MediaTrack {
    /// Create an enabled track with a random id.
    pub fn new(kind: TrackKind) -> Self {
        let mut bytes = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut bytes);
        let id = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self {
            inner: Arc::new(TrackShared {
                id,
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Track identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Audio or video.
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Whether the track currently produces media (unmuted).
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Flip the produce/mute flag. A disabled track still exists on the
    /// wire; it carries silence/black.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Permanently stop the track and release its device.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
    }

    /// Whether the track was stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Relaxed)
    }
}

/// An ordered bundle of tracks from one acquisition.
#[derive(Clone, Debug, Default)]
pub struct MediaStream {
    /// Stream identifier; shared local streams compare by this.
    pub id: String,
    /// The tracks.
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Bundle tracks under a fresh stream id.
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        let mut bytes = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut bytes);
        Self {
            id: bytes.iter().map(|b| format!("{b:02x}")).collect(),
            tracks,
        }
    }

    /// Tracks of one kind.
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Stop every track.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Round-trip/loss/jitter sampled from a session.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SessionStats {
    /// Round-trip time of the succeeded candidate pair, milliseconds.
    pub rtt_ms: Option<f64>,
    /// Inbound packet-loss fraction (0..=1).
    pub packet_loss: Option<f64>,
    /// Inbound jitter, milliseconds.
    pub jitter_ms: Option<f64>,
}

/// Events a session reports to its driver.
pub enum SessionEvent {
    /// A local candidate surfaced; `None` marks the end of trickle.
    IceCandidate(Option<IceCandidate>),
    /// Connection state changed.
    PeerStateChange(PeerState),
    /// ICE agent state changed.
    IceStateChange(IceState),
    /// The remote side created a data channel.
    DataChannel(Arc<dyn DataChannelHandle>),
    /// A remote media track arrived.
    Track(MediaTrack),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::PeerStateChange(s) => f.debug_tuple("PeerStateChange").field(s).finish(),
            Self::IceStateChange(s) => f.debug_tuple("IceStateChange").field(s).finish(),
            Self::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            Self::Track(t) => f.debug_tuple("Track").field(&t.kind()).finish(),
        }
    }
}

/// Events a data channel reports.
#[derive(Debug)]
pub enum DataChannelEvent {
    /// The channel became usable.
    Open,
    /// A message arrived.
    Message(Vec<u8>),
    /// The channel closed.
    Close,
}

/// Configuration for one session.
#[derive(Clone, Debug, Default)]
pub struct RtcSessionConfig {
    /// ICE servers.
    pub ice_servers: Vec<IceServerConfig>,
    /// Candidate gathering policy.
    pub policy: IceTransportPolicy,
}

/// The engine: a session factory.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Create a fresh peer session.
    async fn create_session(&self, config: &RtcSessionConfig)
        -> Result<Arc<dyn RtcSession>, RtcError>;
}

/// One peer (or media sub-) connection.
#[async_trait]
pub trait RtcSession: Send + Sync {
    /// Produce an offer describing the local side.
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;

    /// Produce an answer to the installed remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    /// Install the local description.
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError>;

    /// Install the remote description.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError>;

    /// Feed a remote candidate; `None` is the end-of-trickle marker.
    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), RtcError>;

    /// Create a named data channel. Only the offering side does this; the
    /// answering side receives [`SessionEvent::DataChannel`] events.
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannelHandle>, RtcError>;

    /// Attach a local media track.
    fn add_track(&self, track: MediaTrack) -> Result<(), RtcError>;

    /// Current negotiation state.
    fn signaling_state(&self) -> SignalingState;

    /// Current connection state.
    fn peer_state(&self) -> PeerState;

    /// Current ICE agent state.
    fn ice_state(&self) -> IceState;

    /// Next event, or `None` once the session is defunct.
    async fn next_event(&self) -> Option<SessionEvent>;

    /// Sample connection statistics.
    async fn stats(&self) -> Result<SessionStats, RtcError>;

    /// Close the session. Idempotent.
    fn close(&self);
}

/// One named, reliable, ordered message stream inside a session.
#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    /// Channel label.
    fn label(&self) -> &str;

    /// Whether the channel is open for sending.
    fn is_open(&self) -> bool;

    /// Send one message.
    async fn send(&self, data: &[u8]) -> Result<(), RtcError>;

    /// Next event, or `None` once the channel is defunct.
    async fn next_event(&self) -> Option<DataChannelEvent>;
}

/// Track acquisition boundary (getUserMedia-shaped).
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local tracks matching the intent.
    async fn acquire(&self, intent: MediaIntent) -> Result<MediaStream, RtcError>;
}

/// Media source producing silent/blank tracks; enough for tests and for
/// data-only embeddings.
#[derive(Debug, Default)]
pub struct SyntheticMedia;

#[async_trait]
impl MediaSource for SyntheticMedia {
    async fn acquire(&self, intent: MediaIntent) -> Result<MediaStream, RtcError> {
        if !intent.wants_any() {
            return Err(RtcError::Media("nothing requested".into()));
        }
        let mut tracks = Vec::new();
        if intent.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if intent.video {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        Ok(MediaStream::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_clone_shares_state() {
        let track = MediaTrack::new(TrackKind::Audio);
        let clone = track.clone();

        assert!(track.is_enabled());
        clone.set_enabled(false);
        assert!(!track.is_enabled());

        track.stop();
        assert!(clone.is_stopped());
    }

    #[test]
    fn test_stream_filters_by_kind() {
        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio),
            MediaTrack::new(TrackKind::Video),
            MediaTrack::new(TrackKind::Audio),
        ]);
        assert_eq!(stream.tracks_of(TrackKind::Audio).count(), 2);
        assert_eq!(stream.tracks_of(TrackKind::Video).count(), 1);
    }

    #[tokio::test]
    async fn test_synthetic_media_matches_intent() {
        let source = SyntheticMedia;
        let stream = source.acquire(MediaIntent::audio()).await.expect("acquire");
        assert_eq!(stream.tracks.len(), 1);
        assert_eq!(stream.tracks[0].kind(), TrackKind::Audio);

        let stream = source.acquire(MediaIntent::video()).await.expect("acquire");
        assert_eq!(stream.tracks.len(), 2);

        assert!(source.acquire(MediaIntent::default()).await.is_err());
    }

    #[test]
    fn test_description_wire_shape() {
        let desc = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".to_string(),
        };
        let json = serde_json::to_value(&desc).expect("serialize");
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn test_candidate_wire_shape() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }
}
