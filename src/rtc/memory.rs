//! In-process RTC engine.
//!
//! `MemoryRtc` implements the engine boundary without any networking: two
//! sessions become linked once each has installed the other's description
//! (the same offer/answer dance real engines require), after which data
//! channels created on one side are mirrored to the other, messages flow
//! between the mirrored pairs, and added tracks surface as remote `Track`
//! events. Synthetic trickle candidates are emitted after every local
//! description so the pending-candidate paths of the connection manager are
//! exercised for real.
//!
//! Every client participating in a test or demo must share one `MemoryRtc`
//! instance — it plays the role of the network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{
    DataChannelEvent, DataChannelHandle, IceCandidate, IceState, MediaTrack, PeerState, RtcEngine,
    RtcError, RtcSession, RtcSessionConfig, SdpKind, SessionDescription, SessionEvent,
    SessionStats, SignalingState, TrackKind,
};

/// Engine-wide registry; the "network" the sessions meet in.
#[derive(Default)]
struct RouterState {
    next_id: u64,
    sessions: HashMap<u64, Registered>,
}

struct Registered {
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<Mutex<SessState>>,
}

struct SessState {
    signaling: SignalingState,
    peer: PeerState,
    ice: IceState,
    local_set: bool,
    remote_id: Option<u64>,
    linked_to: Option<u64>,
    channels: Vec<Arc<MemoryChannel>>,
    pending_tracks: Vec<MediaTrack>,
    closed: bool,
}

impl SessState {
    fn new() -> Self {
        Self {
            signaling: SignalingState::Stable,
            peer: PeerState::New,
            ice: IceState::New,
            local_set: false,
            remote_id: None,
            linked_to: None,
            channels: Vec::new(),
            pending_tracks: Vec::new(),
            closed: false,
        }
    }
}

/// The in-process engine. Cheap to clone via `Arc`; see module docs.
#[derive(Default)]
pub struct MemoryRtc {
    router: Arc<Mutex<RouterState>>,
}

impl std::fmt::Debug for MemoryRtc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRtc")
            .field(
                "sessions",
                &self.router.lock().expect("router lock poisoned").sessions.len(),
            )
            .finish()
    }
}

impl MemoryRtc {
    /// Create an engine (one per simulated network).
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RtcEngine for MemoryRtc {
    async fn create_session(
        &self,
        _config: &RtcSessionConfig,
    ) -> Result<Arc<dyn RtcSession>, RtcError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SessState::new()));

        let id = {
            let mut router = self.router.lock().expect("router lock poisoned");
            let id = router.next_id;
            router.next_id += 1;
            router.sessions.insert(
                id,
                Registered {
                    event_tx: event_tx.clone(),
                    state: Arc::clone(&state),
                },
            );
            id
        };

        let session = Arc::new(MemorySession {
            id,
            router: Arc::clone(&self.router),
            state,
            event_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
        });
        Ok(session as Arc<dyn RtcSession>)
    }
}

/// One side of a (future) linked pair.
pub struct MemorySession {
    id: u64,
    router: Arc<Mutex<RouterState>>,
    state: Arc<Mutex<SessState>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession").field("id", &self.id).finish()
    }
}

/// Session ids travel inside the SDP body.
fn sdp_for(id: u64, kind: SdpKind) -> String {
    let role = match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    };
    format!("v=0\r\no=- mem={id} {role}\r\nm=application 9 memory\r\n")
}

fn parse_sdp_id(sdp: &str) -> Option<u64> {
    let start = sdp.find("mem=")? + 4;
    let rest = &sdp[start..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

impl MemorySession {
    /// Link `a` and `b` if both have installed each other's descriptions.
    fn try_link(router: &Arc<Mutex<RouterState>>, a_id: u64) {
        let router_guard = router.lock().expect("router lock poisoned");

        let Some(a) = router_guard.sessions.get(&a_id) else {
            return;
        };
        let b_id = {
            let a_state = a.state.lock().expect("session lock poisoned");
            match a_state.remote_id {
                Some(id) if a_state.local_set && !a_state.closed => id,
                _ => return,
            }
        };
        let Some(b) = router_guard.sessions.get(&b_id) else {
            return;
        };

        // Lock both states in id order; verify the handshake is mutual.
        let (lo, hi) = if a_id < b_id { (a, b) } else { (b, a) };
        let lo_state = lo.state.lock().expect("session lock poisoned");
        let hi_state = hi.state.lock().expect("session lock poisoned");
        let (mut a_state, mut b_state) = if a_id < b_id {
            (lo_state, hi_state)
        } else {
            (hi_state, lo_state)
        };

        let mutual = b_state.local_set
            && !b_state.closed
            && b_state.remote_id == Some(a_id)
            && a_state.linked_to.is_none()
            && b_state.linked_to.is_none();
        if !mutual {
            return;
        }

        a_state.linked_to = Some(b_id);
        b_state.linked_to = Some(a_id);
        for state in [&mut a_state, &mut b_state] {
            state.signaling = SignalingState::Stable;
            state.ice = IceState::Connected;
            state.peer = PeerState::Connected;
        }

        for tx in [&a.event_tx, &b.event_tx] {
            let _ = tx.send(SessionEvent::IceStateChange(IceState::Connected));
            let _ = tx.send(SessionEvent::PeerStateChange(PeerState::Connected));
        }

        // Mirror channels created before the link, in creation order.
        for ch in a_state.channels.clone() {
            let mirror = MemoryChannel::mirror_of(&ch);
            b_state.channels.push(Arc::clone(&mirror));
            let _ = b.event_tx.send(SessionEvent::DataChannel(mirror));
        }
        for ch in b_state.channels.clone() {
            // Skip the mirrors just created for the other side.
            if ch.partner_set() {
                continue;
            }
            let mirror = MemoryChannel::mirror_of(&ch);
            a_state.channels.push(Arc::clone(&mirror));
            let _ = a.event_tx.send(SessionEvent::DataChannel(mirror));
        }

        // Flush tracks queued before the link.
        for track in a_state.pending_tracks.drain(..) {
            let _ = b.event_tx.send(SessionEvent::Track(MediaTrack::new(track.kind())));
        }
        for track in b_state.pending_tracks.drain(..) {
            let _ = a.event_tx.send(SessionEvent::Track(MediaTrack::new(track.kind())));
        }
    }

    fn emit_trickle(&self) {
        let candidate = IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 9 typ host", self.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let _ = self.event_tx.send(SessionEvent::IceCandidate(Some(candidate)));
        let _ = self.event_tx.send(SessionEvent::IceCandidate(None));
    }
}

#[async_trait]
impl RtcSession for MemorySession {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        if self.state.lock().expect("session lock poisoned").closed {
            return Err(RtcError::Closed);
        }
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: sdp_for(self.id, SdpKind::Offer),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let state = self.state.lock().expect("session lock poisoned");
        if state.closed {
            return Err(RtcError::Closed);
        }
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(RtcError::Sdp("no remote offer to answer".into()));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: sdp_for(self.id, SdpKind::Answer),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        {
            let mut state = self.state.lock().expect("session lock poisoned");
            if state.closed {
                return Err(RtcError::Closed);
            }
            state.local_set = true;
            state.signaling = match desc.kind {
                SdpKind::Offer => SignalingState::HaveLocalOffer,
                SdpKind::Answer => SignalingState::Stable,
            };
            if state.ice == IceState::New {
                state.ice = IceState::Checking;
            }
            if state.peer == PeerState::New {
                state.peer = PeerState::Connecting;
            }
        }
        self.emit_trickle();
        Self::try_link(&self.router, self.id);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        let remote_id = parse_sdp_id(&desc.sdp)
            .ok_or_else(|| RtcError::Sdp("unrecognized description".into()))?;
        {
            let mut state = self.state.lock().expect("session lock poisoned");
            if state.closed {
                return Err(RtcError::Closed);
            }
            state.remote_id = Some(remote_id);
            state.signaling = match desc.kind {
                SdpKind::Offer => SignalingState::HaveRemoteOffer,
                SdpKind::Answer => SignalingState::Stable,
            };
        }
        Self::try_link(&self.router, self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: Option<IceCandidate>) -> Result<(), RtcError> {
        let state = self.state.lock().expect("session lock poisoned");
        if state.closed {
            return Err(RtcError::Closed);
        }
        if state.remote_id.is_none() {
            return Err(RtcError::Ice("no remote description".into()));
        }
        Ok(())
    }

    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannelHandle>, RtcError> {
        let channel = MemoryChannel::new(label);
        let linked_to = {
            let mut state = self.state.lock().expect("session lock poisoned");
            if state.closed {
                return Err(RtcError::Closed);
            }
            state.channels.push(Arc::clone(&channel));
            state.linked_to
        };

        // Created after the link: mirror right away.
        if let Some(partner_id) = linked_to {
            let router = self.router.lock().expect("router lock poisoned");
            if let Some(partner) = router.sessions.get(&partner_id) {
                let mirror = MemoryChannel::mirror_of(&channel);
                partner
                    .state
                    .lock()
                    .expect("session lock poisoned")
                    .channels
                    .push(Arc::clone(&mirror));
                let _ = partner.event_tx.send(SessionEvent::DataChannel(mirror));
            }
        }

        Ok(channel as Arc<dyn DataChannelHandle>)
    }

    fn add_track(&self, track: MediaTrack) -> Result<(), RtcError> {
        let linked_to = {
            let mut state = self.state.lock().expect("session lock poisoned");
            if state.closed {
                return Err(RtcError::Closed);
            }
            match state.linked_to {
                Some(id) => Some(id),
                None => {
                    state.pending_tracks.push(track.clone());
                    None
                }
            }
        };

        if let Some(partner_id) = linked_to {
            let router = self.router.lock().expect("router lock poisoned");
            if let Some(partner) = router.sessions.get(&partner_id) {
                let _ = partner
                    .event_tx
                    .send(SessionEvent::Track(MediaTrack::new(track.kind())));
            }
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().expect("session lock poisoned").signaling
    }

    fn peer_state(&self) -> PeerState {
        self.state.lock().expect("session lock poisoned").peer
    }

    fn ice_state(&self) -> IceState {
        self.state.lock().expect("session lock poisoned").ice
    }

    async fn next_event(&self) -> Option<SessionEvent> {
        self.event_rx.lock().await.recv().await
    }

    async fn stats(&self) -> Result<SessionStats, RtcError> {
        let state = self.state.lock().expect("session lock poisoned");
        if state.closed {
            return Err(RtcError::Closed);
        }
        if state.linked_to.is_some() {
            Ok(SessionStats {
                rtt_ms: Some(12.0),
                packet_loss: Some(0.0),
                jitter_ms: Some(1.5),
            })
        } else {
            Ok(SessionStats::default())
        }
    }

    fn close(&self) {
        let router = self.router.lock().expect("router lock poisoned");

        let partner_id = {
            let mut state = self.state.lock().expect("session lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            state.signaling = SignalingState::Closed;
            state.peer = PeerState::Closed;
            state.ice = IceState::Closed;
            for channel in &state.channels {
                channel.shut();
            }
            state.linked_to.take()
        };

        let _ = self.event_tx.send(SessionEvent::IceStateChange(IceState::Closed));
        let _ = self.event_tx.send(SessionEvent::PeerStateChange(PeerState::Closed));

        // The other side observes a disconnect, not a close.
        if let Some(partner_id) = partner_id {
            if let Some(partner) = router.sessions.get(&partner_id) {
                {
                    let mut state = partner.state.lock().expect("session lock poisoned");
                    if state.closed {
                        return;
                    }
                    state.linked_to = None;
                    state.ice = IceState::Disconnected;
                    state.peer = PeerState::Disconnected;
                    for channel in &state.channels {
                        channel.shut();
                    }
                }
                let _ = partner
                    .event_tx
                    .send(SessionEvent::IceStateChange(IceState::Disconnected));
                let _ = partner
                    .event_tx
                    .send(SessionEvent::PeerStateChange(PeerState::Disconnected));
            }
        }
    }
}

/// One half of a mirrored data-channel pair.
pub struct MemoryChannel {
    label: String,
    open: AtomicBool,
    partner: Mutex<Option<mpsc::UnboundedSender<DataChannelEvent>>>,
    event_tx: mpsc::UnboundedSender<DataChannelEvent>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DataChannelEvent>>,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MemoryChannel {
    fn new(label: &str) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            partner: Mutex::new(None),
            event_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
        })
    }

    /// Create the remote counterpart of `channel` and open both halves.
    fn mirror_of(channel: &Arc<Self>) -> Arc<Self> {
        let mirror = Self::new(&channel.label);
        *mirror.partner.lock().expect("channel lock poisoned") =
            Some(channel.event_tx.clone());
        *channel.partner.lock().expect("channel lock poisoned") =
            Some(mirror.event_tx.clone());
        channel.open.store(true, Ordering::Release);
        mirror.open.store(true, Ordering::Release);
        let _ = channel.event_tx.send(DataChannelEvent::Open);
        let _ = mirror.event_tx.send(DataChannelEvent::Open);
        mirror
    }

    fn partner_set(&self) -> bool {
        self.partner.lock().expect("channel lock poisoned").is_some()
    }

    fn shut(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.event_tx.send(DataChannelEvent::Close);
        }
    }
}

#[async_trait]
impl DataChannelHandle for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, data: &[u8]) -> Result<(), RtcError> {
        if !self.is_open() {
            return Err(RtcError::ChannelNotOpen(self.label.clone()));
        }
        let partner = self.partner.lock().expect("channel lock poisoned").clone();
        match partner {
            Some(tx) => tx
                .send(DataChannelEvent::Message(data.to_vec()))
                .map_err(|_| RtcError::ChannelNotOpen(self.label.clone())),
            None => Err(RtcError::ChannelNotOpen(self.label.clone())),
        }
    }

    async fn next_event(&self) -> Option<DataChannelEvent> {
        self.event_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn linked_pair() -> (Arc<dyn RtcSession>, Arc<dyn RtcSession>) {
        let engine = MemoryRtc::new();
        let config = RtcSessionConfig::default();
        let a = engine.create_session(&config).await.expect("session a");
        let b = engine.create_session(&config).await.expect("session b");

        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(offer.clone()).await.expect("a local");
        b.set_remote_description(offer).await.expect("b remote");
        let answer = b.create_answer().await.expect("answer");
        b.set_local_description(answer.clone()).await.expect("b local");
        a.set_remote_description(answer).await.expect("a remote");

        (a, b)
    }

    async fn next_channel(session: &Arc<dyn RtcSession>) -> Arc<dyn DataChannelHandle> {
        loop {
            match session.next_event().await.expect("event") {
                SessionEvent::DataChannel(dc) => return dc,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_offer_answer_links_sessions() {
        let (a, b) = linked_pair().await;
        assert_eq!(a.peer_state(), PeerState::Connected);
        assert_eq!(b.peer_state(), PeerState::Connected);
        assert_eq!(a.ice_state(), IceState::Connected);
        assert_eq!(a.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_channels_mirror_and_carry_messages() {
        let engine = MemoryRtc::new();
        let config = RtcSessionConfig::default();
        let a = engine.create_session(&config).await.expect("session a");
        let b = engine.create_session(&config).await.expect("session b");

        let chat_a = a.create_data_channel("chat").expect("channel");

        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(offer.clone()).await.expect("a local");
        b.set_remote_description(offer).await.expect("b remote");
        let answer = b.create_answer().await.expect("answer");
        b.set_local_description(answer.clone()).await.expect("b local");
        a.set_remote_description(answer).await.expect("a remote");

        let chat_b = next_channel(&b).await;
        assert_eq!(chat_b.label(), "chat");
        assert!(chat_a.is_open());

        chat_a.send(b"hello").await.expect("send");
        loop {
            match chat_b.next_event().await.expect("event") {
                DataChannelEvent::Message(data) => {
                    assert_eq!(data, b"hello");
                    break;
                }
                DataChannelEvent::Open => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_before_link_fails() {
        let engine = MemoryRtc::new();
        let config = RtcSessionConfig::default();
        let a = engine.create_session(&config).await.expect("session");
        let ch = a.create_data_channel("chat").expect("channel");
        assert!(!ch.is_open());
        assert!(matches!(
            ch.send(b"early").await,
            Err(RtcError::ChannelNotOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_tracks_surface_remotely() {
        let (a, b) = linked_pair().await;
        a.add_track(MediaTrack::new(TrackKind::Audio))
            .expect("add track");

        loop {
            match b.next_event().await.expect("event") {
                SessionEvent::Track(track) => {
                    assert_eq!(track.kind(), TrackKind::Audio);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_close_disconnects_partner() {
        let (a, b) = linked_pair().await;
        a.close();

        loop {
            match b.next_event().await.expect("event") {
                SessionEvent::PeerStateChange(PeerState::Disconnected) => break,
                _ => continue,
            }
        }
        assert_eq!(b.peer_state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let engine = MemoryRtc::new();
        let session = engine
            .create_session(&RtcSessionConfig::default())
            .await
            .expect("session");
        assert!(session.add_ice_candidate(None).await.is_err());
    }

    #[tokio::test]
    async fn test_trickle_emitted_after_local_description() {
        let engine = MemoryRtc::new();
        let session = engine
            .create_session(&RtcSessionConfig::default())
            .await
            .expect("session");
        let offer = session.create_offer().await.expect("offer");
        session.set_local_description(offer).await.expect("local");

        match session.next_event().await.expect("event") {
            SessionEvent::IceCandidate(Some(_)) => {}
            other => panic!("expected candidate, got {other:?}"),
        }
        match session.next_event().await.expect("event") {
            SessionEvent::IceCandidate(None) => {}
            other => panic!("expected end marker, got {other:?}"),
        }
    }
}
