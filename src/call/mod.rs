//! Calls: the media sub-protocol and the per-peer call state machine.
//!
//! A call rides a second peer session negotiated entirely over the data
//! channels (`streamoffer`, `streamanswer`, `streamice`, `endcall`) of an
//! established connection. Per peer the state is `inactive → pending →
//! active`: pending calls ring and carry a deadline, track arrival flips
//! them active, and either side's `endcall` (or a timeout, or the carrier
//! connection dying) resets the slot so a later call can start fresh.
//!
//! The manager also owns call-wide policy: the mute flags applied across
//! every active local stream, and the metrics poller that samples
//! rtt/loss/jitter from each active media session.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::events::{ClientEvent, EventBus};
use crate::protocol::{
    CallControl, ProtocolError, ProtocolRouter, StreamAnswerPayload, StreamOfferPayload,
};
use crate::rtc::{
    IceCandidate, MediaIntent, MediaSource, MediaStream, MediaTrack, PeerState, RtcEngine,
    RtcSession, RtcSessionConfig, SessionEvent, SignalingState, TrackKind,
};

/// Errors surfaced by call operations.
#[derive(Debug)]
pub enum CallError {
    /// A call with that peer already exists.
    Busy(String),
    /// No call with that peer exists.
    NoCall(String),
    /// Track acquisition failed.
    Media(String),
    /// Media session negotiation failed.
    Rtc(String),
    /// The control message could not be sent.
    Protocol(ProtocolError),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy(peer) => write!(f, "call with {peer} already in progress"),
            Self::NoCall(peer) => write!(f, "no call with {peer}"),
            Self::Media(msg) => write!(f, "media acquisition failed: {msg}"),
            Self::Rtc(msg) => write!(f, "media negotiation failed: {msg}"),
            Self::Protocol(e) => write!(f, "call signaling failed: {e}"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<ProtocolError> for CallError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Sampled call quality numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CallMetrics {
    /// Round-trip time, milliseconds.
    pub rtt_ms: Option<f64>,
    /// Packet-loss fraction.
    pub packet_loss: Option<f64>,
    /// Jitter, milliseconds.
    pub jitter_ms: Option<f64>,
}

/// Discrete per-peer call state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPhase {
    /// No call.
    Inactive,
    /// Ringing (either direction), deadline armed.
    Pending,
    /// Tracks flowing.
    Active,
}

/// Who initiated the pending call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallDirection {
    Incoming,
    Outgoing,
}

/// Application decision for incoming calls.
#[async_trait]
pub trait CallResponder: Send + Sync {
    /// Accept (`true`) or decline (`false`) an incoming call.
    async fn incoming_call(&self, peer: &str, intent: MediaIntent) -> bool;
}

/// Responder accepting everything (tests, kiosks).
#[derive(Debug, Default)]
pub struct AcceptAllCalls;

#[async_trait]
impl CallResponder for AcceptAllCalls {
    async fn incoming_call(&self, _peer: &str, _intent: MediaIntent) -> bool {
        true
    }
}

/// Responder declining everything; the default.
#[derive(Debug, Default)]
pub struct DeclineAllCalls;

#[async_trait]
impl CallResponder for DeclineAllCalls {
    async fn incoming_call(&self, _peer: &str, _intent: MediaIntent) -> bool {
        false
    }
}

/// Ring-tone hooks; the sound itself is the application's business.
pub trait Ringer: Send + Sync {
    /// An incoming call started ringing.
    fn start(&self, peer: &str);
    /// Ringing stopped (answer, timeout, cancel).
    fn stop(&self, peer: &str);
}

/// No-op ringer.
#[derive(Debug, Default)]
pub struct SilentRinger;

impl Ringer for SilentRinger {
    fn start(&self, _peer: &str) {}
    fn stop(&self, _peer: &str) {}
}

struct MediaLink {
    session: Arc<dyn RtcSession>,
    task: JoinHandle<()>,
}

struct CallSlot {
    direction: CallDirection,
    intent: MediaIntent,
    media: Option<MediaLink>,
    local_stream: Option<MediaStream>,
    remote_tracks: Vec<MediaTrack>,
    active: bool,
    timeout_task: Option<JoinHandle<()>>,
    metrics: CallMetrics,
}

impl CallSlot {
    fn pending(direction: CallDirection, intent: MediaIntent) -> Self {
        Self {
            direction,
            intent,
            media: None,
            local_stream: None,
            remote_tracks: Vec::new(),
            active: false,
            timeout_task: None,
            metrics: CallMetrics::default(),
        }
    }
}

/// Owner of every call slot.
pub struct CallManager {
    config: RoomConfig,
    session_config: RtcSessionConfig,
    bus: Arc<EventBus>,
    router: Arc<ProtocolRouter>,
    engine: Arc<dyn RtcEngine>,
    media_source: Arc<dyn MediaSource>,
    responder: Arc<dyn CallResponder>,
    ringer: Arc<dyn Ringer>,
    slots: Mutex<HashMap<String, CallSlot>>,
    pending_stream_ice: Mutex<HashMap<String, Vec<IceCandidate>>>,
    mic_muted: AtomicBool,
    video_muted: AtomicBool,
    speakers_muted: AtomicBool,
    stats_running: AtomicBool,
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("slots", &self.slots.lock().expect("slots lock poisoned").len())
            .finish_non_exhaustive()
    }
}

impl CallManager {
    /// Build the manager.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RoomConfig,
        bus: Arc<EventBus>,
        router: Arc<ProtocolRouter>,
        engine: Arc<dyn RtcEngine>,
        media_source: Arc<dyn MediaSource>,
        responder: Arc<dyn CallResponder>,
        ringer: Arc<dyn Ringer>,
    ) -> Arc<Self> {
        let session_config = RtcSessionConfig {
            ice_servers: config.ice_servers.clone(),
            policy: config.ice_transport_policy,
        };
        Arc::new(Self {
            config,
            session_config,
            bus,
            router,
            engine,
            media_source,
            responder,
            ringer,
            slots: Mutex::new(HashMap::new()),
            pending_stream_ice: Mutex::new(HashMap::new()),
            mic_muted: AtomicBool::new(false),
            video_muted: AtomicBool::new(false),
            speakers_muted: AtomicBool::new(false),
            stats_running: AtomicBool::new(false),
        })
    }

    /// Start the control loop over the router's call-control queue and the
    /// bus watcher that ends calls when their carrier connection dies.
    pub fn start(
        self: &Arc<Self>,
        mut control_rx: mpsc::UnboundedReceiver<(String, CallControl)>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let watcher = Arc::clone(self);

        tokio::spawn(async move {
            let mut events = watcher.bus.subscribe();
            loop {
                match events.recv().await {
                    Ok(ClientEvent::DisconnectedFromPeer { peer }) => {
                        watcher.on_peer_lost(&peer);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Call] event stream lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tokio::spawn(async move {
            while let Some((peer, control)) = control_rx.recv().await {
                match control {
                    CallControl::Offer(offer) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            manager.handle_offer(peer, offer).await;
                        });
                    }
                    CallControl::Answer(answer) => manager.handle_answer(&peer, answer).await,
                    CallControl::Ice(candidate) => manager.handle_ice(&peer, candidate).await,
                    CallControl::End => manager.handle_end(&peer),
                }
            }
        })
    }

    /// Current call phase for a peer.
    pub fn phase(&self, peer: &str) -> CallPhase {
        let slots = self.slots.lock().expect("slots lock poisoned");
        match slots.get(peer) {
            None => CallPhase::Inactive,
            Some(slot) if slot.active => CallPhase::Active,
            Some(_) => CallPhase::Pending,
        }
    }

    /// Latest sampled metrics for a peer.
    pub fn metrics(&self, peer: &str) -> Option<CallMetrics> {
        let slots = self.slots.lock().expect("slots lock poisoned");
        slots.get(peer).filter(|s| s.active).map(|s| s.metrics)
    }

    /// Place a call.
    ///
    /// # Errors
    ///
    /// `Busy` when a call with the peer exists, `Media`/`Rtc`/`Protocol`
    /// when acquisition or negotiation fails.
    pub async fn start_call(
        self: &Arc<Self>,
        peer: &str,
        intent: MediaIntent,
    ) -> Result<(), CallError> {
        {
            let mut slots = self.slots.lock().expect("slots lock poisoned");
            if slots.contains_key(peer) {
                return Err(CallError::Busy(peer.to_string()));
            }
            slots.insert(
                peer.to_string(),
                CallSlot::pending(CallDirection::Outgoing, intent),
            );
        }

        match self.negotiate_outgoing(peer, intent).await {
            Ok(()) => {
                self.arm_timeout(peer);
                self.bus.emit(ClientEvent::CallStarted {
                    peer: peer.to_string(),
                    intent,
                });
                Ok(())
            }
            Err(e) => {
                self.drop_slot(peer);
                self.bus.emit(ClientEvent::CallError {
                    peer: peer.to_string(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn negotiate_outgoing(
        self: &Arc<Self>,
        peer: &str,
        intent: MediaIntent,
    ) -> Result<(), CallError> {
        let stream = self
            .media_source
            .acquire(intent)
            .await
            .map_err(|e| CallError::Media(e.to_string()))?;
        self.apply_mute_flags(&stream);

        let session = self
            .engine
            .create_session(&self.session_config)
            .await
            .map_err(|e| CallError::Rtc(e.to_string()))?;

        for track in &stream.tracks {
            session
                .add_track(track.clone())
                .map_err(|e| CallError::Rtc(e.to_string()))?;
        }

        self.install_media(peer, Arc::clone(&session), stream);

        let offer = session
            .create_offer()
            .await
            .map_err(|e| CallError::Rtc(e.to_string()))?;
        session
            .set_local_description(offer.clone())
            .await
            .map_err(|e| CallError::Rtc(e.to_string()))?;

        self.router
            .send_call(
                peer,
                &CallControl::Offer(StreamOfferPayload {
                    offer,
                    stream_info: intent,
                }),
            )
            .await?;
        Ok(())
    }

    async fn handle_offer(self: Arc<Self>, peer: String, payload: StreamOfferPayload) {
        let intent = payload.stream_info;
        {
            let mut slots = self.slots.lock().expect("slots lock poisoned");
            if slots.contains_key(&peer) {
                log::warn!("[Call] offer from {peer} while a call exists; ignored");
                return;
            }
            slots.insert(
                peer.clone(),
                CallSlot::pending(CallDirection::Incoming, intent),
            );
        }

        self.arm_timeout(&peer);
        self.ringer.start(&peer);
        self.bus.emit(ClientEvent::IncomingCall {
            peer: peer.clone(),
            intent,
        });

        let accepted = self.responder.incoming_call(&peer, intent).await;

        // The deadline may have fired while the application decided.
        if !self
            .slots
            .lock()
            .expect("slots lock poisoned")
            .contains_key(&peer)
        {
            return;
        }

        if !accepted {
            let _ = self.router.send_call(&peer, &CallControl::End).await;
            self.drop_slot(&peer);
            self.ringer.stop(&peer);
            self.bus.emit(ClientEvent::CallRejected { peer });
            return;
        }

        match self.answer_offer(&peer, payload).await {
            Ok(()) => {
                self.ringer.stop(&peer);
                self.bus.emit(ClientEvent::CallStarted { peer, intent });
            }
            Err(e) => {
                let _ = self.router.send_call(&peer, &CallControl::End).await;
                self.drop_slot(&peer);
                self.ringer.stop(&peer);
                self.bus.emit(ClientEvent::CallError {
                    peer,
                    message: e.to_string(),
                });
            }
        }
    }

    async fn answer_offer(
        self: &Arc<Self>,
        peer: &str,
        payload: StreamOfferPayload,
    ) -> Result<(), CallError> {
        let stream = self
            .media_source
            .acquire(payload.stream_info)
            .await
            .map_err(|e| CallError::Media(e.to_string()))?;
        self.apply_mute_flags(&stream);

        let session = self
            .engine
            .create_session(&self.session_config)
            .await
            .map_err(|e| CallError::Rtc(e.to_string()))?;

        for track in &stream.tracks {
            session
                .add_track(track.clone())
                .map_err(|e| CallError::Rtc(e.to_string()))?;
        }

        self.install_media(peer, Arc::clone(&session), stream);

        session
            .set_remote_description(payload.offer)
            .await
            .map_err(|e| CallError::Rtc(e.to_string()))?;
        self.flush_stream_ice(peer, &session).await;

        let answer = session
            .create_answer()
            .await
            .map_err(|e| CallError::Rtc(e.to_string()))?;
        session
            .set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::Rtc(e.to_string()))?;

        self.router
            .send_call(peer, &CallControl::Answer(StreamAnswerPayload { answer }))
            .await?;
        Ok(())
    }

    async fn handle_answer(self: &Arc<Self>, peer: &str, payload: StreamAnswerPayload) {
        let session = {
            let slots = self.slots.lock().expect("slots lock poisoned");
            slots
                .get(peer)
                .and_then(|slot| slot.media.as_ref())
                .map(|media| Arc::clone(&media.session))
        };
        let Some(session) = session else {
            log::debug!("[Call] stream answer from {peer} without a media session");
            return;
        };

        // Out-of-order answers are ignored, same as the outer connection.
        if session.signaling_state() != SignalingState::HaveLocalOffer {
            log::debug!("[Call] late stream answer from {peer} ignored");
            return;
        }

        if let Err(e) = session.set_remote_description(payload.answer).await {
            log::warn!("[Call] stream answer from {peer} rejected: {e}");
            return;
        }
        self.flush_stream_ice(peer, &session).await;
    }

    async fn handle_ice(self: &Arc<Self>, peer: &str, candidate: IceCandidate) {
        let session = {
            let slots = self.slots.lock().expect("slots lock poisoned");
            slots
                .get(peer)
                .and_then(|slot| slot.media.as_ref())
                .map(|media| Arc::clone(&media.session))
        };

        match session {
            Some(session) => {
                // A candidate can still outrun the answer; requeue it for
                // the flush that follows the remote description.
                if let Err(e) = session.add_ice_candidate(Some(candidate.clone())).await {
                    log::debug!("[Call] media candidate from {peer} requeued: {e}");
                    self.pending_stream_ice
                        .lock()
                        .expect("stream ice lock poisoned")
                        .entry(peer.to_string())
                        .or_default()
                        .push(candidate);
                }
            }
            // The sub-connection may not exist yet; keep them all, in order.
            None => self
                .pending_stream_ice
                .lock()
                .expect("stream ice lock poisoned")
                .entry(peer.to_string())
                .or_default()
                .push(candidate),
        }
    }

    fn handle_end(self: &Arc<Self>, peer: &str) {
        let Some(slot) = self.take_slot(peer) else {
            return;
        };
        self.ringer.stop(peer);
        let was_active = slot.active;
        let direction = slot.direction;
        self.release_slot(peer, slot);

        let event = if was_active {
            ClientEvent::CallEnded {
                peer: peer.to_string(),
            }
        } else {
            match direction {
                // Our outgoing ring was declined.
                CallDirection::Outgoing => ClientEvent::CallRejected {
                    peer: peer.to_string(),
                },
                // The caller withdrew before we answered.
                CallDirection::Incoming => ClientEvent::CallCancelled {
                    peer: peer.to_string(),
                },
            }
        };
        self.bus.emit(event);
    }

    /// Hang up (or withdraw a pending call).
    ///
    /// # Errors
    ///
    /// `NoCall` when there is nothing to end.
    pub async fn end_call(self: &Arc<Self>, peer: &str) -> Result<(), CallError> {
        let Some(slot) = self.take_slot(peer) else {
            return Err(CallError::NoCall(peer.to_string()));
        };

        let _ = self.router.send_call(peer, &CallControl::End).await;
        self.ringer.stop(peer);
        let was_active = slot.active;
        let direction = slot.direction;
        self.release_slot(peer, slot);

        let event = if was_active {
            ClientEvent::CallEnded {
                peer: peer.to_string(),
            }
        } else {
            match direction {
                CallDirection::Outgoing => ClientEvent::CallCancelled {
                    peer: peer.to_string(),
                },
                CallDirection::Incoming => ClientEvent::CallRejected {
                    peer: peer.to_string(),
                },
            }
        };
        self.bus.emit(event);
        Ok(())
    }

    /// Mute or unmute the microphone across every active local stream.
    pub fn set_mic_muted(&self, muted: bool) {
        self.mic_muted.store(muted, Ordering::Relaxed);
        self.for_each_local_track(TrackKind::Audio, |track| track.set_enabled(!muted));
        self.emit_mute_changed();
    }

    /// Mute or unmute the camera across every active local stream.
    pub fn set_video_muted(&self, muted: bool) {
        self.video_muted.store(muted, Ordering::Relaxed);
        self.for_each_local_track(TrackKind::Video, |track| track.set_enabled(!muted));
        self.emit_mute_changed();
    }

    /// Speakers are a UI concern; only the event is emitted.
    pub fn set_speakers_muted(&self, muted: bool) {
        self.speakers_muted.store(muted, Ordering::Relaxed);
        self.bus.emit(ClientEvent::SpeakersMuteChanged { muted });
    }

    /// Current microphone mute flag.
    pub fn mic_muted(&self) -> bool {
        self.mic_muted.load(Ordering::Relaxed)
    }

    /// Current camera mute flag.
    pub fn video_muted(&self) -> bool {
        self.video_muted.load(Ordering::Relaxed)
    }

    /// Current speakers mute flag.
    pub fn speakers_muted(&self) -> bool {
        self.speakers_muted.load(Ordering::Relaxed)
    }

    fn emit_mute_changed(&self) {
        self.bus.emit(ClientEvent::MuteChanged {
            mic: self.mic_muted.load(Ordering::Relaxed),
            video: self.video_muted.load(Ordering::Relaxed),
        });
    }

    fn for_each_local_track(&self, kind: TrackKind, apply: impl Fn(&MediaTrack)) {
        let slots = self.slots.lock().expect("slots lock poisoned");
        for slot in slots.values() {
            if let Some(stream) = &slot.local_stream {
                for track in stream.tracks_of(kind) {
                    apply(track);
                }
            }
        }
    }

    fn apply_mute_flags(&self, stream: &MediaStream) {
        if self.mic_muted.load(Ordering::Relaxed) {
            for track in stream.tracks_of(TrackKind::Audio) {
                track.set_enabled(false);
            }
        }
        if self.video_muted.load(Ordering::Relaxed) {
            for track in stream.tracks_of(TrackKind::Video) {
                track.set_enabled(false);
            }
        }
    }

    /// Attach a media session + local stream to the slot and spawn its
    /// event loop.
    fn install_media(self: &Arc<Self>, peer: &str, session: Arc<dyn RtcSession>, stream: MediaStream) {
        let task = self.spawn_media_loop(peer.to_string(), Arc::clone(&session));
        let mut slots = self.slots.lock().expect("slots lock poisoned");
        if let Some(slot) = slots.get_mut(peer) {
            slot.media = Some(MediaLink { session, task });
            slot.local_stream = Some(stream);
        } else {
            // Slot vanished (timeout/end) while we were negotiating.
            task.abort();
            session.close();
            stream.stop_all();
        }
    }

    fn spawn_media_loop(
        self: &Arc<Self>,
        peer: String,
        session: Arc<dyn RtcSession>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(event) = session.next_event().await else {
                    break;
                };
                match event {
                    SessionEvent::IceCandidate(Some(candidate)) => {
                        if let Err(e) = manager
                            .router
                            .send_call(&peer, &CallControl::Ice(candidate))
                            .await
                        {
                            log::debug!("[Call] media candidate to {peer} failed: {e}");
                        }
                    }
                    // End-of-trickle has no wire form on the call channels.
                    SessionEvent::IceCandidate(None) => {}
                    SessionEvent::Track(track) => manager.on_remote_track(&peer, track),
                    SessionEvent::PeerStateChange(
                        PeerState::Disconnected | PeerState::Failed | PeerState::Closed,
                    ) => {
                        manager.on_media_lost(&peer);
                        break;
                    }
                    _ => {}
                }
            }
        })
    }

    fn on_remote_track(self: &Arc<Self>, peer: &str, track: MediaTrack) {
        let became_active = {
            let mut slots = self.slots.lock().expect("slots lock poisoned");
            let Some(slot) = slots.get_mut(peer) else {
                return;
            };
            slot.remote_tracks.push(track);
            if slot.active {
                false
            } else {
                slot.active = true;
                if let Some(timeout) = slot.timeout_task.take() {
                    timeout.abort();
                }
                true
            }
        };

        if became_active {
            self.ringer.stop(peer);
            self.ensure_stats_task();
            let intent = {
                let slots = self.slots.lock().expect("slots lock poisoned");
                slots.get(peer).map(|s| s.intent).unwrap_or_default()
            };
            log::info!("[Call] call with {peer} connected");
            self.bus.emit(ClientEvent::CallConnected {
                peer: peer.to_string(),
                intent,
            });
        }
    }

    fn on_media_lost(self: &Arc<Self>, peer: &str) {
        let Some(slot) = self.take_slot(peer) else {
            return;
        };
        self.ringer.stop(peer);
        let was_active = slot.active;
        self.release_slot(peer, slot);

        if was_active {
            self.bus.emit(ClientEvent::CallEnded {
                peer: peer.to_string(),
            });
        } else {
            self.bus.emit(ClientEvent::CallError {
                peer: peer.to_string(),
                message: "media connection lost".to_string(),
            });
        }
    }

    /// The carrier connection died: reject a pending start, resolve an
    /// active call as ended.
    fn on_peer_lost(self: &Arc<Self>, peer: &str) {
        let Some(slot) = self.take_slot(peer) else {
            return;
        };
        self.ringer.stop(peer);
        let was_active = slot.active;
        self.release_slot(peer, slot);

        if was_active {
            self.bus.emit(ClientEvent::CallEnded {
                peer: peer.to_string(),
            });
        } else {
            self.bus.emit(ClientEvent::CallError {
                peer: peer.to_string(),
                message: "peer disconnected".to_string(),
            });
        }
    }

    fn arm_timeout(self: &Arc<Self>, peer: &str) {
        let manager = Arc::clone(self);
        let peer_name = peer.to_string();
        let deadline = Duration::from_millis(self.config.call_timeout_ms);
        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            manager.on_timeout(&peer_name);
        });

        let mut slots = self.slots.lock().expect("slots lock poisoned");
        if let Some(slot) = slots.get_mut(peer) {
            if let Some(previous) = slot.timeout_task.replace(task) {
                previous.abort();
            }
        } else {
            task.abort();
        }
    }

    fn on_timeout(self: &Arc<Self>, peer: &str) {
        let slot = {
            let mut slots = self.slots.lock().expect("slots lock poisoned");
            match slots.get(peer) {
                Some(slot) if !slot.active => slots.remove(peer),
                _ => None,
            }
        };
        let Some(slot) = slot else {
            return;
        };

        log::info!("[Call] call with {peer} timed out");
        self.ringer.stop(peer);
        self.release_slot(peer, slot);
        self.bus.emit(ClientEvent::CallTimeout {
            peer: peer.to_string(),
        });
    }

    fn take_slot(&self, peer: &str) -> Option<CallSlot> {
        self.slots.lock().expect("slots lock poisoned").remove(peer)
    }

    fn drop_slot(self: &Arc<Self>, peer: &str) {
        if let Some(slot) = self.take_slot(peer) {
            self.release_slot(peer, slot);
        }
    }

    /// Close the media session, stop remote tracks, and stop the local
    /// stream unless another call still shares it.
    fn release_slot(&self, peer: &str, slot: CallSlot) {
        if let Some(timeout) = slot.timeout_task {
            timeout.abort();
        }
        if let Some(media) = slot.media {
            media.task.abort();
            media.session.close();
        }
        for track in &slot.remote_tracks {
            track.stop();
        }
        if let Some(stream) = slot.local_stream {
            let shared = {
                let slots = self.slots.lock().expect("slots lock poisoned");
                slots.values().any(|other| {
                    other
                        .local_stream
                        .as_ref()
                        .is_some_and(|s| s.id == stream.id)
                })
            };
            if !shared {
                stream.stop_all();
            }
        }
        self.pending_stream_ice
            .lock()
            .expect("stream ice lock poisoned")
            .remove(peer);
    }

    async fn flush_stream_ice(&self, peer: &str, session: &Arc<dyn RtcSession>) {
        let queued = self
            .pending_stream_ice
            .lock()
            .expect("stream ice lock poisoned")
            .remove(peer)
            .unwrap_or_default();
        for candidate in queued {
            if let Err(e) = session.add_ice_candidate(Some(candidate)).await {
                log::debug!("[Call] queued media candidate for {peer} not applied: {e}");
            }
        }
    }

    /// Lazy metrics poller: runs while at least one call is active.
    fn ensure_stats_task(self: &Arc<Self>) {
        if self.stats_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(manager.config.stats_interval_ms.max(100));
            loop {
                tokio::time::sleep(interval).await;

                let targets: Vec<(String, Arc<dyn RtcSession>)> = {
                    let slots = manager.slots.lock().expect("slots lock poisoned");
                    slots
                        .iter()
                        .filter(|(_, slot)| slot.active)
                        .filter_map(|(peer, slot)| {
                            slot.media
                                .as_ref()
                                .map(|m| (peer.clone(), Arc::clone(&m.session)))
                        })
                        .collect()
                };

                if targets.is_empty() {
                    manager.stats_running.store(false, Ordering::Release);
                    break;
                }

                for (peer, session) in targets {
                    let stats = match session.stats().await {
                        Ok(stats) => stats,
                        Err(e) => {
                            log::debug!("[Call] stats for {peer} unavailable: {e}");
                            continue;
                        }
                    };
                    let metrics = CallMetrics {
                        rtt_ms: stats.rtt_ms,
                        packet_loss: stats.packet_loss,
                        jitter_ms: stats.jitter_ms,
                    };
                    {
                        let mut slots = manager.slots.lock().expect("slots lock poisoned");
                        if let Some(slot) = slots.get_mut(&peer) {
                            slot.metrics = metrics;
                        }
                    }
                    manager.bus.emit(ClientEvent::MetricsUpdated { peer, metrics });
                }
            }
        });
    }
}
