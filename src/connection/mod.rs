//! Per-peer connection lifecycle.
//!
//! One state machine per remote peer:
//!
//! ```text
//! idle ──offer-sent──▶ offering ──answer-rx──▶ connecting ──channels-open──▶ connected
//!   ▲                                                                          │
//!   └──────────────────────── disconnect / unload / failed ◀──────────────────┘
//! ```
//!
//! The manager consumes the signal frames it cares about (`connect`,
//! `nameChange`, `unload`, `RTCOffer`, `RTCAnswer`, `RTCIceCandidate`),
//! gates every attempt through the trust engine, provisions the fixed data
//! channel set on the offering side, queues trickle candidates that outrun
//! their description, and owns record creation and destruction — nothing
//! else creates or drops a peer link.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::events::{ClientEvent, EventBus};
use crate::identity;
use crate::keystore::KnownHosts;
use crate::protocol::{ChannelInbound, ChannelKind, ProtocolError};
use crate::rtc::{
    DataChannelEvent, DataChannelHandle, IceCandidate, IceState, PeerState, RtcEngine, RtcSession,
    RtcSessionConfig, SessionEvent, SignalingState,
};
use crate::signal::{
    AnswerPayload, OfferDetail, OfferPayload, SignalFrame, SignalPayload, SignalTransport, UserInfo,
};
use crate::trust::{classify, TrustAction, TrustCategory, TrustMode};

/// Decides connection prompts when the trust engine wants a human.
#[async_trait]
pub trait ConnectGate: Send + Sync {
    /// Should we open (or accept) a connection to `peer`?
    async fn allow_connection(&self, peer: &str, category: TrustCategory) -> bool;

    /// Should we save `peer`'s key after a `ConnectAndPrompt` validation?
    async fn allow_save(&self, peer: &str) -> bool;
}

/// Config-driven gate: answers every prompt with the configured flag.
#[derive(Debug)]
pub struct AutoGate {
    accept: bool,
}

impl AutoGate {
    /// Gate answering `accept` to every connection prompt (key saves are
    /// always allowed).
    pub fn new(accept: bool) -> Arc<Self> {
        Arc::new(Self { accept })
    }
}

#[async_trait]
impl ConnectGate for AutoGate {
    async fn allow_connection(&self, _peer: &str, _category: TrustCategory) -> bool {
        self.accept
    }

    async fn allow_save(&self, _peer: &str) -> bool {
        true
    }
}

/// Link lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkPhase {
    /// We sent an offer, waiting for the answer.
    Offering,
    /// We received an offer and are answering.
    Answering,
    /// Descriptions exchanged, transport still coming up.
    Connecting,
    /// Every channel open, handshake sent.
    Connected,
}

/// Everything we track for one remote peer.
struct PeerLink {
    session: Arc<dyn RtcSession>,
    phase: LinkPhase,
    sent_offer: bool,
    created: Instant,
    user_info: UserInfo,
    channels: HashMap<ChannelKind, Arc<dyn DataChannelHandle>>,
    open_channels: HashSet<ChannelKind>,
    open_notify: Arc<Notify>,
    remote_set: bool,
    announced: bool,
    remote_ready: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerLink {
    fn new(session: Arc<dyn RtcSession>, phase: LinkPhase, user_info: UserInfo) -> Self {
        Self {
            session,
            phase,
            sent_offer: phase == LinkPhase::Offering,
            created: Instant::now(),
            user_info,
            channels: HashMap::new(),
            open_channels: HashSet::new(),
            open_notify: Arc::new(Notify::new()),
            remote_set: false,
            announced: false,
            remote_ready: false,
            tasks: Vec::new(),
        }
    }
}

/// Owner of every peer link.
pub struct ConnectionManager {
    config: RoomConfig,
    session_config: RtcSessionConfig,
    trust_mode: TrustMode,
    bus: Arc<EventBus>,
    transport: Arc<SignalTransport>,
    engine: Arc<dyn RtcEngine>,
    hosts: Arc<KnownHosts>,
    gate: Arc<dyn ConnectGate>,
    self_info: Arc<dyn Fn() -> UserInfo + Send + Sync>,
    links: Mutex<HashMap<String, PeerLink>>,
    pending_ice: Mutex<HashMap<String, Vec<Option<IceCandidate>>>>,
    inbound_tx: mpsc::UnboundedSender<ChannelInbound>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("links", &self.links.lock().expect("links lock poisoned").len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Build the manager. `self_info` supplies the announcement payload for
    /// outgoing offers; `inbound_tx` receives every data-channel message.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RoomConfig,
        bus: Arc<EventBus>,
        transport: Arc<SignalTransport>,
        engine: Arc<dyn RtcEngine>,
        hosts: Arc<KnownHosts>,
        gate: Arc<dyn ConnectGate>,
        self_info: Arc<dyn Fn() -> UserInfo + Send + Sync>,
        inbound_tx: mpsc::UnboundedSender<ChannelInbound>,
    ) -> Arc<Self> {
        let session_config = RtcSessionConfig {
            ice_servers: config.ice_servers.clone(),
            policy: config.ice_transport_policy,
        };
        let trust_mode = TrustMode::parse(&config.trust_mode);
        Arc::new(Self {
            config,
            session_config,
            trust_mode,
            bus,
            transport,
            engine,
            hosts,
            gate,
            self_info,
            links: Mutex::new(HashMap::new()),
            pending_ice: Mutex::new(HashMap::new()),
            inbound_tx,
        })
    }

    /// Feed one signal frame into the state machines.
    pub async fn handle_frame(self: &Arc<Self>, frame: SignalFrame) {
        let sender = frame.sender;
        match frame.payload {
            SignalPayload::Connect(info) => self.on_connect(sender, info).await,
            SignalPayload::RtcOffer(offer) => self.on_offer(sender, offer).await,
            SignalPayload::RtcAnswer(answer) => self.on_answer(sender, answer).await,
            SignalPayload::RtcIceCandidate(candidate) => self.on_ice(sender, candidate).await,
            SignalPayload::NameChange { old_name, new_name } => {
                self.on_name_change(old_name, new_name);
            }
            SignalPayload::Unload(_) => {
                log::info!("[Connect] {sender} unloaded");
                self.teardown(&sender, "peer unloaded").await;
            }
        }
    }

    async fn on_connect(self: &Arc<Self>, sender: String, info: UserInfo) {
        enum Disposition {
            Ignore,
            Replace,
            Fresh,
        }

        let disposition = {
            let mut links = self.links.lock().expect("links lock poisoned");
            match links.get_mut(&sender) {
                Some(link)
                    if link.phase == LinkPhase::Connected
                        && matches!(
                            link.session.ice_state(),
                            IceState::Connected | IceState::Completed
                        ) =>
                {
                    // Healthy: just refresh what they told us.
                    link.user_info = info.clone();
                    Disposition::Ignore
                }
                Some(link)
                    if matches!(
                        link.session.peer_state(),
                        PeerState::Failed | PeerState::Closed
                    ) =>
                {
                    Disposition::Replace
                }
                Some(link)
                    if link.phase != LinkPhase::Connected
                        && link.created.elapsed()
                            > Duration::from_millis(self.config.stale_connection_ms) =>
                {
                    Disposition::Replace
                }
                Some(_) => Disposition::Ignore,
                None => Disposition::Fresh,
            }
        };

        match disposition {
            Disposition::Ignore => return,
            Disposition::Replace => self.teardown(&sender, "stale connection replaced").await,
            Disposition::Fresh => {}
        }

        let Some(_action) = self.trust_decision(&sender, &info).await else {
            return;
        };
        self.open_link(sender, info).await;
    }

    async fn on_offer(self: &Arc<Self>, sender: String, payload: OfferPayload) {
        if payload.offer.target != self.transport.sender() {
            return;
        }

        // Simultaneous-join glare: both sides offered. The greater identity
        // keeps its own offer standing and ignores the incoming one; the
        // smaller side replaces and answers. Without this, both sides
        // replace and neither offer survives.
        let replace_existing = {
            let links = self.links.lock().expect("links lock poisoned");
            match links.get(&sender) {
                Some(link)
                    if link.phase == LinkPhase::Offering
                        && link.sent_offer
                        && self.transport.sender() > sender =>
                {
                    log::debug!("[Connect] glare with {sender}: keeping our offer");
                    return;
                }
                Some(_) => true,
                None => false,
            }
        };

        if replace_existing {
            self.teardown(&sender, "replaced by incoming offer").await;
        }

        let Some(_action) = self.trust_decision(&sender, &payload.user_info).await else {
            return;
        };

        let session = match self.engine.create_session(&self.session_config).await {
            Ok(session) => session,
            Err(e) => {
                log::error!("[Connect] session setup for {sender} failed: {e}");
                return;
            }
        };

        {
            let mut link = PeerLink::new(
                Arc::clone(&session),
                LinkPhase::Answering,
                payload.user_info,
            );
            link.tasks
                .push(self.spawn_session_loop(sender.clone(), Arc::clone(&session)));
            self.links
                .lock()
                .expect("links lock poisoned")
                .insert(sender.clone(), link);
        }

        if let Err(e) = session
            .set_remote_description(payload.offer.local_description)
            .await
        {
            log::warn!("[Connect] offer from {sender} rejected: {e}");
            self.teardown(&sender, "bad offer").await;
            return;
        }
        self.mark_remote_set(&sender);
        self.flush_pending_ice(&sender, &session).await;

        let answer = match session.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("[Connect] answering {sender} failed: {e}");
                self.teardown(&sender, "answer failed").await;
                return;
            }
        };
        if let Err(e) = session.set_local_description(answer.clone()).await {
            log::warn!("[Connect] installing answer for {sender} failed: {e}");
            self.teardown(&sender, "answer failed").await;
            return;
        }

        if let Err(e) = self
            .transport
            .publish(SignalPayload::RtcAnswer(AnswerPayload {
                local_description: answer,
                target: sender.clone(),
            }))
            .await
        {
            log::warn!("[Connect] could not publish answer for {sender}: {e}");
        }

        self.set_phase(&sender, LinkPhase::Connecting);
        log::info!("[Connect] answered offer from {sender}");
    }

    async fn on_answer(self: &Arc<Self>, sender: String, payload: AnswerPayload) {
        if payload.target != self.transport.sender() {
            return;
        }

        let session = {
            let links = self.links.lock().expect("links lock poisoned");
            links.get(&sender).map(|link| Arc::clone(&link.session))
        };
        let Some(session) = session else {
            log::debug!("[Connect] answer from {sender} without a link; dropped");
            return;
        };

        match session.signaling_state() {
            SignalingState::HaveLocalOffer => {}
            SignalingState::Stable => {
                // Benign race: the exchange already completed another way.
                log::debug!("[Connect] late answer from {sender} ignored");
                return;
            }
            other => {
                log::warn!("[Connect] answer from {sender} in {other:?}; dropped");
                return;
            }
        }

        if let Err(e) = session.set_remote_description(payload.local_description).await {
            log::warn!("[Connect] answer from {sender} rejected: {e}");
            return;
        }
        self.mark_remote_set(&sender);
        self.set_phase(&sender, LinkPhase::Connecting);
        self.flush_pending_ice(&sender, &session).await;
    }

    async fn on_ice(self: &Arc<Self>, sender: String, candidate: Option<IceCandidate>) {
        let session = {
            let links = self.links.lock().expect("links lock poisoned");
            links
                .get(&sender)
                .filter(|link| link.remote_set)
                .map(|link| Arc::clone(&link.session))
        };

        match session {
            Some(session) => {
                if let Err(e) = session.add_ice_candidate(candidate).await {
                    log::debug!("[Connect] candidate from {sender} not applied: {e}");
                }
            }
            None => {
                // Queued until the remote description lands; applied once,
                // in arrival order.
                self.pending_ice
                    .lock()
                    .expect("ice lock poisoned")
                    .entry(sender)
                    .or_default()
                    .push(candidate);
            }
        }
    }

    fn on_name_change(self: &Arc<Self>, old_name: String, new_name: String) {
        {
            let mut links = self.links.lock().expect("links lock poisoned");
            if let Some(mut link) = links.remove(&old_name) {
                link.user_info.name = identity::bare_name(&new_name).to_string();
                links.insert(new_name.clone(), link);
            }
        }
        {
            let mut pending = self.pending_ice.lock().expect("ice lock poisoned");
            if let Some(queue) = pending.remove(&old_name) {
                pending.insert(new_name.clone(), queue);
            }
        }
        log::info!("[Connect] {old_name} is now {new_name}");
        self.bus.emit(ClientEvent::NameChange { old_name, new_name });
    }

    /// Run the trust engine for a presented identity. `None` means "do not
    /// connect" (rejected, or the prompt said no).
    async fn trust_decision(&self, sender: &str, info: &UserInfo) -> Option<TrustAction> {
        let bare = identity::bare_name(sender);
        let presented_key = info
            .public_key_string
            .clone()
            .or_else(|| identity::claimed_key(sender).map(str::to_string));

        let category = match presented_key {
            Some(key) => classify(bare, &key, &self.hosts),
            // Unsigned peers carry no key to classify; they are strangers.
            None => TrustCategory::NeverMet,
        };
        let action = self.trust_mode.action(category);
        log::debug!("[Trust] {sender}: {category} -> {action:?}");

        match action {
            TrustAction::Reject => {
                log::info!("[Trust] rejecting {sender} ({category})");
                None
            }
            TrustAction::PromptAndTrust => {
                if self.gate.allow_connection(sender, category).await {
                    Some(action)
                } else {
                    log::info!("[Trust] prompt declined for {sender}");
                    None
                }
            }
            TrustAction::ConnectAndPrompt | TrustAction::ConnectAndTrust => Some(action),
        }
    }

    /// Create the record, provision every channel, send the offer.
    async fn open_link(self: &Arc<Self>, sender: String, user_info: UserInfo) {
        let session = match self.engine.create_session(&self.session_config).await {
            Ok(session) => session,
            Err(e) => {
                log::error!("[Connect] session setup for {sender} failed: {e}");
                return;
            }
        };

        let mut link = PeerLink::new(Arc::clone(&session), LinkPhase::Offering, user_info);

        // The offerer creates the whole fixed channel set, in order, so both
        // sides agree on what "ready" means.
        for kind in ChannelKind::ALL {
            match session.create_data_channel(kind.label()) {
                Ok(channel) => {
                    link.tasks.push(self.spawn_channel_reader(
                        sender.clone(),
                        kind,
                        Arc::clone(&channel),
                    ));
                    link.channels.insert(kind, channel);
                }
                Err(e) => {
                    log::error!("[Connect] channel {} for {sender} failed: {e}", kind.label());
                    session.close();
                    return;
                }
            }
        }
        link.tasks
            .push(self.spawn_session_loop(sender.clone(), Arc::clone(&session)));

        self.links
            .lock()
            .expect("links lock poisoned")
            .insert(sender.clone(), link);

        let offer = match session.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                log::error!("[Connect] offer for {sender} failed: {e}");
                self.teardown(&sender, "offer failed").await;
                return;
            }
        };
        if let Err(e) = session.set_local_description(offer.clone()).await {
            log::error!("[Connect] installing offer for {sender} failed: {e}");
            self.teardown(&sender, "offer failed").await;
            return;
        }

        let result = self
            .transport
            .publish(SignalPayload::RtcOffer(OfferPayload {
                user_info: self.self_info.as_ref()(),
                offer: OfferDetail {
                    local_description: offer,
                    target: sender.clone(),
                },
            }))
            .await;
        if let Err(e) = result {
            log::warn!("[Connect] could not publish offer for {sender}: {e}");
        } else {
            log::info!("[Connect] offered connection to {sender}");
        }
    }

    fn spawn_session_loop(
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
                    SessionEvent::IceCandidate(candidate) => {
                        if let Err(e) = manager
                            .transport
                            .publish(SignalPayload::RtcIceCandidate(candidate))
                            .await
                        {
                            log::debug!("[Connect] candidate publish failed: {e}");
                        }
                    }
                    SessionEvent::PeerStateChange(PeerState::Connected) => {
                        manager.maybe_ready(&peer).await;
                    }
                    SessionEvent::PeerStateChange(
                        PeerState::Disconnected | PeerState::Failed | PeerState::Closed,
                    )
                    | SessionEvent::IceStateChange(
                        IceState::Disconnected | IceState::Failed | IceState::Closed,
                    ) => {
                        manager.teardown(&peer, "transport lost").await;
                        break;
                    }
                    SessionEvent::PeerStateChange(_) | SessionEvent::IceStateChange(_) => {}
                    SessionEvent::DataChannel(channel) => {
                        manager.adopt_channel(&peer, channel).await;
                    }
                    // Media tracks belong to the call sub-connection, never
                    // to the signaling link.
                    SessionEvent::Track(_) => {}
                }
            }
        })
    }

    /// Register a remotely-created channel (answering side).
    async fn adopt_channel(self: &Arc<Self>, peer: &str, channel: Arc<dyn DataChannelHandle>) {
        let Some(kind) = ChannelKind::from_label(channel.label()) else {
            log::warn!("[Connect] unknown channel {:?} from {peer}", channel.label());
            return;
        };

        let adopted = {
            let mut links = self.links.lock().expect("links lock poisoned");
            match links.get_mut(peer) {
                Some(link) => {
                    let reader = self.spawn_channel_reader(
                        peer.to_string(),
                        kind,
                        Arc::clone(&channel),
                    );
                    link.tasks.push(reader);
                    link.channels.insert(kind, Arc::clone(&channel));
                    true
                }
                None => false,
            }
        };

        // Engines may hand the channel over already open, in which case no
        // Open event will follow.
        if adopted && channel.is_open() {
            self.mark_open(peer, kind).await;
        }
    }

    fn spawn_channel_reader(
        self: &Arc<Self>,
        peer: String,
        kind: ChannelKind,
        channel: Arc<dyn DataChannelHandle>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match channel.next_event().await {
                    Some(DataChannelEvent::Open) => manager.mark_open(&peer, kind).await,
                    Some(DataChannelEvent::Message(bytes)) => {
                        let _ = manager.inbound_tx.send(ChannelInbound {
                            peer: peer.clone(),
                            kind,
                            bytes,
                        });
                    }
                    Some(DataChannelEvent::Close) | None => {
                        manager.teardown(&peer, "data channel closed").await;
                        break;
                    }
                }
            }
        })
    }

    async fn mark_open(self: &Arc<Self>, peer: &str, kind: ChannelKind) {
        {
            let mut links = self.links.lock().expect("links lock poisoned");
            let Some(link) = links.get_mut(peer) else {
                return;
            };
            link.open_channels.insert(kind);
            link.open_notify.notify_waiters();
        }
        self.maybe_ready(peer).await;
    }

    /// The connected predicate: every fixed channel open AND the session
    /// reports connected. Fires the readiness handshake and the event,
    /// exactly once.
    async fn maybe_ready(self: &Arc<Self>, peer: &str) {
        let ready = {
            let mut links = self.links.lock().expect("links lock poisoned");
            match links.get_mut(peer) {
                Some(link)
                    if !link.announced
                        && link.open_channels.len() == ChannelKind::ALL.len()
                        && link.session.peer_state() == PeerState::Connected =>
                {
                    link.announced = true;
                    link.phase = LinkPhase::Connected;
                    true
                }
                _ => false,
            }
        };

        if ready {
            if let Err(e) = self
                .send_on(peer, ChannelKind::ConnectedViaRtc, b"null".to_vec())
                .await
            {
                log::warn!("[Connect] readiness handshake to {peer} failed: {e}");
            }
            log::info!("[Connect] connected to {peer}");
            self.bus.emit(ClientEvent::ConnectedToPeer {
                peer: peer.to_string(),
            });
        }
    }

    /// Send bytes on one of `peer`'s channels, waiting (bounded) for the
    /// channel to open.
    ///
    /// # Errors
    ///
    /// `NoSuchPeer` when no link exists, `ChannelOpenTimeout` when the
    /// channel never opens, `ChannelClosed` when the send itself fails.
    pub async fn send_on(
        &self,
        peer: &str,
        kind: ChannelKind,
        bytes: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.channel_open_timeout_ms);

        loop {
            let (channel, notify) = {
                let links = self.links.lock().expect("links lock poisoned");
                let link = links
                    .get(peer)
                    .ok_or_else(|| ProtocolError::NoSuchPeer(peer.to_string()))?;
                (
                    link.channels.get(&kind).cloned(),
                    Arc::clone(&link.open_notify),
                )
            };

            if let Some(channel) = &channel {
                if channel.is_open() {
                    return channel
                        .send(&bytes)
                        .await
                        .map_err(|e| ProtocolError::ChannelClosed(e.to_string()));
                }
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(ProtocolError::ChannelOpenTimeout(kind.label().to_string()));
            };
            if remaining.is_zero() {
                return Err(ProtocolError::ChannelOpenTimeout(kind.label().to_string()));
            }
            let _ = tokio::time::timeout(remaining, notify.notified()).await;
        }
    }

    /// The other side's readiness handshake arrived.
    pub fn mark_remote_ready(&self, peer: &str) {
        let mut links = self.links.lock().expect("links lock poisoned");
        if let Some(link) = links.get_mut(peer) {
            link.remote_ready = true;
        }
    }

    /// Whether the peer's readiness handshake arrived.
    pub fn is_remote_ready(&self, peer: &str) -> bool {
        let links = self.links.lock().expect("links lock poisoned");
        links.get(peer).is_some_and(|link| link.remote_ready)
    }

    fn mark_remote_set(&self, peer: &str) {
        let mut links = self.links.lock().expect("links lock poisoned");
        if let Some(link) = links.get_mut(peer) {
            link.remote_set = true;
        }
    }

    fn set_phase(&self, peer: &str, phase: LinkPhase) {
        let mut links = self.links.lock().expect("links lock poisoned");
        if let Some(link) = links.get_mut(peer) {
            link.phase = phase;
        }
    }

    async fn flush_pending_ice(&self, peer: &str, session: &Arc<dyn RtcSession>) {
        let queued = self
            .pending_ice
            .lock()
            .expect("ice lock poisoned")
            .remove(peer)
            .unwrap_or_default();
        for candidate in queued {
            if let Err(e) = session.add_ice_candidate(candidate).await {
                log::debug!("[Connect] queued candidate for {peer} not applied: {e}");
            }
        }
    }

    /// Destroy `peer`'s record: abort its tasks, close the session, drop
    /// queued candidates, emit the disconnect. Idempotent.
    pub async fn teardown(&self, peer: &str, reason: &str) {
        let link = {
            let mut links = self.links.lock().expect("links lock poisoned");
            links.remove(peer)
        };
        self.pending_ice
            .lock()
            .expect("ice lock poisoned")
            .remove(peer);

        if let Some(link) = link {
            for task in &link.tasks {
                task.abort();
            }
            link.session.close();
            log::info!("[Connect] link to {peer} closed ({reason})");
            self.bus.emit(ClientEvent::DisconnectedFromPeer {
                peer: peer.to_string(),
            });
        }
    }

    /// Tear down every link (shutdown path).
    pub async fn teardown_all(&self) {
        let peers: Vec<String> = {
            let links = self.links.lock().expect("links lock poisoned");
            links.keys().cloned().collect()
        };
        for peer in peers {
            self.teardown(&peer, "client shutdown").await;
        }
    }

    /// Peers whose link reached `connected`.
    pub fn connected_peers(&self) -> Vec<String> {
        let links = self.links.lock().expect("links lock poisoned");
        links
            .iter()
            .filter(|(_, link)| link.phase == LinkPhase::Connected)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Whether any link is connected with healthy ICE. Gates the presence
    /// re-announcements.
    pub fn has_healthy_connection(&self) -> bool {
        let links = self.links.lock().expect("links lock poisoned");
        links.values().any(|link| {
            link.phase == LinkPhase::Connected
                && matches!(
                    link.session.ice_state(),
                    IceState::Connected | IceState::Completed
                )
        })
    }

    /// Last announced user info for a peer.
    pub fn user_info(&self, peer: &str) -> Option<UserInfo> {
        let links = self.links.lock().expect("links lock poisoned");
        links.get(peer).map(|link| link.user_info.clone())
    }
}
