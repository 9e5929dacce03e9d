//! The room client: one instance per joined room.
//!
//! `RoomClient::builder()` collects the configuration and the external
//! collaborators (broker, RTC engine, media source, storage, gates), and
//! `connect()` runs the load routine: identity, known hosts, tab lease,
//! broker connect + room subscription (the only fatal failure), then the
//! full stack wiring. The instance is passed around explicitly — there is
//! no global registration.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::{Broker, WebSocketBroker};
use crate::call::{
    AcceptAllCalls, CallManager, CallMetrics, CallPhase, CallResponder, Ringer, SilentRinger,
};
use crate::chat::{ActiveUser, ChatManager, ChatMessage};
use crate::config::RoomConfig;
use crate::connection::{AutoGate, ConnectGate, ConnectionManager};
use crate::events::{ClientEvent, EventBus, HandlerId};
use crate::identity::{self, SigningIdentity};
use crate::keystore::KnownHosts;
use crate::presence::TabLease;
use crate::protocol::{ProtocolError, ProtocolRouter};
use crate::rtc::{MediaIntent, MediaSource, RtcEngine, SyntheticMedia};
use crate::signal::{SignalPayload, SignalTransport, UserInfo};
use crate::storage::{KvStore, MemoryKv};
use crate::trust::TrustMode;
use crate::validation::Validator;

/// Store key for the persisted display name.
const KV_DISPLAY_NAME: &str = "displayName";

/// Builder for [`RoomClient`].
pub struct RoomClientBuilder {
    config: RoomConfig,
    name: Option<String>,
    kv: Option<Arc<dyn KvStore>>,
    broker: Option<Arc<dyn Broker>>,
    engine: Option<Arc<dyn RtcEngine>>,
    media: Option<Arc<dyn MediaSource>>,
    gate: Option<Arc<dyn ConnectGate>>,
    call_responder: Option<Arc<dyn CallResponder>>,
    ringer: Option<Arc<dyn Ringer>>,
}

impl std::fmt::Debug for RoomClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomClientBuilder")
            .field("room", &self.config.room)
            .field("name", &self.name)
            .field("broker", &self.broker.is_some())
            .field("engine", &self.engine.is_some())
            .finish_non_exhaustive()
    }
}

impl RoomClientBuilder {
    fn new(config: RoomConfig) -> Self {
        Self {
            config,
            name: None,
            kv: None,
            broker: None,
            engine: None,
            media: None,
            gate: None,
            call_responder: None,
            ringer: None,
        }
    }

    /// Display name to join with; defaults to the persisted one, or a
    /// fresh anonymous name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Persistence backend. Defaults to an in-memory store.
    #[must_use]
    pub fn storage(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Broker client. Defaults to a [`WebSocketBroker`] against the
    /// configured broker URL.
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// RTC engine. Defaults to a fresh in-process engine — fine for tests
    /// and demos, but peers then must share that same engine instance.
    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn RtcEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Track acquisition. Defaults to synthetic (silent/blank) tracks.
    #[must_use]
    pub fn media(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Trust prompt gate. Defaults to answering with the configured
    /// `auto_accept_connections` flag.
    #[must_use]
    pub fn connect_gate(mut self, gate: Arc<dyn ConnectGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Incoming-call decision. Defaults to accepting every call.
    #[must_use]
    pub fn call_responder(mut self, responder: Arc<dyn CallResponder>) -> Self {
        self.call_responder = Some(responder);
        self
    }

    /// Ringer hooks. Defaults to silence.
    #[must_use]
    pub fn ringer(mut self, ringer: Arc<dyn Ringer>) -> Self {
        self.ringer = Some(ringer);
        self
    }

    /// Run the load routine and join the room.
    ///
    /// # Errors
    ///
    /// Fails when the broker is unreachable, the room subscription is
    /// refused, or identity material cannot be loaded/created. Everything
    /// else degrades and is reported through events.
    pub async fn connect(self) -> Result<RoomClient> {
        let config = self.config;
        let kv = self
            .kv
            .unwrap_or_else(|| Arc::new(MemoryKv::new()) as Arc<dyn KvStore>);
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(WebSocketBroker::new(&config.broker_url)) as Arc<dyn Broker>);
        let engine = self
            .engine
            .unwrap_or_else(|| crate::rtc::memory::MemoryRtc::new() as Arc<dyn RtcEngine>);
        let media = self
            .media
            .unwrap_or_else(|| Arc::new(SyntheticMedia) as Arc<dyn MediaSource>);
        let gate = self
            .gate
            .unwrap_or_else(|| AutoGate::new(config.auto_accept_connections) as Arc<dyn ConnectGate>);
        let call_responder = self
            .call_responder
            .unwrap_or_else(|| Arc::new(AcceptAllCalls) as Arc<dyn CallResponder>);
        let ringer = self
            .ringer
            .unwrap_or_else(|| Arc::new(SilentRinger) as Arc<dyn Ringer>);

        // Display name: explicit > persisted > anonymous.
        let bare_name = match self.name {
            Some(name) => {
                identity::validate_bare_name(&name)?;
                name
            }
            None => match kv.get(KV_DISPLAY_NAME) {
                Some(name) if identity::validate_bare_name(&name).is_ok() => name,
                _ => identity::anonymous_name(),
            },
        };
        if let Err(e) = kv.set(KV_DISPLAY_NAME, &bare_name) {
            log::warn!("[Client] could not persist display name: {e}");
        }

        let identity = if config.signed {
            Some(Arc::new(
                SigningIdentity::load_or_create(&kv).context("loading signing identity")?,
            ))
        } else {
            None
        };
        let hosts = Arc::new(KnownHosts::load(Arc::clone(&kv)));

        let lease = TabLease::acquire(Arc::clone(&kv), &config.tabs);
        let display_name = identity::with_tab_suffix(&bare_name, lease.id());
        let sender_id = identity::compose_identity(
            &display_name,
            identity
                .as_ref()
                .map(|i| i.public_key_string())
                .as_deref(),
        );

        let bus = EventBus::new();
        let transport = SignalTransport::new(
            Arc::clone(&broker),
            config.topic(),
            sender_id,
            config.compression,
            config.history_cap,
            Arc::clone(&bus),
        );

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let self_info_identity = identity.clone();
        let self_info_name = Arc::new(RwLock::new(display_name.clone()));
        let info_name = Arc::clone(&self_info_name);
        let self_info: Arc<dyn Fn() -> UserInfo + Send + Sync> = Arc::new(move || UserInfo {
            name: info_name.read().expect("name lock poisoned").clone(),
            public_key_string: self_info_identity
                .as_ref()
                .map(|identity| identity.public_key_string()),
            extra: serde_json::Map::new(),
        });

        let manager = ConnectionManager::new(
            config.clone(),
            Arc::clone(&bus),
            Arc::clone(&transport),
            Arc::clone(&engine),
            Arc::clone(&hosts),
            Arc::clone(&gate),
            Arc::clone(&self_info),
            inbound_tx,
        );

        let (router, call_rx) = ProtocolRouter::new(Arc::clone(&manager), Arc::clone(&bus));

        let validator = identity.as_ref().map(|identity| {
            Validator::new(
                Arc::clone(identity),
                Arc::clone(&hosts),
                Arc::clone(&router),
                Arc::clone(&manager),
                Arc::clone(&bus),
                Arc::clone(&gate),
                TrustMode::parse(&config.trust_mode),
            )
        });

        let calls = CallManager::new(
            config.clone(),
            Arc::clone(&bus),
            Arc::clone(&router),
            Arc::clone(&engine),
            media,
            call_responder,
            ringer,
        );

        let chat = ChatManager::new(
            Arc::clone(&bus),
            config.signed,
            config.chat_cap,
            config.palette.clone(),
        );

        // Wire the loops up before touching the network so the initial
        // Connected/Subscribed events are observed.
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let healthy_manager = Arc::clone(&manager);
        tasks.push(transport.start(
            frame_tx,
            Arc::clone(&self_info),
            Arc::new(move || healthy_manager.has_healthy_connection()),
        ));
        {
            let frame_manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                while let Some(frame) = frame_rx.recv().await {
                    frame_manager.handle_frame(frame).await;
                }
            }));
        }
        tasks.push(router.start(inbound_rx));
        tasks.push(calls.start(call_rx));
        tasks.push(chat.start());
        if let Some(validator) = &validator {
            tasks.push(validator.start());
        }

        broker
            .connect()
            .await
            .context("broker unreachable; cannot join the room")?;
        broker
            .subscribe(&config.topic())
            .await
            .context("room subscription refused")?;

        log::info!(
            "[Client] {} joined {} via {}",
            display_name,
            config.topic(),
            config.broker_url
        );

        Ok(RoomClient {
            config,
            bus,
            broker,
            transport,
            manager,
            router,
            validator,
            calls,
            chat,
            identity,
            lease: Mutex::new(lease),
            display_name: self_info_name,
            tasks: Mutex::new(tasks),
        })
    }
}

/// A connected room participant.
pub struct RoomClient {
    config: RoomConfig,
    bus: Arc<EventBus>,
    broker: Arc<dyn Broker>,
    transport: Arc<SignalTransport>,
    manager: Arc<ConnectionManager>,
    router: Arc<ProtocolRouter>,
    validator: Option<Arc<Validator>>,
    calls: Arc<CallManager>,
    chat: Arc<ChatManager>,
    identity: Option<Arc<SigningIdentity>>,
    lease: Mutex<TabLease>,
    display_name: Arc<RwLock<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RoomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomClient")
            .field("room", &self.config.room)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

impl RoomClient {
    /// Start building a client for `config`.
    pub fn builder(config: RoomConfig) -> RoomClientBuilder {
        RoomClientBuilder::new(config)
    }

    /// Current display name (with tab suffix).
    pub fn name(&self) -> String {
        self.display_name.read().expect("name lock poisoned").clone()
    }

    /// Our identity string as peers see it.
    pub fn identity_string(&self) -> String {
        self.transport.sender()
    }

    /// Our public key, in signed mode.
    pub fn public_key_string(&self) -> Option<String> {
        self.identity.as_ref().map(|i| i.public_key_string())
    }

    /// The event bus; register handlers or grab a broadcast receiver.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Convenience: subscribe to the event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ClientEvent> {
        self.bus.subscribe()
    }

    /// Convenience: register a callback handler.
    pub fn on(&self, handler: impl Fn(&ClientEvent) + Send + Sync + 'static) -> HandlerId {
        self.bus.on(handler)
    }

    /// Peers with a fully open connection.
    pub fn connected_peers(&self) -> Vec<String> {
        self.manager.connected_peers()
    }

    /// Peers that proved key possession this session (empty in unsigned
    /// mode).
    pub fn validated_peers(&self) -> Vec<String> {
        self.validator
            .as_ref()
            .map(|v| v.validated_peers())
            .unwrap_or_default()
    }

    /// Broadcast chat text to every connected peer.
    ///
    /// # Errors
    ///
    /// Returns the last send failure, if any peer could not be reached.
    pub async fn send_chat(&self, text: &str) -> Result<(), ProtocolError> {
        self.router.send_chat(text).await
    }

    /// Send a direct message to one peer.
    ///
    /// # Errors
    ///
    /// `ProtocolError` when the peer or channel is unavailable.
    pub async fn send_dm(&self, peer: &str, text: &str) -> Result<(), ProtocolError> {
        self.router.send_dm(peer, text).await
    }

    /// Ask a peer a question; resolves with the first matching answer.
    /// No timeout is applied — wrap the future when one is wanted.
    ///
    /// # Errors
    ///
    /// `ProtocolError` on send failure or peer departure.
    pub async fn ask(
        &self,
        peer: &str,
        topic: &str,
        content: serde_json::Value,
    ) -> Result<serde_json::Value, ProtocolError> {
        self.router.ask(peer, topic, content).await
    }

    /// Probe a peer; resolves on its pong.
    ///
    /// # Errors
    ///
    /// `ProtocolError` on send failure or peer departure.
    pub async fn ping(&self, peer: &str) -> Result<(), ProtocolError> {
        self.router.ping(peer).await
    }

    /// Place a call.
    ///
    /// # Errors
    ///
    /// See [`CallManager::start_call`].
    pub async fn start_call(
        &self,
        peer: &str,
        intent: MediaIntent,
    ) -> Result<(), crate::call::CallError> {
        self.calls.start_call(peer, intent).await
    }

    /// Hang up or withdraw a call.
    ///
    /// # Errors
    ///
    /// See [`CallManager::end_call`].
    pub async fn end_call(&self, peer: &str) -> Result<(), crate::call::CallError> {
        self.calls.end_call(peer).await
    }

    /// Call phase for a peer.
    pub fn call_phase(&self, peer: &str) -> CallPhase {
        self.calls.phase(peer)
    }

    /// Latest call metrics for a peer.
    pub fn call_metrics(&self, peer: &str) -> Option<CallMetrics> {
        self.calls.metrics(peer)
    }

    /// Microphone mute across every active call.
    pub fn set_mic_muted(&self, muted: bool) {
        self.calls.set_mic_muted(muted);
    }

    /// Camera mute across every active call.
    pub fn set_video_muted(&self, muted: bool) {
        self.calls.set_video_muted(muted);
    }

    /// Speakers mute (UI signal only).
    pub fn set_speakers_muted(&self, muted: bool) {
        self.calls.set_speakers_muted(muted);
    }

    /// Chat ledger snapshot.
    pub fn chat_log(&self) -> Vec<ChatMessage> {
        self.chat.log()
    }

    /// Active-user roster snapshot.
    pub fn active_users(&self) -> Vec<ActiveUser> {
        self.chat.active_users()
    }

    /// Received-signal history ring.
    pub fn signal_history(&self) -> Vec<crate::signal::HistoryEntry> {
        self.transport.history()
    }

    /// Rename: publish the change and adopt the new identity string.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name or when the announcement cannot be sent.
    pub async fn change_name(&self, new_bare_name: &str) -> Result<()> {
        identity::validate_bare_name(new_bare_name)?;

        let old_identity = self.transport.sender();
        let tab = self.lease.lock().expect("lease lock poisoned").id();
        let display = identity::with_tab_suffix(new_bare_name, tab);
        let new_identity = identity::compose_identity(
            &display,
            self.public_key_string().as_deref(),
        );

        self.transport
            .publish(SignalPayload::NameChange {
                old_name: old_identity.clone(),
                new_name: new_identity.clone(),
            })
            .await
            .context("announcing the rename")?;

        self.transport.set_sender(new_identity.clone());
        *self.display_name.write().expect("name lock poisoned") = display;
        self.bus.emit(ClientEvent::NameChange {
            old_name: old_identity,
            new_name: new_identity,
        });
        Ok(())
    }

    /// Leave the room: announce `unload`, release the tab lease, tear every
    /// connection down, close the broker, stop the loops.
    pub async fn shutdown(&self) {
        if let Err(e) = self
            .transport
            .publish(SignalPayload::Unload(String::new()))
            .await
        {
            log::debug!("[Client] unload announcement failed: {e}");
        }

        self.lease.lock().expect("lease lock poisoned").release();
        self.manager.teardown_all().await;
        self.broker.close().await;

        let tasks = {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
        log::info!("[Client] left {}", self.config.topic());
    }
}
