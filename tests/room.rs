//! End-to-end room scenarios over the in-process broker and RTC engine.
//!
//! Every test builds real clients wired to one shared `MemoryBus` (the
//! broker) and one shared `MemoryRtc` (the network); only the externals
//! are simulated, the whole signaling/trust/protocol/call stack is the
//! real thing.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parlor::broker::{Broker, MemoryBus};
use parlor::call::{CallPhase, CallResponder};
use parlor::chat::ChatMessage;
use parlor::connection::ConnectGate;
use parlor::events::ClientEvent;
use parlor::identity::SigningIdentity;
use parlor::keystore::KnownHosts;
use parlor::rtc::{MediaIntent, MediaSource, MediaStream, RtcEngine, RtcError, SyntheticMedia};
use parlor::rtc::memory::MemoryRtc;
use parlor::storage::{KvStore, MemoryKv};
use parlor::trust::TrustCategory;
use parlor::{RoomClient, RoomConfig};

/// One simulated world: broker bus + RTC network.
struct World {
    bus: Arc<MemoryBus>,
    rtc: Arc<MemoryRtc>,
}

impl World {
    fn new() -> Self {
        // Keep identity secrets in the kv store; never touch an OS keyring
        // from the test suite.
        std::env::set_var("PARLOR_ENV", "test");
        Self {
            bus: MemoryBus::new(),
            rtc: MemoryRtc::new(),
        }
    }

    fn config(&self) -> RoomConfig {
        let mut config = RoomConfig::default();
        config.room = "test".to_string();
        config.tabs.enabled = false;
        config.call_timeout_ms = 400;
        config.stats_interval_ms = 100;
        config
    }

    fn builder(&self, name: &str, kv: Arc<dyn KvStore>) -> parlor::RoomClientBuilder {
        RoomClient::builder(self.config())
            .name(name)
            .storage(kv)
            .broker(self.bus.client() as Arc<dyn Broker>)
            .engine(Arc::clone(&self.rtc) as Arc<dyn RtcEngine>)
    }

    async fn join(&self, name: &str) -> RoomClient {
        self.builder(name, Arc::new(MemoryKv::new()))
            .connect()
            .await
            .expect("join")
    }
}

/// Poll until `predicate` holds or the timeout elapses.
async fn wait_until(what: &str, timeout: Duration, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Count matching events over the given window.
fn count_events(
    client: &RoomClient,
    matcher: impl Fn(&ClientEvent) -> bool + Send + Sync + 'static,
) -> Arc<Mutex<usize>> {
    let count = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&count);
    client.on(move |event| {
        if matcher(event) {
            *counter.lock().expect("count lock") += 1;
        }
    });
    count
}

/// Media source that remembers every stream it hands out.
struct CapturingMedia {
    inner: SyntheticMedia,
    streams: Mutex<Vec<MediaStream>>,
}

impl CapturingMedia {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SyntheticMedia,
            streams: Mutex::new(Vec::new()),
        })
    }

    fn streams(&self) -> Vec<MediaStream> {
        self.streams.lock().expect("streams lock").clone()
    }
}

#[async_trait]
impl MediaSource for CapturingMedia {
    async fn acquire(&self, intent: MediaIntent) -> Result<MediaStream, RtcError> {
        let stream = self.inner.acquire(intent).await?;
        self.streams.lock().expect("streams lock").push(stream.clone());
        Ok(stream)
    }
}

/// Responder that never answers: the call just rings.
struct NeverAnswers;

#[async_trait]
impl CallResponder for NeverAnswers {
    async fn incoming_call(&self, _peer: &str, _intent: MediaIntent) -> bool {
        // Ring until the deadline kills the pending call.
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Gate that refuses every prompt and records that it was asked.
struct RefusingGate {
    prompted: Mutex<Vec<TrustCategory>>,
}

impl RefusingGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            prompted: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ConnectGate for RefusingGate {
    async fn allow_connection(&self, _peer: &str, category: TrustCategory) -> bool {
        self.prompted.lock().expect("prompts lock").push(category);
        false
    }

    async fn allow_save(&self, _peer: &str) -> bool {
        false
    }
}

#[tokio::test]
async fn two_peer_chat() {
    let world = World::new();
    let alice = world.join("alice").await;
    let bob = world.join("bob").await;

    wait_until("both sides connected", Duration::from_secs(5), || {
        alice.connected_peers().len() == 1 && bob.connected_peers().len() == 1
    })
    .await;

    // Signed mode gates the roster on validation.
    wait_until("rosters populated", Duration::from_secs(5), || {
        alice.active_users().len() == 1 && bob.active_users().len() == 1
    })
    .await;
    assert!(alice.active_users()[0].name.starts_with("bob"));
    assert!(bob.active_users()[0].name.starts_with("alice"));

    alice.send_chat("hi").await.expect("chat");

    wait_until("chat delivered", Duration::from_secs(5), || {
        !bob.chat_log().is_empty()
    })
    .await;

    let log: Vec<ChatMessage> = bob.chat_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].data, "hi");
    assert!(log[0].sender.starts_with("alice"));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn simultaneous_join_settles_on_one_connection() {
    let world = World::new();

    // Join concurrently so both sides see each other's announcements and
    // the offers can cross.
    let (alice, bob) = tokio::join!(world.join("alice"), world.join("bob"));

    let alice_connects = count_events(&alice, |event| {
        matches!(event, ClientEvent::ConnectedToPeer { .. })
    });
    let bob_connects = count_events(&bob, |event| {
        matches!(event, ClientEvent::ConnectedToPeer { .. })
    });

    wait_until("both sides connected", Duration::from_secs(5), || {
        alice.connected_peers().len() == 1 && bob.connected_peers().len() == 1
    })
    .await;

    // Let any duplicate negotiation play out, then check nothing doubled.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.connected_peers().len(), 1, "no duplicate records");
    assert_eq!(bob.connected_peers().len(), 1, "no duplicate records");
    assert!(*alice_connects.lock().expect("lock") <= 1);
    assert!(*bob_connects.lock().expect("lock") <= 1);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn validation_success_with_preshared_keys() {
    let world = World::new();

    // Provision identities first so the keys can be cross-seeded.
    let alice_kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let bob_kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let alice_key = SigningIdentity::load_or_create(&alice_kv)
        .expect("alice identity")
        .public_key_string();
    let bob_key = SigningIdentity::load_or_create(&bob_kv)
        .expect("bob identity")
        .public_key_string();

    KnownHosts::load(Arc::clone(&alice_kv))
        .save_public_key("bob", &bob_key, false)
        .expect("seed bob");
    KnownHosts::load(Arc::clone(&bob_kv))
        .save_public_key("alice", &alice_key, false)
        .expect("seed alice");

    let alice = world
        .builder("alice", alice_kv)
        .connect()
        .await
        .expect("alice joins");

    let validations: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&validations);
    alice.on(move |event| {
        if let ClientEvent::Validation {
            peer,
            newly_trusted,
        } = event
        {
            sink.lock().expect("lock").push((peer.clone(), *newly_trusted));
        }
    });

    let bob = world
        .builder("bob", bob_kv)
        .connect()
        .await
        .expect("bob joins");

    wait_until("both validated", Duration::from_secs(5), || {
        alice.validated_peers().len() == 1 && bob.validated_peers().len() == 1
    })
    .await;

    // Keys were already known: not newly trusted.
    let seen = validations.lock().expect("lock").clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].0.starts_with("bob"));
    assert!(!seen[0].1, "pre-known key must not read as newly trusted");

    // Validated peers are always a subset of connected peers.
    for peer in alice.validated_peers() {
        assert!(alice.connected_peers().contains(&peer));
    }

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn pretender_is_prompted_and_refused_in_strict_mode() {
    let world = World::new();

    // Alice knows "bob" under a key that is NOT the joining bob's key.
    let alice_kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    KnownHosts::load(Arc::clone(&alice_kv))
        .save_public_key("bob", "SOMEBODY-ELSES-KEY", false)
        .expect("seed");

    let mut config = world.config();
    config.trust_mode = "strict".to_string();

    let gate = RefusingGate::new();
    let alice = RoomClient::builder(config)
        .name("alice")
        .storage(alice_kv)
        .broker(world.bus.client() as Arc<dyn Broker>)
        .engine(Arc::clone(&world.rtc) as Arc<dyn RtcEngine>)
        .connect_gate(Arc::clone(&gate) as Arc<dyn ConnectGate>)
        .connect()
        .await
        .expect("alice joins");

    // The impostor presents name "bob" with its own (unknown) key.
    let bob = world.join("bob").await;

    wait_until("trust prompt fired", Duration::from_secs(5), || {
        !gate.prompted.lock().expect("lock").is_empty()
    })
    .await;
    assert!(gate
        .prompted
        .lock()
        .expect("lock")
        .contains(&TrustCategory::Pretender));

    // Prompt was refused: no connection may come up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(alice.connected_peers().is_empty());
    assert!(alice.active_users().is_empty());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn audio_call_times_out_when_never_answered() {
    let world = World::new();

    let alice_media = CapturingMedia::new();
    let alice = world
        .builder("alice", Arc::new(MemoryKv::new()))
        .media(Arc::clone(&alice_media) as Arc<dyn MediaSource>)
        .connect()
        .await
        .expect("alice joins");
    let bob = world
        .builder("bob", Arc::new(MemoryKv::new()))
        .call_responder(Arc::new(NeverAnswers))
        .connect()
        .await
        .expect("bob joins");

    wait_until("connected", Duration::from_secs(5), || {
        alice.connected_peers().len() == 1 && bob.connected_peers().len() == 1
    })
    .await;

    let alice_timeouts = count_events(&alice, |event| {
        matches!(event, ClientEvent::CallTimeout { .. })
    });
    let bob_timeouts = count_events(&bob, |event| {
        matches!(event, ClientEvent::CallTimeout { .. })
    });
    let alice_connected_calls = count_events(&alice, |event| {
        matches!(event, ClientEvent::CallConnected { .. })
    });

    let bob_id = alice.connected_peers()[0].clone();
    alice
        .start_call(&bob_id, MediaIntent::audio())
        .await
        .expect("call starts ringing");
    assert_eq!(alice.call_phase(&bob_id), CallPhase::Pending);

    wait_until("both sides time out", Duration::from_secs(5), || {
        *alice_timeouts.lock().expect("lock") == 1 && *bob_timeouts.lock().expect("lock") == 1
    })
    .await;

    assert_eq!(alice.call_phase(&bob_id), CallPhase::Inactive);
    assert_eq!(*alice_connected_calls.lock().expect("lock"), 0);

    // Every acquired local track was stopped on timeout.
    for stream in alice_media.streams() {
        for track in &stream.tracks {
            assert!(track.is_stopped(), "timeout must stop acquired tracks");
        }
    }

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn call_connects_and_mute_propagates() {
    let world = World::new();

    let alice_media = CapturingMedia::new();
    let alice = world
        .builder("alice", Arc::new(MemoryKv::new()))
        .media(Arc::clone(&alice_media) as Arc<dyn MediaSource>)
        .connect()
        .await
        .expect("alice joins");
    // Bob's default responder accepts calls.
    let bob = world.join("bob").await;

    wait_until("connected", Duration::from_secs(5), || {
        alice.connected_peers().len() == 1 && bob.connected_peers().len() == 1
    })
    .await;

    let mute_events = count_events(&alice, |event| {
        matches!(event, ClientEvent::MuteChanged { mic: true, .. })
    });

    let bob_id = alice.connected_peers()[0].clone();
    alice
        .start_call(&bob_id, MediaIntent::audio())
        .await
        .expect("call starts");

    wait_until("call active on both sides", Duration::from_secs(5), || {
        alice.call_phase(&bob_id) == CallPhase::Active
            && bob
                .connected_peers()
                .first()
                .is_some_and(|alice_id| bob.call_phase(alice_id) == CallPhase::Active)
    })
    .await;

    // Metrics polling kicks in while the call is active.
    wait_until("metrics sampled", Duration::from_secs(5), || {
        alice.call_metrics(&bob_id).is_some_and(|m| m.rtt_ms.is_some())
    })
    .await;

    // Mute: every local audio track flips to disabled, but keeps existing.
    alice.set_mic_muted(true);
    for stream in alice_media.streams() {
        for track in &stream.tracks {
            assert!(!track.is_enabled(), "muted track must be disabled");
            assert!(!track.is_stopped(), "muted track must keep running");
        }
    }
    assert_eq!(*mute_events.lock().expect("lock"), 1);

    // Hang up; both sides settle back to inactive.
    alice.end_call(&bob_id).await.expect("hang up");
    wait_until("call ended everywhere", Duration::from_secs(5), || {
        bob.connected_peers()
            .first()
            .map_or(true, |alice_id| bob.call_phase(alice_id) == CallPhase::Inactive)
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn dm_question_and_ping_roundtrip() {
    let world = World::new();
    let alice = world.join("alice").await;
    let bob = world.join("bob").await;

    wait_until("connected", Duration::from_secs(5), || {
        alice.connected_peers().len() == 1 && bob.connected_peers().len() == 1
    })
    .await;
    let bob_id = alice.connected_peers()[0].clone();

    // Direct message
    let dms: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&dms);
    bob.on(move |event| {
        if let ClientEvent::Dm { text, .. } = event {
            sink.lock().expect("lock").push(text.clone());
        }
    });
    alice.send_dm(&bob_id, "psst").await.expect("dm");
    wait_until("dm delivered", Duration::from_secs(5), || {
        !dms.lock().expect("lock").is_empty()
    })
    .await;
    assert_eq!(dms.lock().expect("lock")[0], "psst");

    // Ping resolves on pong
    tokio::time::timeout(Duration::from_secs(5), alice.ping(&bob_id))
        .await
        .expect("timely pong")
        .expect("ping ok");

    // Unanswered question topics surface as events on the asked side.
    let questions = count_events(&bob, |event| {
        matches!(event, ClientEvent::Question { .. })
    });
    let ask = alice.ask(&bob_id, "favorite-color", serde_json::json!({}));
    let ask = tokio::time::timeout(Duration::from_millis(300), ask).await;
    assert!(ask.is_err(), "no responder means no answer (and no timeout in core)");
    wait_until("question surfaced", Duration::from_secs(5), || {
        *questions.lock().expect("lock") == 1
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn unload_tears_the_connection_down() {
    let world = World::new();
    let alice = world.join("alice").await;
    let bob = world.join("bob").await;

    wait_until("connected", Duration::from_secs(5), || {
        alice.connected_peers().len() == 1 && bob.connected_peers().len() == 1
    })
    .await;

    let disconnects = count_events(&alice, |event| {
        matches!(event, ClientEvent::DisconnectedFromPeer { .. })
    });

    bob.shutdown().await;

    wait_until("alice saw the departure", Duration::from_secs(5), || {
        *disconnects.lock().expect("lock") >= 1
    })
    .await;
    wait_until("records cleaned up", Duration::from_secs(5), || {
        alice.connected_peers().is_empty() && alice.active_users().is_empty()
    })
    .await;

    alice.shutdown().await;
}
