//! Process-local event bus.
//!
//! Every component publishes typed [`ClientEvent`]s here instead of calling
//! into the UI; the application observes the session through one of two
//! shapes:
//!
//! - callback handlers registered with [`EventBus::on`] / [`EventBus::once`],
//!   detached with [`EventBus::off`];
//! - an async stream via [`EventBus::subscribe`], a `tokio::sync::broadcast`
//!   receiver.
//!
//! A panicking handler is caught and logged; it never disturbs the other
//! subscribers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::call::CallMetrics;
use crate::chat::ChatMessage;
use crate::rtc::MediaIntent;
use crate::signal::SignalFrame;

/// Capacity of the broadcast side of the bus. Slow subscribers lag and skip
/// rather than block the emitters.
const BROADCAST_CAPACITY: usize = 256;

/// Everything the client reports to the application.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The broker connection is up.
    BrokerConnected,
    /// A signaling frame arrived on the room topic (own echoes excluded).
    BrokerMessage(SignalFrame),
    /// Every data channel to the peer is open and the handshake was sent.
    ConnectedToPeer {
        /// Peer identity string.
        peer: String,
    },
    /// The peer connection was torn down (unload, failure, disconnect).
    DisconnectedFromPeer {
        /// Peer identity string.
        peer: String,
    },
    /// Broadcast chat text from a peer.
    Chat {
        /// Sending peer.
        peer: String,
        /// Message text.
        text: String,
    },
    /// Direct message from a peer.
    Dm {
        /// Sending peer.
        peer: String,
        /// Message text.
        text: String,
    },
    /// A chat-ledger entry was recorded.
    Message(ChatMessage),
    /// A question arrived that no registered responder handled.
    Question {
        /// Asking peer.
        peer: String,
        /// Correlation number; answers must echo it.
        n: u64,
        /// Question topic.
        topic: String,
        /// Question content.
        content: serde_json::Value,
    },
    /// Liveness probe received (a pong was already sent back).
    Ping {
        /// Probing peer.
        peer: String,
    },
    /// Liveness reply received.
    Pong {
        /// Replying peer.
        peer: String,
    },
    /// The peer proved possession of its claimed key this session.
    Validation {
        /// Validated peer.
        peer: String,
        /// True when the key was saved to known hosts as part of this
        /// validation (false when it was already known).
        newly_trusted: bool,
    },
    /// Signature check failed or a known name presented a changed key.
    ValidationFailure {
        /// Offending peer.
        peer: String,
        /// Human-readable cause.
        reason: String,
    },
    /// A peer announced a rename.
    NameChange {
        /// Previous identity string.
        old_name: String,
        /// New identity string.
        new_name: String,
    },
    /// A call offer arrived and the ringer was started.
    IncomingCall {
        /// Calling peer.
        peer: String,
        /// Requested media kinds.
        intent: MediaIntent,
    },
    /// The local side committed to a call (offer sent or offer accepted).
    CallStarted {
        /// Remote peer.
        peer: String,
        /// Media kinds in play.
        intent: MediaIntent,
    },
    /// Remote tracks arrived; the call is live.
    CallConnected {
        /// Remote peer.
        peer: String,
        /// Media kinds in play.
        intent: MediaIntent,
    },
    /// An active call ended.
    CallEnded {
        /// Remote peer.
        peer: String,
    },
    /// The callee declined.
    CallRejected {
        /// Remote peer.
        peer: String,
    },
    /// A pending call expired before being answered.
    CallTimeout {
        /// Remote peer.
        peer: String,
    },
    /// A pending outgoing call was withdrawn before the callee answered.
    CallCancelled {
        /// Remote peer.
        peer: String,
    },
    /// Media acquisition or negotiation failed.
    CallError {
        /// Remote peer.
        peer: String,
        /// Human-readable cause.
        message: String,
    },
    /// Microphone/camera mute flags changed on the local tracks.
    MuteChanged {
        /// Microphone muted.
        mic: bool,
        /// Camera muted.
        video: bool,
    },
    /// Speaker mute toggled. Consumed by the UI only; no core component
    /// reacts to it.
    SpeakersMuteChanged {
        /// Speakers muted.
        muted: bool,
    },
    /// Fresh call metrics were sampled.
    MetricsUpdated {
        /// Remote peer.
        peer: String,
        /// Sampled round-trip/loss/jitter values.
        metrics: CallMetrics,
    },
}

/// Opaque handle returned by [`EventBus::on`]; pass to [`EventBus::off`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

struct Registered {
    handler: Handler,
    once: bool,
}

/// In-process publish/subscribe bus shared by every component of a client.
pub struct EventBus {
    handlers: Mutex<HashMap<u64, Registered>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<ClientEvent>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field(
                "handlers",
                &self.handlers.lock().expect("bus lock poisoned").len(),
            )
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus.
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tx,
        })
    }

    /// Register a handler for every emitted event.
    pub fn on(&self, handler: impl Fn(&ClientEvent) + Send + Sync + 'static) -> HandlerId {
        self.register(Arc::new(handler), false)
    }

    /// Register a handler that detaches itself after the first event.
    pub fn once(&self, handler: impl Fn(&ClientEvent) + Send + Sync + 'static) -> HandlerId {
        self.register(Arc::new(handler), true)
    }

    fn register(&self, handler: Handler, once: bool) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .expect("bus lock poisoned")
            .insert(id, Registered { handler, once });
        HandlerId(id)
    }

    /// Detach a handler. Detaching twice is a no-op.
    pub fn off(&self, id: HandlerId) {
        self.handlers.lock().expect("bus lock poisoned").remove(&id.0);
    }

    /// Async subscription to the same event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event to every handler and broadcast subscriber.
    ///
    /// Handlers run synchronously on the emitting task, outside the registry
    /// lock, so a handler may call `on`/`off` reentrantly.
    pub fn emit(&self, event: ClientEvent) {
        let snapshot: Vec<(u64, Handler, bool)> = {
            let handlers = self.handlers.lock().expect("bus lock poisoned");
            handlers
                .iter()
                .map(|(id, r)| (*id, Arc::clone(&r.handler), r.once))
                .collect()
        };

        for (id, handler, once) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                log::warn!("[Events] handler {id} panicked; event dropped for it");
            }
            if once {
                self.handlers.lock().expect("bus lock poisoned").remove(&id);
            }
        }

        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn chat(peer: &str, text: &str) -> ClientEvent {
        ClientEvent::Chat {
            peer: peer.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_on_receives_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(chat("a", "hi"));
        bus.emit(chat("a", "again"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_off_detaches() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = bus.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(chat("a", "one"));
        bus.off(id);
        bus.emit(chat("a", "two"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.once(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(chat("a", "one"));
        bus.emit(chat("a", "two"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_disturb_others() {
        let bus = EventBus::new();
        bus.on(|_| panic!("bad handler"));

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(chat("a", "hi"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(chat("bob", "hello"));

        match rx.recv().await.expect("event") {
            ClientEvent::Chat { peer, text } => {
                assert_eq!(peer, "bob");
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
