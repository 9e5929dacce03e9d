//! Authenticated peer-to-peer room communication.
//!
//! Peers meet in a shared "room" (a topic on a commodity publish/subscribe
//! broker), discover each other through signaling frames, and then talk over
//! direct peer-to-peer connections: a fixed set of named data channels for
//! chat, questions and liveness probes, plus an optional media sub-connection
//! for audio/video calls.
//!
//! # Architecture
//!
//! ```text
//! RoomClient
//!     ├── SignalTransport ── Broker (pub/sub, untrusted, signaling only)
//!     ├── ConnectionManager ── RtcEngine (peer sessions, data channels)
//!     │       └── per-peer link: offer/answer, ICE trickle, channel set
//!     ├── ProtocolRouter (typed messages over the data channels)
//!     ├── Validator (challenge/response key-possession proof)
//!     ├── CallManager (media sub-connection, ringing, timeouts, stats)
//!     ├── ChatManager (ledger, roster, colors)
//!     └── EventBus (process-local pub/sub toward the application)
//! ```
//!
//! The broker, the RTC implementation, track acquisition and persistence are
//! external collaborators consumed through traits; in-process implementations
//! of each ship with the crate so the whole stack runs in tests and demos.

pub mod broker;
pub mod call;
pub mod chat;
pub mod client;
pub mod config;
pub mod connection;
pub mod events;
pub mod identity;
pub mod keystore;
pub mod presence;
pub mod protocol;
pub mod rtc;
pub mod signal;
pub mod storage;
pub mod trust;
pub mod validation;

// Re-export the types an embedding application touches directly.
pub use client::{RoomClient, RoomClientBuilder};
pub use config::RoomConfig;
pub use connection::{AutoGate, ConnectGate};
pub use events::{ClientEvent, EventBus, HandlerId};
pub use rtc::{MediaIntent, MediaSource, RtcEngine};
pub use trust::{TrustAction, TrustCategory, TrustMode};
