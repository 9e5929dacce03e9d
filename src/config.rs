//! Client configuration.
//!
//! Every knob the stack recognizes, with the documented defaults. A config
//! can be deserialized from JSON or built in code; a handful of
//! deployment-level options also honor `PARLOR_*` environment overrides.

use serde::{Deserialize, Serialize};

/// One ICE server entry handed to the RTC engine.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IceServerConfig {
    /// Server URLs (`stun:` / `turn:` schemes).
    pub urls: Vec<String>,
    /// TURN username, when required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential, when required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE candidate gathering policy.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    /// Gather every candidate type.
    #[default]
    All,
    /// Relay-only (TURN) candidates.
    Relay,
}

/// Signal payload compression settings.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct CompressionConfig {
    /// Master switch.
    pub enabled: bool,
    /// Payloads at or above this many bytes are compressed.
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 4096,
        }
    }
}

/// Multi-window presence settings.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct TabConfig {
    /// Whether tab suffixes are negotiated at all.
    pub enabled: bool,
    /// Heartbeat interval in milliseconds.
    pub poll_interval_ms: u64,
    /// A lease older than this is considered dead and pruned.
    pub timeout_ms: u64,
}

impl Default for TabConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1_000,
            timeout_ms: 5_000,
        }
    }
}

/// Full client configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RoomConfig {
    /// Broker endpoint, e.g. `ws://localhost:9001`.
    pub broker_url: String,
    /// Room name; peers subscribing to the same room see each other.
    pub room: String,
    /// Topic prefix shared by every room of this deployment.
    pub base_topic: String,
    /// Separator between base topic and room.
    pub topic_separator: String,
    /// ICE servers for peer and media sessions.
    pub ice_servers: Vec<IceServerConfig>,
    /// Candidate gathering policy.
    pub ice_transport_policy: IceTransportPolicy,
    /// Signal compression settings.
    pub compression: CompressionConfig,
    /// How many received signal frames the history ring keeps.
    pub history_cap: usize,
    /// Multi-window lease settings.
    pub tabs: TabConfig,
    /// Trust mode name (see [`crate::trust::TrustMode::parse`]).
    pub trust_mode: String,
    /// Default answer of the connection gate when no prompt is installed.
    pub auto_accept_connections: bool,
    /// Signed mode: announce our public key and validate peers.
    pub signed: bool,
    /// How long a pending call rings before timing out, in milliseconds.
    pub call_timeout_ms: u64,
    /// Call metrics sampling interval in milliseconds.
    pub stats_interval_ms: u64,
    /// Chat ledger cap; older entries are evicted.
    pub chat_cap: usize,
    /// User colors; the first entry is reserved for self.
    pub palette: Vec<String>,
    /// How long a send waits for its data channel to open, in milliseconds.
    pub channel_open_timeout_ms: u64,
    /// A connection stuck before `connected` longer than this is replaced.
    pub stale_connection_ms: u64,
    /// Extra diagnostics from the stack itself.
    pub debug: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://localhost:9001".to_string(),
            room: "lobby".to_string(),
            base_topic: "parlor".to_string(),
            topic_separator: "/".to_string(),
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            ice_transport_policy: IceTransportPolicy::All,
            compression: CompressionConfig::default(),
            history_cap: 64,
            tabs: TabConfig::default(),
            trust_mode: "moderate".to_string(),
            auto_accept_connections: true,
            signed: true,
            call_timeout_ms: 15_000,
            stats_interval_ms: 2_000,
            chat_cap: 500,
            palette: vec![
                "#3b82f6".to_string(),
                "#ef4444".to_string(),
                "#22c55e".to_string(),
                "#eab308".to_string(),
                "#a855f7".to_string(),
                "#14b8a6".to_string(),
                "#f97316".to_string(),
                "#ec4899".to_string(),
            ],
            channel_open_timeout_ms: 10_000,
            stale_connection_ms: 12_000,
            debug: false,
        }
    }
}

impl RoomConfig {
    /// Defaults plus environment overrides.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Room topic on the broker: `{base_topic}{separator}{room}`.
    pub fn topic(&self) -> String {
        format!("{}{}{}", self.base_topic, self.topic_separator, self.room)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PARLOR_BROKER_URL") {
            self.broker_url = url;
        }
        if let Ok(room) = std::env::var("PARLOR_ROOM") {
            self.room = room;
        }
        if let Ok(mode) = std::env::var("PARLOR_TRUST_MODE") {
            self.trust_mode = mode;
        }
        if let Ok(debug) = std::env::var("PARLOR_DEBUG") {
            self.debug = debug == "1" || debug.eq_ignore_ascii_case("true");
        }
    }
}
