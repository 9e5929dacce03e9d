//! Chat ledger, active-user roster and user colors.
//!
//! The ledger is an append-only, capped sequence of `{data, sender,
//! timestamp}` built from `chat` events. The roster is ordered by arrival;
//! in signed mode a peer joins it only once validated, in unsigned mode on
//! `connectedtopeer`. Colors come round-robin from the configured palette,
//! with the first palette entry reserved for self, and slots recycle when
//! their owner leaves.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::events::{ClientEvent, EventBus};
use crate::identity;

/// One ledger entry.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    /// Sender identity string.
    pub sender: String,
    /// Message text.
    pub data: String,
    /// Arrival wall clock, milliseconds since the epoch.
    pub timestamp: i64,
}

/// One roster entry.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveUser {
    /// Peer identity string.
    pub name: String,
    /// Assigned display color.
    pub color: String,
}

struct ChatState {
    ledger: VecDeque<ChatMessage>,
    users: Vec<ActiveUser>,
    // Palette slot occupancy, index 0 (self) excluded from assignment.
    used_slots: Vec<bool>,
}

/// Ledger + roster, fed from the event bus.
pub struct ChatManager {
    bus: Arc<EventBus>,
    signed: bool,
    cap: usize,
    palette: Vec<String>,
    state: Mutex<ChatState>,
}

impl std::fmt::Debug for ChatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("chat lock poisoned");
        f.debug_struct("ChatManager")
            .field("ledger", &state.ledger.len())
            .field("users", &state.users.len())
            .finish_non_exhaustive()
    }
}

impl ChatManager {
    /// Build the manager. `signed` selects the roster admission rule.
    pub fn new(bus: Arc<EventBus>, signed: bool, cap: usize, palette: Vec<String>) -> Arc<Self> {
        let slots = palette.len();
        Arc::new(Self {
            bus,
            signed,
            cap: cap.max(1),
            palette,
            state: Mutex::new(ChatState {
                ledger: VecDeque::new(),
                users: Vec::new(),
                used_slots: vec![false; slots],
            }),
        })
    }

    /// Color reserved for self: the first palette entry.
    pub fn self_color(&self) -> Option<&str> {
        self.palette.first().map(String::as_str)
    }

    /// Start consuming bus events.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let chat = Arc::clone(self);
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => chat.handle(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Chat] event stream lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn handle(&self, event: ClientEvent) {
        match event {
            ClientEvent::Chat { peer, text } => self.record(peer, text),
            ClientEvent::Validation { peer, .. } if self.signed => self.add_user(peer),
            ClientEvent::ConnectedToPeer { peer } if !self.signed => self.add_user(peer),
            ClientEvent::DisconnectedFromPeer { peer } => self.remove_user(&peer),
            ClientEvent::NameChange { old_name, new_name } => self.rename_user(&old_name, new_name),
            _ => {}
        }
    }

    fn record(&self, sender: String, text: String) {
        let entry = ChatMessage {
            sender,
            data: text,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        {
            let mut state = self.state.lock().expect("chat lock poisoned");
            if state.ledger.len() >= self.cap {
                state.ledger.pop_front();
            }
            state.ledger.push_back(entry.clone());
        }
        self.bus.emit(ClientEvent::Message(entry));
    }

    fn add_user(&self, name: String) {
        let mut state = self.state.lock().expect("chat lock poisoned");
        if state.users.iter().any(|user| user.name == name) {
            return;
        }

        // Slot 0 is self's color; peers rotate through the rest.
        let slot = (1..self.palette.len()).find(|i| !state.used_slots[*i]);
        let color = match slot {
            Some(slot) => {
                state.used_slots[slot] = true;
                self.palette[slot].clone()
            }
            None => self
                .palette
                .get(1 + state.users.len() % self.palette.len().saturating_sub(1).max(1))
                .cloned()
                .unwrap_or_default(),
        };

        log::debug!("[Chat] {name} joined the roster");
        state.users.push(ActiveUser { name, color });
    }

    fn remove_user(&self, name: &str) {
        let mut state = self.state.lock().expect("chat lock poisoned");
        let Some(index) = state.users.iter().position(|user| user.name == name) else {
            return;
        };
        let user = state.users.remove(index);
        if let Some(slot) = self.palette.iter().position(|c| *c == user.color) {
            if slot != 0 {
                state.used_slots[slot] = false;
            }
        }
        log::debug!("[Chat] {name} left the roster");
    }

    fn rename_user(&self, old_name: &str, new_name: String) {
        let mut state = self.state.lock().expect("chat lock poisoned");
        if let Some(user) = state.users.iter_mut().find(|user| user.name == old_name) {
            user.name = new_name;
        }
    }

    /// Ledger snapshot, oldest first.
    pub fn log(&self) -> Vec<ChatMessage> {
        self.state
            .lock()
            .expect("chat lock poisoned")
            .ledger
            .iter()
            .cloned()
            .collect()
    }

    /// Roster snapshot, arrival order.
    pub fn active_users(&self) -> Vec<ActiveUser> {
        self.state.lock().expect("chat lock poisoned").users.clone()
    }

    /// Roster lookup by bare name (ignores suffix/key differences).
    pub fn is_active(&self, name: &str) -> bool {
        let bare = identity::bare_name(name);
        self.state
            .lock()
            .expect("chat lock poisoned")
            .users
            .iter()
            .any(|user| identity::bare_name(&user.name) == bare)
    }
}
