//! Challenge/response peer validation.
//!
//! Once a signed connection comes up, each side proves possession of the
//! private key behind its claimed public key: we send 32 fresh random bytes
//! as a `question` on the `validate` topic, the peer signs them, and the
//! signature must verify against the key it announced. Success admits the
//! peer to the validated set (always a subset of the connected set) and —
//! depending on the trust action — saves the key to known hosts. A bad
//! signature, or a known name turning up with a changed key, tears the
//! connection down.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::connection::{ConnectGate, ConnectionManager};
use crate::events::{ClientEvent, EventBus};
use crate::identity::{self, SigningIdentity};
use crate::keystore::KnownHosts;
use crate::protocol::{ProtocolRouter, QuestionResponder};
use crate::trust::{classify, TrustAction, TrustMode};

/// Question topic of the validation exchange.
pub const VALIDATE_TOPIC: &str = "validate";

/// Signs incoming validation challenges with our own key.
pub struct SignChallengeResponder {
    identity: Arc<SigningIdentity>,
}

impl SignChallengeResponder {
    /// Responder for our signing identity.
    pub fn new(identity: Arc<SigningIdentity>) -> Arc<Self> {
        Arc::new(Self { identity })
    }
}

#[async_trait]
impl QuestionResponder for SignChallengeResponder {
    async fn respond(&self, peer: &str, content: &Value) -> Option<Value> {
        let challenge_b64 = content.get("challenge").and_then(Value::as_str)?;
        let challenge = match BASE64.decode(challenge_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("[Validate] unreadable challenge from {peer}: {e}");
                return None;
            }
        };
        Some(serde_json::json!({
            "signature": self.identity.sign(&challenge),
        }))
    }
}

/// Drives outgoing validations and owns the validated set.
pub struct Validator {
    identity: Arc<SigningIdentity>,
    hosts: Arc<KnownHosts>,
    router: Arc<ProtocolRouter>,
    manager: Arc<ConnectionManager>,
    bus: Arc<EventBus>,
    gate: Arc<dyn ConnectGate>,
    trust_mode: TrustMode,
    validated: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field(
                "validated",
                &self.validated.lock().expect("validated lock poisoned").len(),
            )
            .finish_non_exhaustive()
    }
}

impl Validator {
    /// Build the validator and register the challenge responder.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<SigningIdentity>,
        hosts: Arc<KnownHosts>,
        router: Arc<ProtocolRouter>,
        manager: Arc<ConnectionManager>,
        bus: Arc<EventBus>,
        gate: Arc<dyn ConnectGate>,
        trust_mode: TrustMode,
    ) -> Arc<Self> {
        router.register_responder(
            VALIDATE_TOPIC,
            SignChallengeResponder::new(Arc::clone(&identity)),
        );
        Arc::new(Self {
            identity,
            hosts,
            router,
            manager,
            bus,
            gate,
            trust_mode,
            validated: Mutex::new(HashSet::new()),
        })
    }

    /// Watch the bus: challenge peers as they connect, drop them from the
    /// validated set as they leave.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let validator = Arc::clone(self);
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::ConnectedToPeer { peer }) => {
                        let validator = Arc::clone(&validator);
                        tokio::spawn(async move {
                            validator.validate_peer(peer).await;
                        });
                    }
                    Ok(ClientEvent::DisconnectedFromPeer { peer }) => {
                        validator
                            .validated
                            .lock()
                            .expect("validated lock poisoned")
                            .remove(&peer);
                        validator.router.forget_peer(&peer);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Validate] event stream lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Peers that proved key possession this session.
    pub fn validated_peers(&self) -> Vec<String> {
        self.validated
            .lock()
            .expect("validated lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Whether a peer is validated.
    pub fn is_validated(&self, peer: &str) -> bool {
        self.validated
            .lock()
            .expect("validated lock poisoned")
            .contains(peer)
    }

    async fn validate_peer(self: Arc<Self>, peer: String) {
        let claimed_key = self
            .manager
            .user_info(&peer)
            .and_then(|info| info.public_key_string)
            .or_else(|| identity::claimed_key(&peer).map(str::to_string));

        let Some(claimed_key) = claimed_key else {
            log::debug!("[Validate] {peer} presents no key; skipping validation");
            return;
        };

        let bare = identity::bare_name(&peer).to_string();

        // A known name must keep its key.
        if let Some(known_key) = self.hosts.get_public_key(&bare) {
            if known_key != claimed_key {
                self.fail(&peer, "claimed key differs from known hosts").await;
                return;
            }
        }

        let challenge = identity::challenge_bytes();
        let content = serde_json::json!({ "challenge": BASE64.encode(challenge) });

        let answer = match self.router.ask(&peer, VALIDATE_TOPIC, content).await {
            Ok(answer) => answer,
            Err(e) => {
                log::debug!("[Validate] challenge to {peer} unanswered: {e}");
                return;
            }
        };
        let Some(signature) = answer.get("signature").and_then(Value::as_str) else {
            self.fail(&peer, "malformed validation answer").await;
            return;
        };

        if !identity::verify(&claimed_key, signature, &challenge) {
            self.fail(&peer, "signature does not verify").await;
            return;
        }

        // Possession proven. Save the key per the trust action.
        let newly_known = self.hosts.get_public_key(&bare).is_none();
        let mut newly_trusted = false;
        if newly_known {
            let action = self.trust_mode.action(classify(&bare, &claimed_key, &self.hosts));
            let save = match action {
                TrustAction::ConnectAndTrust => true,
                TrustAction::ConnectAndPrompt | TrustAction::PromptAndTrust => {
                    self.gate.allow_save(&peer).await
                }
                TrustAction::Reject => false,
            };
            if save {
                match self.hosts.save_public_key(&bare, &claimed_key, false) {
                    Ok(()) => newly_trusted = true,
                    Err(e) => log::warn!("[Validate] could not save key for {peer}: {e}"),
                }
            }
        }

        self.validated
            .lock()
            .expect("validated lock poisoned")
            .insert(peer.clone());
        log::info!(
            "[Validate] {peer} validated (fingerprint holder of {})",
            &claimed_key[..claimed_key.len().min(12)]
        );
        self.bus.emit(ClientEvent::Validation {
            peer,
            newly_trusted,
        });
    }

    async fn fail(&self, peer: &str, reason: &str) {
        log::warn!("[Validate] {peer} failed validation: {reason}");
        self.validated
            .lock()
            .expect("validated lock poisoned")
            .remove(peer);
        self.bus.emit(ClientEvent::ValidationFailure {
            peer: peer.to_string(),
            reason: reason.to_string(),
        });
        self.manager.teardown(peer, "validation failure").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KvStore, MemoryKv};

    #[tokio::test]
    async fn test_responder_signs_challenges() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let identity = Arc::new(SigningIdentity::load_or_create(&kv).expect("identity"));
        let responder = SignChallengeResponder::new(Arc::clone(&identity));

        let challenge = identity::challenge_bytes();
        let content = serde_json::json!({ "challenge": BASE64.encode(challenge) });
        let answer = responder
            .respond("peer|KEY", &content)
            .await
            .expect("answer");

        let signature = answer["signature"].as_str().expect("signature");
        assert!(identity::verify(
            &identity.public_key_string(),
            signature,
            &challenge
        ));
    }

    #[tokio::test]
    async fn test_responder_ignores_malformed_content() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let identity = Arc::new(SigningIdentity::load_or_create(&kv).expect("identity"));
        let responder = SignChallengeResponder::new(identity);

        assert!(responder
            .respond("peer", &serde_json::json!({}))
            .await
            .is_none());
        assert!(responder
            .respond("peer", &serde_json::json!({"challenge": "@@not-b64@@"}))
            .await
            .is_none());
    }
}
