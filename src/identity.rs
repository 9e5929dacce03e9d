//! Peer naming and the local signing identity.
//!
//! A peer is `displayName|publicKeyString`; the display name may carry a tab
//! suffix `(N)` so several windows of one browser profile can share a name
//! without colliding. Bare names never contain `(`, `)` or `|`.
//!
//! The signing identity is an Ed25519 keypair. The public half and the
//! fingerprint live in the key/value store; the secret goes to the OS keyring
//! keyed by fingerprint, falling back to the store itself when no keyring is
//! reachable (and always in test mode).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use keyring::Entry;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::Zeroize;

use crate::storage::{KvStore, StorageError};

/// Keyring service name for the signing secret.
const KEYRING_SERVICE: &str = "parlor";
/// Keyring entry suffix for the signing secret.
const KEYRING_SIGNING_SUFFIX: &str = "signing";

/// Store key holding the base64 public key.
pub const KV_PUBLIC_KEY: &str = "identity.publicKey";
/// Store key holding the fingerprint.
pub const KV_FINGERPRINT: &str = "identity.fingerprint";
/// Store key holding the secret when the keyring is skipped or unreachable.
pub const KV_SECRET_KEY: &str = "identity.secretKey";

/// Names starting with this prefix short-circuit trust classification to
/// never-met.
pub const ANON_PREFIX: &str = "anon";

/// Characters a bare name may not contain.
const FORBIDDEN: [char; 3] = ['(', ')', '|'];

/// Errors from naming and identity handling.
#[derive(Debug)]
pub enum IdentityError {
    /// The name is empty or contains a forbidden character.
    InvalidName(String),
    /// A key or signature string did not decode.
    BadKey(String),
    /// Keyring interaction failed and no fallback was possible.
    Keyring(String),
    /// Persistence failed.
    Storage(StorageError),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid peer name: {name:?}"),
            Self::BadKey(msg) => write!(f, "bad key material: {msg}"),
            Self::Keyring(msg) => write!(f, "keyring error: {msg}"),
            Self::Storage(e) => write!(f, "identity storage error: {e}"),
        }
    }
}

impl std::error::Error for IdentityError {}

impl From<StorageError> for IdentityError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Check a bare display name: non-empty, no `(`, `)`, `|`.
///
/// # Errors
///
/// Returns `IdentityError::InvalidName` on violation.
pub fn validate_bare_name(name: &str) -> Result<(), IdentityError> {
    if name.is_empty() || name.chars().any(|c| FORBIDDEN.contains(&c)) {
        return Err(IdentityError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Strip a trailing tab suffix: `alice(2)` → `alice`.
pub fn strip_tab_suffix(name: &str) -> &str {
    if let Some(open) = name.rfind('(') {
        if name.ends_with(')') && name[open + 1..name.len() - 1].chars().all(|c| c.is_ascii_digit())
        {
            return &name[..open];
        }
    }
    name
}

/// Append a tab suffix for window `tab`. Window zero carries no suffix.
pub fn with_tab_suffix(name: &str, tab: u32) -> String {
    if tab == 0 {
        name.to_string()
    } else {
        format!("{name}({tab})")
    }
}

/// Split a sender identity into its name part and optional key part.
pub fn split_identity(sender: &str) -> (&str, Option<&str>) {
    match sender.split_once('|') {
        Some((name, key)) => (name, Some(key)),
        None => (sender, None),
    }
}

/// Bare name of a sender identity: key and tab suffix removed.
pub fn bare_name(sender: &str) -> &str {
    strip_tab_suffix(split_identity(sender).0)
}

/// Public key claimed by a sender identity, if any.
pub fn claimed_key(sender: &str) -> Option<&str> {
    split_identity(sender).1
}

/// Compose an identity string: `name` or `name|key`.
pub fn compose_identity(name: &str, key: Option<&str>) -> String {
    match key {
        Some(key) => format!("{name}|{key}"),
        None => name.to_string(),
    }
}

/// A fresh anonymous display name, `anon-xxxxxxxx`.
pub fn anonymous_name() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    format!(
        "{ANON_PREFIX}-{}",
        bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
    )
}

/// 32 bytes of OS randomness for a validation challenge.
pub fn challenge_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

/// Verify `signature_b64` over `message` against `public_key_b64`.
///
/// Any decode failure counts as verification failure.
pub fn verify(public_key_b64: &str, signature_b64: &str, message: &[u8]) -> bool {
    let Ok(key_bytes) = BASE64.decode(public_key_b64) else {
        return false;
    };
    let key_bytes: [u8; 32] = match key_bytes.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

/// Whether the OS keyring must not be touched.
///
/// True in unit tests and when `PARLOR_ENV=test` (integration tests); the
/// secret then lives in the key/value store instead.
fn should_skip_keyring() -> bool {
    #[cfg(test)]
    {
        true
    }

    #[cfg(not(test))]
    {
        matches!(
            std::env::var("PARLOR_ENV").as_deref(),
            Ok("test") | Ok("system_test")
        )
    }
}

/// The local Ed25519 signing identity.
pub struct SigningIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    fingerprint: String,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl SigningIdentity {
    /// Load the persisted identity, or generate and persist a fresh one.
    ///
    /// # Errors
    ///
    /// Returns `IdentityError` when stored material is corrupt or cannot be
    /// written back.
    pub fn load_or_create(kv: &Arc<dyn KvStore>) -> Result<Self, IdentityError> {
        if let (Some(public_b64), Some(fingerprint)) =
            (kv.get(KV_PUBLIC_KEY), kv.get(KV_FINGERPRINT))
        {
            let signing_key = Self::load_secret(kv, &fingerprint)?;
            let verifying_key = signing_key.verifying_key();
            if BASE64.encode(verifying_key.as_bytes()) != public_b64 {
                return Err(IdentityError::BadKey(
                    "stored public key does not match the signing secret".into(),
                ));
            }
            log::info!("[Identity] loaded signing identity {fingerprint}");
            return Ok(Self {
                signing_key,
                verifying_key,
                fingerprint,
            });
        }

        Self::create(kv)
    }

    fn create(kv: &Arc<dyn KvStore>) -> Result<Self, IdentityError> {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        let signing_key = SigningKey::from_bytes(&secret);
        secret.zeroize();

        let verifying_key = signing_key.verifying_key();
        let fingerprint = compute_fingerprint(&verifying_key);

        Self::store_secret(kv, &fingerprint, &signing_key)?;
        kv.set(KV_PUBLIC_KEY, &BASE64.encode(verifying_key.as_bytes()))?;
        kv.set(KV_FINGERPRINT, &fingerprint)?;

        log::info!("[Identity] created signing identity {fingerprint}");
        Ok(Self {
            signing_key,
            verifying_key,
            fingerprint,
        })
    }

    fn store_secret(
        kv: &Arc<dyn KvStore>,
        fingerprint: &str,
        signing_key: &SigningKey,
    ) -> Result<(), IdentityError> {
        let mut secret_b64 = BASE64.encode(signing_key.to_bytes());

        if !should_skip_keyring() {
            let entry_name = format!("{fingerprint}-{KEYRING_SIGNING_SUFFIX}");
            match Entry::new(KEYRING_SERVICE, &entry_name)
                .and_then(|entry| entry.set_password(&secret_b64))
            {
                Ok(()) => {
                    secret_b64.zeroize();
                    log::debug!("[Identity] signing secret stored in OS keyring");
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "[Identity] keyring unavailable ({e}); storing signing secret in kv store"
                    );
                }
            }
        }

        let result = kv.set(KV_SECRET_KEY, &secret_b64);
        secret_b64.zeroize();
        result.map_err(IdentityError::Storage)
    }

    fn load_secret(kv: &Arc<dyn KvStore>, fingerprint: &str) -> Result<SigningKey, IdentityError> {
        let mut secret_b64 = if should_skip_keyring() {
            kv.get(KV_SECRET_KEY)
                .ok_or_else(|| IdentityError::Keyring("signing secret not in kv store".into()))?
        } else {
            let entry_name = format!("{fingerprint}-{KEYRING_SIGNING_SUFFIX}");
            match Entry::new(KEYRING_SERVICE, &entry_name).and_then(|entry| entry.get_password()) {
                Ok(secret) => secret,
                Err(e) => kv.get(KV_SECRET_KEY).ok_or_else(|| {
                    IdentityError::Keyring(format!("signing secret unavailable: {e}"))
                })?,
            }
        };

        let decoded = BASE64
            .decode(secret_b64.trim())
            .map_err(|e| IdentityError::BadKey(format!("secret encoding: {e}")))?;
        secret_b64.zeroize();
        let mut key_bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| IdentityError::BadKey("secret length".into()))?;
        let key = SigningKey::from_bytes(&key_bytes);
        key_bytes.zeroize();
        Ok(key)
    }

    /// Base64 public key string, the `publicKeyString` that peers see.
    pub fn public_key_string(&self) -> String {
        BASE64.encode(self.verifying_key.as_bytes())
    }

    /// Colon-hex fingerprint of the public key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Sign a message; returns the base64 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(message).to_bytes())
    }
}

/// First 8 bytes of `SHA-256(verifying_key)`, colon-separated hex.
fn compute_fingerprint(verifying_key: &VerifyingKey) -> String {
    let hash = Sha256::digest(verifying_key.as_bytes());
    hash[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;

    fn kv() -> Arc<dyn KvStore> {
        Arc::new(MemoryKv::new())
    }

    #[test]
    fn test_bare_name_rules() {
        assert!(validate_bare_name("alice").is_ok());
        assert!(validate_bare_name("").is_err());
        assert!(validate_bare_name("al|ce").is_err());
        assert!(validate_bare_name("alice(1)").is_err());
    }

    #[test]
    fn test_tab_suffix_roundtrip() {
        assert_eq!(with_tab_suffix("alice", 0), "alice");
        assert_eq!(with_tab_suffix("alice", 2), "alice(2)");
        assert_eq!(strip_tab_suffix("alice(2)"), "alice");
        assert_eq!(strip_tab_suffix("alice"), "alice");
        // Only digit suffixes are stripped
        assert_eq!(strip_tab_suffix("alice(x)"), "alice(x)");
    }

    #[test]
    fn test_identity_split() {
        assert_eq!(split_identity("alice|KEY"), ("alice", Some("KEY")));
        assert_eq!(split_identity("alice"), ("alice", None));
        assert_eq!(bare_name("alice(3)|KEY"), "alice");
        assert_eq!(claimed_key("alice|KEY"), Some("KEY"));
        assert_eq!(compose_identity("alice", Some("KEY")), "alice|KEY");
    }

    #[test]
    fn test_anonymous_name_has_prefix() {
        let name = anonymous_name();
        assert!(name.starts_with(ANON_PREFIX));
        assert!(validate_bare_name(&name).is_ok());
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let store = kv();
        let identity = SigningIdentity::load_or_create(&store).expect("create");

        let challenge = challenge_bytes();
        let signature = identity.sign(&challenge);

        assert!(verify(&identity.public_key_string(), &signature, &challenge));

        // Any altered byte fails
        let mut tampered = challenge;
        tampered[0] ^= 0xff;
        assert!(!verify(&identity.public_key_string(), &signature, &tampered));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert!(!verify("not base64!!", "also not", b"msg"));
        let store = kv();
        let identity = SigningIdentity::load_or_create(&store).expect("create");
        assert!(!verify(&identity.public_key_string(), "AAAA", b"msg"));
    }

    #[test]
    fn test_identity_persists() {
        let store = kv();
        let first = SigningIdentity::load_or_create(&store).expect("create");
        let second = SigningIdentity::load_or_create(&store).expect("reload");
        assert_eq!(first.public_key_string(), second.public_key_string());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_fingerprint_format() {
        let store = kv();
        let identity = SigningIdentity::load_or_create(&store).expect("create");
        let parts: Vec<&str> = identity.fingerprint().split(':').collect();
        assert_eq!(parts.len(), 8);
        for part in parts {
            assert_eq!(part.len(), 2);
            assert!(part.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
