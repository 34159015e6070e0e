//! Core event structure and operations.
//!
//! Implements the protocol's sole unit of data: the signed event. Covers
//! canonical serialization for hashing, Schnorr signing and verification,
//! the deterministic sort order used for pagination, and kind
//! classification (regular, replaceable, ephemeral, addressable).

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Message, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while building or checking events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
}

/// A signed event. Immutable once created: any "edit" is a new event
/// referencing the old one by tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex sha256 of the serialized event data
    pub id: String,
    /// 32-byte lowercase hex x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (selects the decode rules)
    pub kind: u16,
    /// Ordered string tuples: replies, mentions, identifiers
    pub tags: Vec<Vec<String>>,
    /// Opaque payload, plaintext or ciphertext depending on kind
    pub content: String,
    /// 64-byte lowercase hex Schnorr signature over the id
    pub sig: String,
}

/// An event before signing, with the author already known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A template for creating events. The pubkey is derived from the signing
/// key, so templates don't carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>, created_at: u64) -> Self {
        Self {
            created_at,
            kind,
            tags,
            content: content.into(),
        }
    }

    /// Attach an author pubkey, producing the unsigned form that hashing is
    /// defined over.
    pub fn with_pubkey(&self, pubkey: impl Into<String>) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: pubkey.into(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Sign with a secret key, producing a complete event. The id is the
    /// hash of the canonical serialization; the signature binds the id to
    /// the derived pubkey.
    pub fn sign(&self, secret_key: &[u8; 32]) -> Result<Event, EventError> {
        let secp = Secp256k1::new();

        let sk = SecretKey::from_slice(secret_key)
            .map_err(|e| EventError::InvalidSecretKey(e.to_string()))?;
        let (xonly_pk, _parity) = sk.x_only_public_key(&secp);
        let pubkey = hex::encode(xonly_pk.serialize());

        let unsigned = self.with_pubkey(pubkey.clone());
        let id = unsigned.id()?;

        let id_bytes =
            hex::decode(&id).map_err(|e| EventError::Signing(format!("invalid id hex: {e}")))?;
        let message = Message::from_digest_slice(&id_bytes)
            .map_err(|e| EventError::Signing(format!("invalid message: {e}")))?;

        let keypair = bitcoin::secp256k1::Keypair::from_secret_key(&secp, &sk);
        let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

        Ok(Event {
            id,
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
            sig: hex::encode(sig.serialize()),
        })
    }
}

impl UnsignedEvent {
    /// Canonical serialization for hashing:
    /// `[0, pubkey, created_at, kind, tags, content]` as compact JSON.
    /// Order-sensitive; must be byte-identical across implementations.
    pub fn serialize(&self) -> Result<String, EventError> {
        if !is_hex_of_len(&self.pubkey, 64) {
            return Err(EventError::InvalidEvent(
                "pubkey must be 64 lowercase hex characters".to_string(),
            ));
        }

        serde_json::to_string(&(
            0,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
        .map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// The event id: sha256 of the canonical serialization, hex-encoded.
    pub fn id(&self) -> Result<String, EventError> {
        let serialized = self.serialize()?;
        let hash = sha256::Hash::hash(serialized.as_bytes());
        Ok(hex::encode(hash.as_byte_array()))
    }
}

impl Event {
    /// Verify authenticity: the id must equal the canonical hash of the
    /// other fields, and the signature must verify against the id and
    /// pubkey. Both checks must pass before any decode is attempted.
    ///
    /// Structural problems (wrong-length hex, malformed keys) count as
    /// failed verification, not as a separate error: a forged event is a
    /// forged event.
    pub fn verify(&self) -> bool {
        if !is_hex_of_len(&self.id, 64)
            || !is_hex_of_len(&self.pubkey, 64)
            || !is_hex_of_len(&self.sig, 128)
        {
            return false;
        }

        let unsigned = UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        };
        match unsigned.id() {
            Ok(computed) if computed == self.id => {}
            _ => return false,
        }

        let secp = Secp256k1::verification_only();

        let Ok(id_bytes) = hex::decode(&self.id) else {
            return false;
        };
        let Ok(message) = Message::from_digest_slice(&id_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&self.sig) else {
            return false;
        };
        let Ok(sig) = schnorr::Signature::from_slice(&sig_bytes) else {
            return false;
        };
        let Ok(pubkey_bytes) = hex::decode(&self.pubkey) else {
            return false;
        };
        let Ok(pubkey) = XOnlyPublicKey::from_slice(&pubkey_bytes) else {
            return false;
        };

        secp.verify_schnorr(&sig, &message, &pubkey).is_ok()
    }

    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// First values of every tag named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// X-only public key (32 bytes) for a secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], EventError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| EventError::InvalidSecretKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

/// Hex form of [`get_public_key`].
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, EventError> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Sort events in reverse-chronological order by created_at, ties broken by
/// id ascending. This total order is what paginated queries rely on.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}

/// Event kind classification. Relays (and the local store) treat each class
/// differently: only the latest replaceable event per author survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Stored as-is
    Regular,
    /// Only latest per pubkey+kind is kept
    Replaceable,
    /// Not expected to be stored
    Ephemeral,
    /// Only latest per pubkey+kind+d-tag is kept
    Addressable,
    Unknown,
}

/// Classify an event kind.
pub fn classify_kind(kind: u16) -> KindClass {
    let k = kind as u32;

    if (1000..10000).contains(&k) || (4..45).contains(&k) || k == 1 || k == 2 {
        return KindClass::Regular;
    }
    if (10000..20000).contains(&k) || k == 0 || k == 3 {
        return KindClass::Replaceable;
    }
    if (20000..30000).contains(&k) {
        return KindClass::Ephemeral;
    }
    if (30000..40000).contains(&k) {
        return KindClass::Addressable;
    }

    KindClass::Unknown
}

pub fn is_replaceable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClass::Replaceable)
}

pub fn is_addressable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClass::Addressable)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_secret_key() -> [u8; 32] {
        let bytes = hex::decode(TEST_SECRET).unwrap();
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        key
    }

    fn signed(content: &str, tags: Vec<Vec<String>>) -> Event {
        EventTemplate::new(1, tags, content, 1617932115)
            .sign(&test_secret_key())
            .unwrap()
    }

    #[test]
    fn serialize_matches_canonical_form() {
        let public_key = get_public_key_hex(&test_secret_key()).unwrap();
        let unsigned = UnsignedEvent {
            pubkey: public_key.clone(),
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };

        let expected = format!("[0,\"{public_key}\",1617932115,1,[],\"Hello, world!\"]");
        assert_eq!(unsigned.serialize().unwrap(), expected);
    }

    #[test]
    fn serialize_rejects_bad_pubkey() {
        let unsigned = UnsignedEvent {
            pubkey: "invalid".to_string(),
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: String::new(),
        };
        assert!(unsigned.serialize().is_err());
    }

    #[test]
    fn sign_produces_verifiable_event() {
        let event = signed("Hello, world!", vec![]);
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert_eq!(event.pubkey, get_public_key_hex(&test_secret_key()).unwrap());
        assert!(event.verify());
    }

    #[test]
    fn deterministic_id() {
        let a = signed("same", vec![]);
        let b = signed("same", vec![]);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn tampered_content_fails_verify() {
        let mut event = signed("original", vec![]);
        event.content = "tampered".to_string();
        assert!(!event.verify());
    }

    #[test]
    fn tampered_tags_fail_verify() {
        let mut event = signed("hi", vec![vec!["t".into(), "a".into()]]);
        event.tags[0][1] = "b".to_string();
        assert!(!event.verify());
    }

    #[test]
    fn tampered_sig_fails_verify() {
        let mut event = signed("hi", vec![]);
        let mut sig: Vec<char> = event.sig.chars().collect();
        sig[0] = if sig[0] == 'a' { 'b' } else { 'a' };
        event.sig = sig.into_iter().collect();
        assert!(!event.verify());
    }

    #[test]
    fn swapped_pubkey_fails_verify() {
        let other = hex::decode("5b4a34f4e4b23c63ad55a35e3f84a3b53d96dbf266edf521a8358f71d19cbf67")
            .unwrap();
        let mut other_key = [0u8; 32];
        other_key.copy_from_slice(&other);

        let mut event = signed("hi", vec![]);
        event.pubkey = get_public_key_hex(&other_key).unwrap();
        assert!(!event.verify());
    }

    #[test]
    fn verify_survives_special_characters() {
        let event = signed("line\nbreak\t\"quotes\" \\slash 世界 🌍", vec![]);
        assert!(event.verify());
    }

    #[test]
    fn json_roundtrip_preserves_validity() {
        let event = signed("roundtrip", vec![vec!["t".into(), "chateau".into()]]);
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
        assert!(back.verify());
    }

    #[test]
    fn tag_value_lookup() {
        let event = signed(
            "hi",
            vec![
                vec!["e".into(), "parent".into()],
                vec!["p".into(), "alice".into()],
                vec!["p".into(), "bob".into()],
            ],
        );
        assert_eq!(event.tag_value("e"), Some("parent"));
        assert_eq!(event.tag_value("p"), Some("alice"));
        assert_eq!(event.tag_value("x"), None);
        let ps: Vec<&str> = event.tag_values("p").collect();
        assert_eq!(ps, vec!["alice", "bob"]);
    }

    #[test]
    fn sort_is_created_at_desc_then_id_asc() {
        let mk = |id: &str, at: u64| Event {
            id: id.to_string(),
            pubkey: "a".repeat(64),
            created_at: at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "a".repeat(128),
        };
        let mut events = vec![mk("ccc", 10), mk("bbb", 20), mk("aaa", 20)];
        sort_events(&mut events);
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["aaa", "bbb", "ccc"]);
    }

    #[test]
    fn kind_classes() {
        assert_eq!(classify_kind(1), KindClass::Regular);
        assert_eq!(classify_kind(1111), KindClass::Regular);
        assert_eq!(classify_kind(0), KindClass::Replaceable);
        assert_eq!(classify_kind(10222), KindClass::Replaceable);
        assert_eq!(classify_kind(20000), KindClass::Ephemeral);
        assert_eq!(classify_kind(30063), KindClass::Addressable);
        assert_eq!(classify_kind(32267), KindClass::Addressable);
        assert_eq!(classify_kind(50000), KindClass::Unknown);
        assert!(is_replaceable_kind(10222));
        assert!(is_addressable_kind(30168));
    }
}
