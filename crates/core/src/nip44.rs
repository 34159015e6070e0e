//! Versioned content encryption, version 2.
//!
//! ECDH over secp256k1 feeds HKDF-SHA256 (salt `nip44-v2`) to derive a
//! per-pair conversation key; each message draws ChaCha20 and HMAC keys from
//! the conversation key and a fresh 32-byte nonce. The payload is
//! `base64(version || nonce || ciphertext || mac)` with the plaintext padded
//! to coarse size buckets so payload length leaks less.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bitcoin::secp256k1::{Parity, PublicKey, SecretKey, XOnlyPublicKey, ecdh};
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Version byte this implementation produces and accepts.
pub const VERSION: u8 = 0x02;

const NONCE_SIZE: usize = 32;
const MAC_SIZE: usize = 32;
const MIN_PLAINTEXT: usize = 1;
const MAX_PLAINTEXT: usize = 65535;

/// Errors for the versioned encryption scheme.
#[derive(Debug, Error)]
pub enum Nip44Error {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unsupported version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("plaintext length {0} out of range")]
    PlaintextLength(usize),

    #[error("authentication failed")]
    AuthenticationFailed,
}

/// Unhashed x coordinate of the ECDH shared point between `secret_key` and
/// the x-only `counterparty_pubkey`. Shared by both encryption schemes.
pub(crate) fn shared_secret_x(
    secret_key: &[u8; 32],
    counterparty_pubkey: &str,
) -> Result<[u8; 32], Nip44Error> {
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;

    let pk_bytes = hex::decode(counterparty_pubkey)
        .map_err(|e| Nip44Error::InvalidKey(format!("bad pubkey hex: {e}")))?;
    let xonly = XOnlyPublicKey::from_slice(&pk_bytes)
        .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;
    let pk = PublicKey::from_x_only_public_key(xonly, Parity::Even);

    let point = ecdh::shared_secret_point(&pk, &sk);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    Ok(x)
}

/// Conversation key: HKDF-extract of the shared x with salt `nip44-v2`.
/// Symmetric — both counterparts derive the same key.
fn conversation_key(
    secret_key: &[u8; 32],
    counterparty_pubkey: &str,
) -> Result<[u8; 32], Nip44Error> {
    let shared = shared_secret_x(secret_key, counterparty_pubkey)?;
    let (prk, _) = Hkdf::<Sha256>::extract(Some(b"nip44-v2".as_slice()), &shared);
    let mut key = [0u8; 32];
    key.copy_from_slice(&prk);
    Ok(key)
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

fn message_keys(conv_key: &[u8; 32], nonce: &[u8; NONCE_SIZE]) -> Result<MessageKeys, Nip44Error> {
    let hk = Hkdf::<Sha256>::from_prk(conv_key)
        .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;

    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[0..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..76]);
    Ok(keys)
}

/// Padded length for a plaintext of `len` bytes (not counting the 2-byte
/// length prefix): 32-byte floor, then power-of-two-derived chunk sizes.
fn calc_padded_len(len: usize) -> usize {
    if len <= 32 {
        return 32;
    }
    let x = (len - 1) as u32;
    let next_power = 1usize << (32 - x.leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT..=MAX_PLAINTEXT).contains(&len) {
        return Err(Nip44Error::PlaintextLength(len));
    }
    let mut padded = Vec::with_capacity(2 + calc_padded_len(len));
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + calc_padded_len(len), 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    if padded.len() < 2 {
        return Err(Nip44Error::InvalidPayload("padded data too short".to_string()));
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if !(MIN_PLAINTEXT..=MAX_PLAINTEXT).contains(&len)
        || padded.len() != 2 + calc_padded_len(len)
    {
        return Err(Nip44Error::InvalidPayload("invalid padding".to_string()));
    }
    Ok(padded[2..2 + len].to_vec())
}

fn encrypt_with_nonce(
    conv_key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &str,
) -> Result<String, Nip44Error> {
    let keys = message_keys(conv_key, nonce)?;

    let mut buf = pad(plaintext.as_bytes())?;
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buf);

    let mut mac = Hmac::<Sha256>::new_from_slice(&keys.hmac_key)
        .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;
    mac.update(nonce);
    mac.update(&buf);
    let tag = mac.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + NONCE_SIZE + buf.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&buf);
    payload.extend_from_slice(&tag);
    Ok(BASE64.encode(payload))
}

/// Encrypt `plaintext` to `counterparty_pubkey` (x-only hex) with a fresh
/// random nonce.
pub fn nip44_encrypt(
    secret_key: &[u8; 32],
    counterparty_pubkey: &str,
    plaintext: &str,
) -> Result<String, Nip44Error> {
    let conv_key = conversation_key(secret_key, counterparty_pubkey)?;
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(&conv_key, &nonce, plaintext)
}

/// Decrypt a payload from `counterparty_pubkey` (x-only hex). The MAC is
/// checked before decryption; a wrong counterparty key fails here.
pub fn nip44_decrypt(
    secret_key: &[u8; 32],
    counterparty_pubkey: &str,
    payload: &str,
) -> Result<String, Nip44Error> {
    let data = BASE64
        .decode(payload)
        .map_err(|e| Nip44Error::InvalidPayload(format!("bad base64: {e}")))?;

    if data.len() < 1 + NONCE_SIZE + 32 + MAC_SIZE {
        return Err(Nip44Error::InvalidPayload("payload too short".to_string()));
    }
    if data[0] != VERSION {
        return Err(Nip44Error::UnsupportedVersion(data[0]));
    }

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&data[1..1 + NONCE_SIZE]);
    let ciphertext = &data[1 + NONCE_SIZE..data.len() - MAC_SIZE];
    let tag = &data[data.len() - MAC_SIZE..];

    let conv_key = conversation_key(secret_key, counterparty_pubkey)?;
    let keys = message_keys(&conv_key, &nonce)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(&keys.hmac_key)
        .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;
    mac.update(&nonce);
    mac.update(ciphertext);
    mac.verify_slice(tag)
        .map_err(|_| Nip44Error::AuthenticationFailed)?;

    let mut buf = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buf);

    let plaintext = unpad(&buf)?;
    String::from_utf8(plaintext)
        .map_err(|_| Nip44Error::InvalidPayload("plaintext is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip01::{generate_secret_key, get_public_key_hex};

    #[test]
    fn roundtrip_between_counterparts() {
        let alice = generate_secret_key();
        let bob = generate_secret_key();
        let alice_pub = get_public_key_hex(&alice).unwrap();
        let bob_pub = get_public_key_hex(&bob).unwrap();

        let payload = nip44_encrypt(&alice, &bob_pub, "form response body").unwrap();
        let plaintext = nip44_decrypt(&bob, &alice_pub, &payload).unwrap();
        assert_eq!(plaintext, "form response body");
    }

    #[test]
    fn wrong_counterparty_fails_authentication() {
        let alice = generate_secret_key();
        let bob = generate_secret_key();
        let eve = generate_secret_key();
        let alice_pub = get_public_key_hex(&alice).unwrap();
        let bob_pub = get_public_key_hex(&bob).unwrap();

        let payload = nip44_encrypt(&alice, &bob_pub, "secret").unwrap();
        let err = nip44_decrypt(&eve, &alice_pub, &payload).unwrap_err();
        assert!(matches!(err, Nip44Error::AuthenticationFailed));
    }

    #[test]
    fn tampered_payload_fails_authentication() {
        let alice = generate_secret_key();
        let bob = generate_secret_key();
        let alice_pub = get_public_key_hex(&alice).unwrap();
        let bob_pub = get_public_key_hex(&bob).unwrap();

        let payload = nip44_encrypt(&alice, &bob_pub, "secret").unwrap();
        let mut raw = BASE64.decode(&payload).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        let tampered = BASE64.encode(raw);

        assert!(nip44_decrypt(&bob, &alice_pub, &tampered).is_err());
    }

    #[test]
    fn rejects_unknown_version() {
        let alice = generate_secret_key();
        let bob = generate_secret_key();
        let alice_pub = get_public_key_hex(&alice).unwrap();
        let bob_pub = get_public_key_hex(&bob).unwrap();

        let payload = nip44_encrypt(&alice, &bob_pub, "secret").unwrap();
        let mut raw = BASE64.decode(&payload).unwrap();
        raw[0] = 0x01;
        let downgraded = BASE64.encode(raw);

        assert!(matches!(
            nip44_decrypt(&bob, &alice_pub, &downgraded),
            Err(Nip44Error::UnsupportedVersion(0x01))
        ));
    }

    #[test]
    fn rejects_empty_and_oversized_plaintext() {
        let alice = generate_secret_key();
        let bob_pub = get_public_key_hex(&generate_secret_key()).unwrap();

        assert!(matches!(
            nip44_encrypt(&alice, &bob_pub, ""),
            Err(Nip44Error::PlaintextLength(0))
        ));
        let huge = "x".repeat(65536);
        assert!(matches!(
            nip44_encrypt(&alice, &bob_pub, &huge),
            Err(Nip44Error::PlaintextLength(65536))
        ));
    }

    #[test]
    fn padded_lengths_bucket_correctly() {
        assert_eq!(calc_padded_len(1), 32);
        assert_eq!(calc_padded_len(32), 32);
        assert_eq!(calc_padded_len(33), 64);
        assert_eq!(calc_padded_len(37), 64);
        assert_eq!(calc_padded_len(64), 64);
        assert_eq!(calc_padded_len(65), 96);
        assert_eq!(calc_padded_len(100), 128);
        assert_eq!(calc_padded_len(256), 256);
        assert_eq!(calc_padded_len(257), 320);
        assert_eq!(calc_padded_len(1000), 1024);
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let alice = generate_secret_key();
        let bob = generate_secret_key();
        let alice_pub = get_public_key_hex(&alice).unwrap();
        let bob_pub = get_public_key_hex(&bob).unwrap();

        let k1 = conversation_key(&alice, &bob_pub).unwrap();
        let k2 = conversation_key(&bob, &alice_pub).unwrap();
        assert_eq!(k1, k2);
    }
}
