//! Legacy shared-secret content encryption.
//!
//! ECDH over secp256k1 (unhashed x coordinate) keyed AES-256-CBC, with the
//! ciphertext and IV carried as `base64(ct)?iv=base64(iv)`. Kept for
//! interoperability with older counterparties; new payloads should use the
//! versioned scheme in [`crate::nip44`].

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use thiserror::Error;

use crate::nip44::shared_secret_x;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Errors for the legacy encryption scheme.
#[derive(Debug, Error)]
pub enum Nip04Error {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("decryption failed")]
    DecryptionFailed,
}

/// Encrypt `plaintext` to `counterparty_pubkey` (x-only hex).
pub fn nip04_encrypt(
    secret_key: &[u8; 32],
    counterparty_pubkey: &str,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let key = shared_secret_x(secret_key, counterparty_pubkey)
        .map_err(|e| Nip04Error::InvalidKey(e.to_string()))?;

    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}?iv={}",
        BASE64.encode(ciphertext),
        BASE64.encode(iv)
    ))
}

/// Decrypt a `base64(ct)?iv=base64(iv)` payload from `counterparty_pubkey`.
///
/// A wrong counterparty key fails (bad padding or non-UTF-8 plaintext); it
/// never silently returns garbage.
pub fn nip04_decrypt(
    secret_key: &[u8; 32],
    counterparty_pubkey: &str,
    payload: &str,
) -> Result<String, Nip04Error> {
    let (ct_b64, iv_b64) = payload
        .split_once("?iv=")
        .ok_or_else(|| Nip04Error::InvalidPayload("missing ?iv= separator".to_string()))?;

    let ciphertext = BASE64
        .decode(ct_b64)
        .map_err(|e| Nip04Error::InvalidPayload(format!("bad ciphertext base64: {e}")))?;
    let iv_bytes = BASE64
        .decode(iv_b64)
        .map_err(|e| Nip04Error::InvalidPayload(format!("bad iv base64: {e}")))?;
    let iv: [u8; 16] = iv_bytes
        .as_slice()
        .try_into()
        .map_err(|_| Nip04Error::InvalidPayload("iv must be 16 bytes".to_string()))?;

    let key = shared_secret_x(secret_key, counterparty_pubkey)
        .map_err(|e| Nip04Error::InvalidKey(e.to_string()))?;

    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Nip04Error::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| Nip04Error::DecryptionFailed)
}
