//! Signing backends.
//!
//! Two interchangeable ways to sign and decrypt for the current user: a
//! locally held secret key, and an external key-custody agent (a browser
//! extension or platform signer) spoken to over a request/response channel.
//! The agent's latency is unbounded — it may be waiting on user approval —
//! so nothing here assumes a timely answer.

use chateau_core::{
    Event, EventError, EventTemplate, decode_nsec, get_public_key_hex, nip04_decrypt,
    nip04_encrypt, nip44_decrypt, nip44_encrypt,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Identity-layer errors. Surfaced to the caller as actionable conditions,
/// never retried automatically.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("not signed in")]
    NotSignedIn,

    #[error("the active signer does not support {0}")]
    UnsupportedCapability(&'static str),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// The active identity changed while this operation was in flight; it
    /// must not complete against the previous key material.
    #[error("identity changed during operation")]
    IdentityChanged,

    #[error("external signer error: {0}")]
    Extension(String),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("encryption error: {0}")]
    Crypto(String),
}

/// The two content-encryption schemes a signer can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionScheme {
    /// Legacy shared-secret scheme
    Legacy,
    /// Versioned scheme (v2)
    Versioned,
}

impl EncryptionScheme {
    fn name(self) -> &'static str {
        match self {
            EncryptionScheme::Legacy => "legacy encryption",
            EncryptionScheme::Versioned => "versioned encryption",
        }
    }
}

/// A signer holding the secret key in memory. Supports every capability.
#[derive(Clone)]
pub struct LocalSigner {
    secret: [u8; 32],
    pubkey: String,
}

impl LocalSigner {
    /// Accepts an `nsec1...` bech32 string or 64 hex characters; anything
    /// else is invalid key material.
    pub fn from_key(input: &str) -> Result<Self, SignerError> {
        let input = input.trim();
        let secret: [u8; 32] = if input.starts_with("nsec") {
            decode_nsec(input).map_err(|e| SignerError::InvalidKeyMaterial(e.to_string()))?
        } else if input.len() == 64 && input.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut key = [0u8; 32];
            let bytes = hex::decode(input)
                .map_err(|e| SignerError::InvalidKeyMaterial(e.to_string()))?;
            key.copy_from_slice(&bytes);
            key
        } else {
            return Err(SignerError::InvalidKeyMaterial(
                "use nsec1... or 64-character hex".to_string(),
            ));
        };

        let pubkey = get_public_key_hex(&secret)
            .map_err(|e| SignerError::InvalidKeyMaterial(e.to_string()))?;
        Ok(Self { secret, pubkey })
    }

    pub fn generate() -> Self {
        let secret = chateau_core::generate_secret_key();
        let pubkey = get_public_key_hex(&secret).unwrap_or_default();
        Self { secret, pubkey }
    }

    pub fn public_key(&self) -> &str {
        &self.pubkey
    }

    pub fn sign_event(&self, template: &EventTemplate) -> Result<Event, SignerError> {
        Ok(template.sign(&self.secret)?)
    }

    pub fn encrypt(
        &self,
        scheme: EncryptionScheme,
        counterparty: &str,
        plaintext: &str,
    ) -> Result<String, SignerError> {
        match scheme {
            EncryptionScheme::Legacy => nip04_encrypt(&self.secret, counterparty, plaintext)
                .map_err(|e| SignerError::Crypto(e.to_string())),
            EncryptionScheme::Versioned => nip44_encrypt(&self.secret, counterparty, plaintext)
                .map_err(|e| SignerError::Crypto(e.to_string())),
        }
    }

    pub fn decrypt(
        &self,
        scheme: EncryptionScheme,
        counterparty: &str,
        ciphertext: &str,
    ) -> Result<String, SignerError> {
        match scheme {
            EncryptionScheme::Legacy => nip04_decrypt(&self.secret, counterparty, ciphertext)
                .map_err(|e| SignerError::Crypto(e.to_string())),
            EncryptionScheme::Versioned => nip44_decrypt(&self.secret, counterparty, ciphertext)
                .map_err(|e| SignerError::Crypto(e.to_string())),
        }
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("pubkey", &self.pubkey)
            .field("secret", &"<hidden>")
            .finish()
    }
}

/// One request across the capability boundary to the external agent.
#[derive(Debug)]
pub struct SignerRequest {
    pub payload: SignerRequestPayload,
    pub reply: oneshot::Sender<SignerResponse>,
}

#[derive(Debug, Clone)]
pub enum SignerRequestPayload {
    GetPublicKey,
    SignEvent(EventTemplate),
    Encrypt {
        scheme: EncryptionScheme,
        counterparty: String,
        plaintext: String,
    },
    Decrypt {
        scheme: EncryptionScheme,
        counterparty: String,
        ciphertext: String,
    },
}

#[derive(Debug, Clone)]
pub enum SignerResponse {
    PublicKey(String),
    SignedEvent(Event),
    Text(String),
    /// The agent does not implement the requested capability
    Unsupported,
    /// The user declined, or the agent failed
    Denied(String),
}

/// A signer backed by an external key-custody agent. Secrets never leave
/// the agent; every operation is a round trip on the request channel.
#[derive(Clone)]
pub struct ExtensionSigner {
    requests: mpsc::UnboundedSender<SignerRequest>,
}

impl ExtensionSigner {
    pub fn new(requests: mpsc::UnboundedSender<SignerRequest>) -> Self {
        Self { requests }
    }

    async fn request(&self, payload: SignerRequestPayload) -> Result<SignerResponse, SignerError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(SignerRequest { payload, reply })
            .map_err(|_| SignerError::Extension("signer is gone".to_string()))?;
        response
            .await
            .map_err(|_| SignerError::Extension("signer dropped the request".to_string()))
    }

    pub async fn get_public_key(&self) -> Result<String, SignerError> {
        match self.request(SignerRequestPayload::GetPublicKey).await? {
            SignerResponse::PublicKey(pk) => Ok(pk),
            SignerResponse::Denied(reason) => Err(SignerError::Extension(reason)),
            _ => Err(SignerError::Extension("unexpected response".to_string())),
        }
    }

    pub async fn sign_event(&self, template: &EventTemplate) -> Result<Event, SignerError> {
        match self
            .request(SignerRequestPayload::SignEvent(template.clone()))
            .await?
        {
            SignerResponse::SignedEvent(event) => {
                // The agent is trusted with keys, not with correctness.
                if !event.verify() {
                    return Err(SignerError::Extension(
                        "returned event fails verification".to_string(),
                    ));
                }
                Ok(event)
            }
            SignerResponse::Unsupported => Err(SignerError::UnsupportedCapability("signing")),
            SignerResponse::Denied(reason) => Err(SignerError::Extension(reason)),
            _ => Err(SignerError::Extension("unexpected response".to_string())),
        }
    }

    pub async fn encrypt(
        &self,
        scheme: EncryptionScheme,
        counterparty: &str,
        plaintext: &str,
    ) -> Result<String, SignerError> {
        match self
            .request(SignerRequestPayload::Encrypt {
                scheme,
                counterparty: counterparty.to_string(),
                plaintext: plaintext.to_string(),
            })
            .await?
        {
            SignerResponse::Text(ciphertext) => Ok(ciphertext),
            SignerResponse::Unsupported => Err(SignerError::UnsupportedCapability(scheme.name())),
            SignerResponse::Denied(reason) => Err(SignerError::Extension(reason)),
            _ => Err(SignerError::Extension("unexpected response".to_string())),
        }
    }

    pub async fn decrypt(
        &self,
        scheme: EncryptionScheme,
        counterparty: &str,
        ciphertext: &str,
    ) -> Result<String, SignerError> {
        match self
            .request(SignerRequestPayload::Decrypt {
                scheme,
                counterparty: counterparty.to_string(),
                ciphertext: ciphertext.to_string(),
            })
            .await?
        {
            SignerResponse::Text(plaintext) => Ok(plaintext),
            SignerResponse::Unsupported => Err(SignerError::UnsupportedCapability(scheme.name())),
            SignerResponse::Denied(reason) => Err(SignerError::Extension(reason)),
            _ => Err(SignerError::Extension("unexpected response".to_string())),
        }
    }
}

/// The active backend: exactly one of the two at a time.
#[derive(Clone)]
pub enum SignerBackend {
    Local(LocalSigner),
    Extension(ExtensionSigner),
}

impl SignerBackend {
    pub async fn sign_event(&self, template: &EventTemplate) -> Result<Event, SignerError> {
        match self {
            SignerBackend::Local(signer) => signer.sign_event(template),
            SignerBackend::Extension(signer) => signer.sign_event(template).await,
        }
    }

    pub async fn encrypt(
        &self,
        scheme: EncryptionScheme,
        counterparty: &str,
        plaintext: &str,
    ) -> Result<String, SignerError> {
        match self {
            SignerBackend::Local(signer) => signer.encrypt(scheme, counterparty, plaintext),
            SignerBackend::Extension(signer) => {
                signer.encrypt(scheme, counterparty, plaintext).await
            }
        }
    }

    pub async fn decrypt(
        &self,
        scheme: EncryptionScheme,
        counterparty: &str,
        ciphertext: &str,
    ) -> Result<String, SignerError> {
        match self {
            SignerBackend::Local(signer) => signer.decrypt(scheme, counterparty, ciphertext),
            SignerBackend::Extension(signer) => {
                signer.decrypt(scheme, counterparty, ciphertext).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chateau_core::encode_nsec;

    #[test]
    fn local_signer_accepts_hex_and_nsec() {
        let secret = chateau_core::generate_secret_key();
        let from_hex = LocalSigner::from_key(&hex::encode(secret)).unwrap();
        let from_nsec = LocalSigner::from_key(&encode_nsec(&secret).unwrap()).unwrap();
        assert_eq!(from_hex.public_key(), from_nsec.public_key());
    }

    #[test]
    fn local_signer_rejects_garbage() {
        for input in ["", "nsec1notbech32!!!", "abc123", "z".repeat(64).as_str()] {
            assert!(matches!(
                LocalSigner::from_key(input),
                Err(SignerError::InvalidKeyMaterial(_))
            ));
        }
    }

    #[test]
    fn local_signer_signs_verifiable_events() {
        let signer = LocalSigner::generate();
        let template = EventTemplate::new(1, vec![], "hello", 1700000000);
        let event = signer.sign_event(&template).unwrap();
        assert!(event.verify());
        assert_eq!(event.pubkey, signer.public_key());
    }

    #[test]
    fn local_signer_round_trips_both_schemes() {
        let alice = LocalSigner::generate();
        let bob = LocalSigner::generate();

        for scheme in [EncryptionScheme::Legacy, EncryptionScheme::Versioned] {
            let ct = alice.encrypt(scheme, bob.public_key(), "psst").unwrap();
            let pt = bob.decrypt(scheme, alice.public_key(), &ct).unwrap();
            assert_eq!(pt, "psst");
        }
    }

    #[tokio::test]
    async fn extension_signer_reports_unsupported_capability() {
        let (tx, mut rx) = mpsc::unbounded_channel::<SignerRequest>();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.reply.send(SignerResponse::Unsupported);
            }
        });

        let signer = ExtensionSigner::new(tx);
        let err = signer
            .encrypt(EncryptionScheme::Versioned, "peer", "text")
            .await
            .unwrap_err();
        assert!(matches!(err, SignerError::UnsupportedCapability(_)));
    }

    #[tokio::test]
    async fn extension_signer_rejects_forged_results() {
        let local = LocalSigner::generate();
        let (tx, mut rx) = mpsc::unbounded_channel::<SignerRequest>();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                if let SignerRequestPayload::SignEvent(template) = req.payload {
                    let mut event = local.sign_event(&template).unwrap();
                    event.content.push_str(" (tampered)");
                    let _ = req.reply.send(SignerResponse::SignedEvent(event));
                }
            }
        });

        let signer = ExtensionSigner::new(tx);
        let template = EventTemplate::new(1, vec![], "hello", 1700000000);
        assert!(matches!(
            signer.sign_event(&template).await,
            Err(SignerError::Extension(_))
        ));
    }
}
