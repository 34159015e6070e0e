//! The active identity.
//!
//! Process-wide singleton state for "who can sign and decrypt right now":
//! nothing, an extension-backed identity, or a locally held secret. The
//! active identity is swapped atomically — an `Arc` snapshot plus a
//! generation counter — so switching identities can never race an in-flight
//! sign or encrypt call against the new backend: the stale operation fails
//! with [`SignerError::IdentityChanged`] instead.
//!
//! Only the public identity (and, for the local backend, the secret as the
//! user entered it) is persisted, under fixed setting names. Extension-held
//! secrets never leave the extension.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chateau_core::{Event, EventTemplate};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::settings::{PUBKEY_SETTING, SECRET_SETTING, Settings};
use crate::signer::{
    EncryptionScheme, ExtensionSigner, LocalSigner, SignerBackend, SignerError, SignerRequest,
};

struct ActiveIdentity {
    pubkey: String,
    backend: SignerBackend,
    generation: u64,
}

/// The signing/decrypting session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    active: Arc<RwLock<Option<Arc<ActiveIdentity>>>>,
    generation: Arc<AtomicU64>,
    settings: Settings,
}

impl Session {
    /// Create a session, restoring a locally held secret from settings when
    /// one was persisted. A remembered extension identity restores only its
    /// public key; signing waits until the extension reconnects.
    pub fn new(settings: Settings) -> Self {
        let session = Self {
            active: Arc::new(RwLock::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            settings,
        };

        if let Some(secret) = session.settings.get(SECRET_SETTING) {
            match LocalSigner::from_key(&secret) {
                Ok(signer) => {
                    session.install(signer.public_key().to_string(), SignerBackend::Local(signer));
                }
                Err(e) => {
                    // A stored secret that no longer parses is dropped, the
                    // way the original treats corrupt stored keys.
                    warn!("stored secret is invalid, discarding: {e}");
                    let _ = session.settings.remove(SECRET_SETTING);
                }
            }
        }

        session
    }

    fn install(&self, pubkey: String, backend: SignerBackend) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let identity = ActiveIdentity {
            pubkey,
            backend,
            generation,
        };
        *self.write() = Some(Arc::new(identity));
        generation
    }

    /// The active public identity, falling back to the remembered one from
    /// a previous session. `None` means not signed in.
    pub fn public_key(&self) -> Option<String> {
        if let Some(identity) = self.read().as_ref() {
            return Some(identity.pubkey.clone());
        }
        self.settings.get(PUBKEY_SETTING)
    }

    pub fn is_signed_in(&self) -> bool {
        self.read().is_some()
    }

    /// Connect the extension-backed identity. Asks the agent for its public
    /// key (which may wait on user approval indefinitely), then installs it
    /// atomically. Any stored local secret is cleared: the two backends
    /// never coexist.
    pub async fn connect_extension(
        &self,
        requests: mpsc::UnboundedSender<SignerRequest>,
    ) -> Result<String, SignerError> {
        let signer = ExtensionSigner::new(requests);
        let pubkey = signer.get_public_key().await?;

        let _ = self.settings.remove(SECRET_SETTING);
        let _ = self.settings.set(PUBKEY_SETTING, &pubkey);
        self.install(pubkey.clone(), SignerBackend::Extension(signer));

        info!("signed in with extension identity {pubkey}");
        Ok(pubkey)
    }

    /// Connect with a pasted secret (`nsec1...` or hex). Supersedes any
    /// extension session atomically. The secret is persisted as entered —
    /// as safe as local storage gets.
    pub fn connect_with_secret(&self, input: &str) -> Result<String, SignerError> {
        let input = input.trim();
        let signer = LocalSigner::from_key(input)?;
        let pubkey = signer.public_key().to_string();

        let _ = self.settings.set(PUBKEY_SETTING, &pubkey);
        let _ = self.settings.set(SECRET_SETTING, input);
        self.install(pubkey.clone(), SignerBackend::Local(signer));

        info!("signed in with local identity {pubkey}");
        Ok(pubkey)
    }

    /// Drop the active identity and forget the persisted one.
    pub fn sign_out(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.write() = None;
        let _ = self.settings.remove(PUBKEY_SETTING);
        let _ = self.settings.remove(SECRET_SETTING);
        info!("signed out");
    }

    fn snapshot(&self) -> Result<Arc<ActiveIdentity>, SignerError> {
        self.read().clone().ok_or(SignerError::NotSignedIn)
    }

    /// Fail the operation if the identity changed while it was in flight.
    fn still_current(&self, identity: &ActiveIdentity) -> Result<(), SignerError> {
        if self.generation.load(Ordering::SeqCst) != identity.generation {
            return Err(SignerError::IdentityChanged);
        }
        Ok(())
    }

    /// Sign an event template with the active identity.
    pub async fn sign(&self, template: &EventTemplate) -> Result<Event, SignerError> {
        let identity = self.snapshot()?;
        let event = identity.backend.sign_event(template).await?;
        self.still_current(&identity)?;
        Ok(event)
    }

    pub async fn encrypt(
        &self,
        scheme: EncryptionScheme,
        counterparty: &str,
        plaintext: &str,
    ) -> Result<String, SignerError> {
        let identity = self.snapshot()?;
        let ciphertext = identity
            .backend
            .encrypt(scheme, counterparty, plaintext)
            .await?;
        self.still_current(&identity)?;
        Ok(ciphertext)
    }

    pub async fn decrypt(
        &self,
        scheme: EncryptionScheme,
        counterparty: &str,
        ciphertext: &str,
    ) -> Result<String, SignerError> {
        let identity = self.snapshot()?;
        let plaintext = identity
            .backend
            .decrypt(scheme, counterparty, ciphertext)
            .await?;
        self.still_current(&identity)?;
        Ok(plaintext)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<ActiveIdentity>>> {
        match self.active.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<ActiveIdentity>>> {
        match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
