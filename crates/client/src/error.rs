//! Client error taxonomy.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::pool::RelayOutcome;
use crate::signer::SignerError;

/// Errors surfaced by the client layer.
///
/// Validation failures are a property of the data, never retried. Network
/// failures are retried only at the caller's discretion (re-issued fetches),
/// apart from the pool's bounded reconnect for active subscriptions.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Hash or signature mismatch. The event is discarded, never cached.
    #[error("event failed verification: {0}")]
    Validation(String),

    /// Well-signed but semantically incomplete; the raw event stays cached.
    #[error(transparent)]
    Parse(#[from] chateau_core::ModelError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("relay unreachable: {0}")]
    RelayUnreachable(String),

    /// Every targeted relay rejected the event or was unreachable. The
    /// optimistic local copy stays in the store, marked failed, so the user
    /// can see it and retry.
    #[error("publish rejected or undeliverable on all {} target relays", .outcomes.len())]
    PublishFailed {
        outcomes: BTreeMap<String, RelayOutcome>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("wire message error: {0}")]
    Message(#[from] crate::message::MessageError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
