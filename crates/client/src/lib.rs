//! Client data layer for chateau.
//!
//! This crate provides:
//! - WebSocket connections to relays, pooled, with bounded reconnect
//! - One-shot fetches, deduplicated long-lived subscriptions, and
//!   per-relay publish outcomes
//! - A durable local event store with reactive queries
//! - The signing session (extension-backed or locally held secret)
//! - A publisher with optimistic local writes and later reconciliation
//! - Zap request building and receipt aggregation
//!
//! # Example
//!
//! ```rust,no_run
//! use chateau_client::{Chateau, ChateauConfig, Filter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let chateau = Chateau::new(ChateauConfig {
//!         relays: vec![
//!             "wss://relay.damus.io".to_string(),
//!             "wss://nos.lol".to_string(),
//!         ],
//!         ..ChateauConfig::default()
//!     })?;
//!
//!     // Reactive view: the UI gets the cached set immediately and every
//!     // change after.
//!     let mut live = chateau.live(Filter::new().kinds(vec![10222]))?;
//!
//!     // One-shot fetch populates the cache from the network.
//!     let communities = chateau.fetch_communities(&[]).await?;
//!     println!("{} communities", communities.len());
//!
//!     while let Some(events) = live.recv().await {
//!         println!("view now has {} events", events.len());
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod filter;
mod message;
mod pool;
mod publisher;
mod relay;
mod service;
mod session;
mod settings;
mod signer;
mod store;
mod zaps;

pub use error::{ClientError, Result};
pub use filter::Filter;
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use pool::{FetchResult, RelayOutcome, RelayPool, SubscriptionHandle, SubscriptionMessage};
pub use publisher::{PendingPublish, PublishResult, Publisher};
pub use relay::{Backoff, RelayConnection, RelayEvent, RelayEventKind, RelayStatus};
pub use service::{Chateau, ChateauConfig, unix_now};
pub use session::Session;
pub use settings::{PUBKEY_SETTING, SECRET_SETTING, Settings};
pub use signer::{
    EncryptionScheme, ExtensionSigner, LocalSigner, SignerBackend, SignerError, SignerRequest,
    SignerRequestPayload, SignerResponse,
};
pub use store::{EventStore, LiveQuery, PublishStatus};
pub use zaps::{ZapTotals, Zaps, aggregate_receipts};
