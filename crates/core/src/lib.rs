//! Protocol core for the chateau data layer.
//!
//! This crate holds everything that does not touch the network or disk:
//! - Event structure, canonical serialization, signing and verification
//! - The two content-encryption schemes (legacy shared-secret and versioned)
//! - bech32-encoded entities (npub, nsec, note, naddr)
//! - Zap request/receipt construction and parsing
//! - Per-kind semantic projections over validated events
//!
//! Everything here is pure: callers feed in events (or key material) and get
//! structured records or errors back. Network fetching, caching, and signing
//! sessions live in `chateau-client`.

mod models;
mod nip01;
mod nip04;
mod nip19;
mod nip44;
mod nip57;

pub use nip01::{
    Event, EventError, EventTemplate, KindClass, UnsignedEvent, classify_kind,
    generate_secret_key, get_public_key, get_public_key_hex, is_addressable_kind,
    is_replaceable_kind, sort_events,
};

pub use nip04::{Nip04Error, nip04_decrypt, nip04_encrypt};
pub use nip44::{Nip44Error, nip44_decrypt, nip44_encrypt};

pub use nip19::{
    Naddr, Nip19Error, decode_naddr, decode_nsec, encode_naddr, encode_npub, encode_nsec,
    encode_note,
};

pub use nip57::{ZAP_RECEIPT_KIND, ZAP_REQUEST_KIND, Nip57Error, ZapReceipt, ZapRequest, ZapTarget};

pub use models::{
    APP_KIND, APP_STACK_KIND, COMMENT_KIND, COMMUNITY_KIND, FILE_METADATA_KIND,
    FORM_RESPONSE_KIND, FORM_TEMPLATE_KIND, FORUM_POST_KIND, PROFILE_KIND, PROFILE_LIST_KIND,
    RELEASE_KIND, AppMetadata, AppRelease, AppStack, Comment, Community, FileMetadata,
    FormField, FormResponse, FormTemplate, ForumPost, ModelError, Profile, ProfileList, Record,
    decode_record,
};
