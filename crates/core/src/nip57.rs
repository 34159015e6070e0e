//! Zap requests and receipts.
//!
//! A zap is a micropayment acknowledgement attached to an event or profile,
//! represented as a request/receipt pair: the request (kind 9734) is signed
//! by the sender and handed to the recipient's payment endpoint; the receipt
//! (kind 9735) is published by that endpoint with the original request
//! embedded in its `description` tag.
//!
//! A receipt's outer signature only proves who published it. Its
//! authenticity as a zap is otherwise unconstrained (anyone could publish a
//! receipt referencing someone else's event), so parsing requires the
//! embedded request to carry a valid signature of its own.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nip01::{Event, EventTemplate};

/// Event kind for zap requests.
pub const ZAP_REQUEST_KIND: u16 = 9734;

/// Event kind for zap receipts.
pub const ZAP_RECEIPT_KIND: u16 = 9735;

/// Errors that can occur while building or parsing zaps.
#[derive(Debug, Error)]
pub enum Nip57Error {
    #[error("wrong kind: expected {expected}, got {got}")]
    WrongKind { expected: u16, got: u16 },

    #[error("missing required tag: {0}")]
    MissingTag(&'static str),

    #[error("invalid tag value: {0}")]
    InvalidTagValue(String),

    #[error("embedded zap request is not valid JSON: {0}")]
    MalformedDescription(String),

    #[error("embedded zap request failed verification")]
    EmbeddedRequestInvalid,
}

/// What a zap points at: a specific event, or an author's profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZapTarget {
    Event { id: String, author: String },
    Profile { pubkey: String },
}

/// A parsed zap request (kind 9734).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZapRequest {
    /// Recipient pubkey (`p` tag)
    pub recipient_pubkey: String,
    /// Zapped event id (`e` tag), absent for profile zaps
    pub zapped_event: Option<String>,
    /// Relays the receipt should be published to
    pub relays: Vec<String>,
    /// Amount in millisats (`amount` tag)
    pub amount_msats: Option<u64>,
    /// Sender comment
    pub content: String,
    /// Sender asked not to be identified (`anon` tag)
    pub anonymous: bool,
}

impl ZapRequest {
    /// Build an unsigned zap-request template for `target`. The caller signs
    /// it and delivers it to the recipient's payment endpoint; it is not
    /// published to relays directly.
    pub fn build(
        target: &ZapTarget,
        amount_msats: u64,
        comment: &str,
        relays: &[String],
        created_at: u64,
    ) -> EventTemplate {
        let mut tags: Vec<Vec<String>> = Vec::new();

        let mut relay_tag = vec!["relays".to_string()];
        relay_tag.extend(relays.iter().cloned());
        tags.push(relay_tag);
        tags.push(vec!["amount".to_string(), amount_msats.to_string()]);

        match target {
            ZapTarget::Event { id, author } => {
                tags.push(vec!["p".to_string(), author.clone()]);
                tags.push(vec!["e".to_string(), id.clone()]);
            }
            ZapTarget::Profile { pubkey } => {
                tags.push(vec!["p".to_string(), pubkey.clone()]);
            }
        }

        EventTemplate::new(ZAP_REQUEST_KIND, tags, comment, created_at)
    }

    /// Parse a zap request from an event. Requires exactly one `p` tag and
    /// at most one `e` tag.
    pub fn from_event(event: &Event) -> Result<Self, Nip57Error> {
        if event.kind != ZAP_REQUEST_KIND {
            return Err(Nip57Error::WrongKind {
                expected: ZAP_REQUEST_KIND,
                got: event.kind,
            });
        }

        let p_tags: Vec<&str> = event.tag_values("p").collect();
        if p_tags.len() > 1 {
            return Err(Nip57Error::InvalidTagValue("multiple p tags".to_string()));
        }
        let recipient_pubkey = p_tags
            .first()
            .copied()
            .ok_or(Nip57Error::MissingTag("p"))?
            .to_string();

        let e_tags: Vec<&str> = event.tag_values("e").collect();
        if e_tags.len() > 1 {
            return Err(Nip57Error::InvalidTagValue("multiple e tags".to_string()));
        }

        let amount_msats = match event.tag_value("amount") {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| Nip57Error::InvalidTagValue(format!("bad amount: {raw}")))?,
            ),
            None => None,
        };

        let relays = event
            .tags
            .iter()
            .find(|t| !t.is_empty() && t[0] == "relays")
            .map(|t| t[1..].to_vec())
            .unwrap_or_default();

        Ok(Self {
            recipient_pubkey,
            zapped_event: e_tags.first().map(|s| s.to_string()),
            relays,
            amount_msats,
            content: event.content.clone(),
            anonymous: event.tags.iter().any(|t| !t.is_empty() && t[0] == "anon"),
        })
    }
}

/// A parsed zap receipt (kind 9735).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZapReceipt {
    /// Id of the receipt event itself (dedup key for aggregation)
    pub receipt_id: String,
    /// Recipient pubkey (`p` tag)
    pub recipient_pubkey: String,
    /// Sender pubkey from the embedded request; `None` for anonymous zaps
    pub sender_pubkey: Option<String>,
    /// Event the zap references, if any
    pub zapped_event: Option<String>,
    /// Amount in millisats, from the embedded request
    pub amount_msats: Option<u64>,
    /// Paid invoice
    pub bolt11: String,
    /// Payment preimage, when the endpoint publishes one
    pub preimage: Option<String>,
    /// Receipt timestamp
    pub created_at: u64,
}

impl ZapReceipt {
    /// Parse a zap receipt. The caller must have verified the outer event
    /// already; this additionally requires the `bolt11` and `description`
    /// tags and an embedded request that passes its own signature check.
    pub fn from_event(event: &Event) -> Result<Self, Nip57Error> {
        if event.kind != ZAP_RECEIPT_KIND {
            return Err(Nip57Error::WrongKind {
                expected: ZAP_RECEIPT_KIND,
                got: event.kind,
            });
        }

        let recipient_pubkey = event
            .tag_value("p")
            .ok_or(Nip57Error::MissingTag("p"))?
            .to_string();
        let bolt11 = event
            .tag_value("bolt11")
            .ok_or(Nip57Error::MissingTag("bolt11"))?
            .to_string();
        let description = event
            .tag_value("description")
            .ok_or(Nip57Error::MissingTag("description"))?;

        let request_event: Event = serde_json::from_str(description)
            .map_err(|e| Nip57Error::MalformedDescription(e.to_string()))?;
        if !request_event.verify() {
            return Err(Nip57Error::EmbeddedRequestInvalid);
        }
        let request = ZapRequest::from_event(&request_event)?;

        // The receipt's own e tag wins if present; fall back to the request.
        let zapped_event = event
            .tag_value("e")
            .map(|s| s.to_string())
            .or(request.zapped_event);

        Ok(Self {
            receipt_id: event.id.clone(),
            recipient_pubkey,
            sender_pubkey: if request.anonymous {
                None
            } else {
                Some(request_event.pubkey)
            },
            zapped_event,
            amount_msats: request.amount_msats,
            bolt11,
            preimage: event.tag_value("preimage").map(|s| s.to_string()),
            created_at: event.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip01::{generate_secret_key, get_public_key_hex};

    fn signed_request(amount: u64, target_id: &str) -> (Event, [u8; 32]) {
        let sender = generate_secret_key();
        let recipient = get_public_key_hex(&generate_secret_key()).unwrap();
        let template = ZapRequest::build(
            &ZapTarget::Event {
                id: target_id.to_string(),
                author: recipient,
            },
            amount,
            "great post",
            &["wss://relay.example.com".to_string()],
            1700000000,
        );
        (template.sign(&sender).unwrap(), sender)
    }

    fn receipt_for(request: &Event) -> Event {
        let endpoint = generate_secret_key();
        let recipient = request.tag_value("p").unwrap().to_string();
        let mut tags = vec![
            vec!["p".to_string(), recipient],
            vec!["bolt11".to_string(), "lnbc210n1...".to_string()],
            vec![
                "description".to_string(),
                serde_json::to_string(request).unwrap(),
            ],
        ];
        if let Some(e) = request.tag_value("e") {
            tags.push(vec!["e".to_string(), e.to_string()]);
        }
        EventTemplate::new(ZAP_RECEIPT_KIND, tags, "", 1700000100)
            .sign(&endpoint)
            .unwrap()
    }

    #[test]
    fn build_encodes_target_and_amount() {
        let (request, sender) = signed_request(21000, "feed0");
        assert!(request.verify());

        let parsed = ZapRequest::from_event(&request).unwrap();
        assert_eq!(parsed.amount_msats, Some(21000));
        assert_eq!(parsed.zapped_event.as_deref(), Some("feed0"));
        assert_eq!(parsed.relays, vec!["wss://relay.example.com"]);
        assert!(!parsed.anonymous);
        assert_eq!(request.pubkey, get_public_key_hex(&sender).unwrap());
    }

    #[test]
    fn profile_zap_has_no_event_reference() {
        let pubkey = get_public_key_hex(&generate_secret_key()).unwrap();
        let template = ZapRequest::build(
            &ZapTarget::Profile { pubkey },
            1000,
            "",
            &[],
            1700000000,
        );
        let event = template.sign(&generate_secret_key()).unwrap();
        let parsed = ZapRequest::from_event(&event).unwrap();
        assert!(parsed.zapped_event.is_none());
    }

    #[test]
    fn receipt_parses_with_valid_embedded_request() {
        let (request, _) = signed_request(42000, "abc123");
        let receipt_event = receipt_for(&request);
        assert!(receipt_event.verify());

        let receipt = ZapReceipt::from_event(&receipt_event).unwrap();
        assert_eq!(receipt.amount_msats, Some(42000));
        assert_eq!(receipt.zapped_event.as_deref(), Some("abc123"));
        assert_eq!(receipt.sender_pubkey.as_deref(), Some(request.pubkey.as_str()));
        assert_eq!(receipt.receipt_id, receipt_event.id);
    }

    #[test]
    fn receipt_missing_description_rejected() {
        let (request, _) = signed_request(1000, "abc");
        let mut receipt_event = receipt_for(&request);
        receipt_event.tags.retain(|t| t[0] != "description");

        assert!(matches!(
            ZapReceipt::from_event(&receipt_event),
            Err(Nip57Error::MissingTag("description"))
        ));
    }

    #[test]
    fn receipt_missing_bolt11_rejected() {
        let (request, _) = signed_request(1000, "abc");
        let mut receipt_event = receipt_for(&request);
        receipt_event.tags.retain(|t| t[0] != "bolt11");

        assert!(matches!(
            ZapReceipt::from_event(&receipt_event),
            Err(Nip57Error::MissingTag("bolt11"))
        ));
    }

    #[test]
    fn receipt_with_forged_embedded_request_rejected() {
        let (request, _) = signed_request(1000, "abc");

        // Forge the embedded request: bump the amount after signing.
        let mut forged = request.clone();
        for tag in &mut forged.tags {
            if tag[0] == "amount" {
                tag[1] = "999999999".to_string();
            }
        }
        let mut receipt_event = receipt_for(&request);
        for tag in &mut receipt_event.tags {
            if tag[0] == "description" {
                tag[1] = serde_json::to_string(&forged).unwrap();
            }
        }
        // Re-sign the outer receipt so only the inner signature is wrong.
        let receipt_event = EventTemplate::new(
            ZAP_RECEIPT_KIND,
            receipt_event.tags.clone(),
            "",
            receipt_event.created_at,
        )
        .sign(&generate_secret_key())
        .unwrap();
        assert!(receipt_event.verify());

        assert!(matches!(
            ZapReceipt::from_event(&receipt_event),
            Err(Nip57Error::EmbeddedRequestInvalid)
        ));
    }
}
