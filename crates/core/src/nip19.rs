//! bech32-encoded entities.
//!
//! Human-shareable encodings for keys, event ids, and addressable-event
//! coordinates: `npub` (public key), `nsec` (secret key), `note` (event id),
//! and the TLV-structured `naddr` used for app permalinks.

use bech32::{Bech32, Hrp};
use thiserror::Error;

/// Errors for bech32 entity encoding and decoding.
#[derive(Debug, Error)]
pub enum Nip19Error {
    #[error("bech32 encode error: {0}")]
    Encode(String),

    #[error("bech32 decode error: {0}")]
    Decode(String),

    #[error("unexpected prefix: expected '{expected}', got '{got}'")]
    WrongPrefix { expected: &'static str, got: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

fn encode_bytes(prefix: &'static str, data: &[u8]) -> Result<String, Nip19Error> {
    let hrp = Hrp::parse(prefix).map_err(|e| Nip19Error::Encode(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Nip19Error::Encode(e.to_string()))
}

fn decode_bytes(prefix: &'static str, encoded: &str) -> Result<Vec<u8>, Nip19Error> {
    let (hrp, data) = bech32::decode(encoded).map_err(|e| Nip19Error::Decode(e.to_string()))?;
    if hrp.as_str() != prefix {
        return Err(Nip19Error::WrongPrefix {
            expected: prefix,
            got: hrp.as_str().to_string(),
        });
    }
    Ok(data)
}

fn decode_32(prefix: &'static str, encoded: &str) -> Result<[u8; 32], Nip19Error> {
    let data = decode_bytes(prefix, encoded)?;
    data.as_slice()
        .try_into()
        .map_err(|_| Nip19Error::InvalidPayload(format!("expected 32 bytes, got {}", data.len())))
}

/// Encode a hex public key as `npub1...`.
pub fn encode_npub(pubkey_hex: &str) -> Result<String, Nip19Error> {
    let bytes =
        hex::decode(pubkey_hex).map_err(|e| Nip19Error::InvalidPayload(format!("bad hex: {e}")))?;
    encode_bytes("npub", &bytes)
}

/// Encode a secret key as `nsec1...`.
pub fn encode_nsec(secret_key: &[u8; 32]) -> Result<String, Nip19Error> {
    encode_bytes("nsec", secret_key)
}

/// Decode an `nsec1...` string into raw key bytes.
pub fn decode_nsec(encoded: &str) -> Result<[u8; 32], Nip19Error> {
    decode_32("nsec", encoded)
}

/// Encode a hex event id as `note1...`.
pub fn encode_note(event_id_hex: &str) -> Result<String, Nip19Error> {
    let bytes = hex::decode(event_id_hex)
        .map_err(|e| Nip19Error::InvalidPayload(format!("bad hex: {e}")))?;
    encode_bytes("note", &bytes)
}

// naddr TLV types
const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;
const TLV_AUTHOR: u8 = 2;
const TLV_KIND: u8 = 3;

/// Coordinate of an addressable event: kind + author + identifier, with
/// optional relay hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naddr {
    pub kind: u16,
    pub author: String,
    pub identifier: String,
    pub relays: Vec<String>,
}

/// Encode an addressable-event coordinate as `naddr1...`.
pub fn encode_naddr(naddr: &Naddr) -> Result<String, Nip19Error> {
    let author = hex::decode(&naddr.author)
        .map_err(|e| Nip19Error::InvalidPayload(format!("bad author hex: {e}")))?;
    if author.len() != 32 {
        return Err(Nip19Error::InvalidPayload(
            "author must be 32 bytes".to_string(),
        ));
    }

    let mut data = Vec::new();
    push_tlv(&mut data, TLV_SPECIAL, naddr.identifier.as_bytes())?;
    for relay in &naddr.relays {
        push_tlv(&mut data, TLV_RELAY, relay.as_bytes())?;
    }
    push_tlv(&mut data, TLV_AUTHOR, &author)?;
    push_tlv(&mut data, TLV_KIND, &(naddr.kind as u32).to_be_bytes())?;

    encode_bytes("naddr", &data)
}

/// Decode an `naddr1...` string back into its coordinate.
pub fn decode_naddr(encoded: &str) -> Result<Naddr, Nip19Error> {
    let data = decode_bytes("naddr", encoded)?;

    let mut identifier = None;
    let mut author = None;
    let mut kind = None;
    let mut relays = Vec::new();

    let mut rest = data.as_slice();
    while rest.len() >= 2 {
        let (t, len) = (rest[0], rest[1] as usize);
        if rest.len() < 2 + len {
            return Err(Nip19Error::InvalidPayload("truncated TLV entry".to_string()));
        }
        let value = &rest[2..2 + len];
        match t {
            TLV_SPECIAL => {
                identifier = Some(
                    String::from_utf8(value.to_vec())
                        .map_err(|_| Nip19Error::InvalidPayload("identifier not UTF-8".to_string()))?,
                )
            }
            TLV_RELAY => {
                if let Ok(url) = String::from_utf8(value.to_vec()) {
                    relays.push(url);
                }
            }
            TLV_AUTHOR => {
                if value.len() == 32 {
                    author = Some(hex::encode(value));
                }
            }
            TLV_KIND => {
                if value.len() == 4 {
                    let raw = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                    kind = u16::try_from(raw).ok();
                }
            }
            // Unknown TLV types are skipped for forward compatibility.
            _ => {}
        }
        rest = &rest[2 + len..];
    }

    Ok(Naddr {
        kind: kind.ok_or_else(|| Nip19Error::InvalidPayload("missing kind".to_string()))?,
        author: author.ok_or_else(|| Nip19Error::InvalidPayload("missing author".to_string()))?,
        identifier: identifier
            .ok_or_else(|| Nip19Error::InvalidPayload("missing identifier".to_string()))?,
        relays,
    })
}

fn push_tlv(out: &mut Vec<u8>, t: u8, value: &[u8]) -> Result<(), Nip19Error> {
    let len = u8::try_from(value.len())
        .map_err(|_| Nip19Error::InvalidPayload("TLV value longer than 255 bytes".to_string()))?;
    out.push(t);
    out.push(len);
    out.extend_from_slice(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip01::{generate_secret_key, get_public_key_hex};

    #[test]
    fn npub_roundtrips_through_bech32() {
        let pubkey = get_public_key_hex(&generate_secret_key()).unwrap();
        let npub = encode_npub(&pubkey).unwrap();
        assert!(npub.starts_with("npub1"));

        let decoded = decode_bytes("npub", &npub).unwrap();
        assert_eq!(hex::encode(decoded), pubkey);
    }

    #[test]
    fn nsec_roundtrips() {
        let secret = generate_secret_key();
        let nsec = encode_nsec(&secret).unwrap();
        assert!(nsec.starts_with("nsec1"));
        assert_eq!(decode_nsec(&nsec).unwrap(), secret);
    }

    #[test]
    fn nsec_rejects_wrong_prefix() {
        let pubkey = get_public_key_hex(&generate_secret_key()).unwrap();
        let npub = encode_npub(&pubkey).unwrap();
        assert!(matches!(
            decode_nsec(&npub),
            Err(Nip19Error::WrongPrefix { expected: "nsec", .. })
        ));
    }

    #[test]
    fn naddr_roundtrips_with_relays() {
        let author = get_public_key_hex(&generate_secret_key()).unwrap();
        let naddr = Naddr {
            kind: 32267,
            author,
            identifier: "com.example.app".to_string(),
            relays: vec!["wss://relay.example.com".to_string()],
        };

        let encoded = encode_naddr(&naddr).unwrap();
        assert!(encoded.starts_with("naddr1"));
        assert_eq!(decode_naddr(&encoded).unwrap(), naddr);
    }

    #[test]
    fn naddr_missing_fields_rejected() {
        // An naddr with only an identifier TLV must not decode.
        let hrp = Hrp::parse("naddr").unwrap();
        let mut data = Vec::new();
        push_tlv(&mut data, TLV_SPECIAL, b"only-identifier").unwrap();
        let bogus = bech32::encode::<Bech32>(hrp, &data).unwrap();

        assert!(decode_naddr(&bogus).is_err());
    }
}
