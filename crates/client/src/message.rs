//! Relay wire messages.
//!
//! Text frames over a persistent connection, JSON arrays with a leading
//! type string. Client to relay: EVENT, REQ, CLOSE. Relay to client: EVENT,
//! OK, EOSE, CLOSED, NOTICE. Framing must stay byte-compatible with
//! unmodified relay servers.

use chateau_core::Event;
use serde_json::Value;
use thiserror::Error;

use crate::filter::Filter;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Publish an event: `["EVENT", <event>]`
    Event(Event),

    /// Open a subscription: `["REQ", <sub id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: `["CLOSE", <sub id>]`
    Close { subscription_id: String },
}

impl ClientMessage {
    /// Serialize to the JSON array the relay expects.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr: Vec<Value> = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// Event matching a subscription: `["EVENT", <sub id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },

    /// Publish acknowledgement: `["OK", <event id>, <bool>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },

    /// End of stored events: `["EOSE", <sub id>]`
    Eose { subscription_id: String },

    /// Subscription closed by the relay: `["CLOSED", <sub id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: `["NOTICE", <message>]`
    Notice { message: String },
}

impl RelayMessage {
    /// Parse a JSON frame from the relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        if arr.is_empty() {
            return Err(MessageError::InvalidFormat("empty array".to_string()));
        }

        let msg_type = arr[0]
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;

        match msg_type {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField(
                        "subscription id or event".to_string(),
                    ));
                }
                let subscription_id = str_field(&arr[1], "subscription id")?;
                let event: Event = serde_json::from_value(arr[2].clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                if arr.len() < 4 {
                    return Err(MessageError::MissingField("OK fields".to_string()));
                }
                let event_id = str_field(&arr[1], "event id")?;
                let accepted = arr[2].as_bool().ok_or_else(|| {
                    MessageError::InvalidFormat("acceptance flag not a boolean".to_string())
                })?;
                let message = arr[3].as_str().unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("subscription id".to_string()));
                }
                Ok(RelayMessage::Eose {
                    subscription_id: str_field(&arr[1], "subscription id")?,
                })
            }
            "CLOSED" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField("CLOSED fields".to_string()));
                }
                Ok(RelayMessage::Closed {
                    subscription_id: str_field(&arr[1], "subscription id")?,
                    message: arr[2].as_str().unwrap_or("").to_string(),
                })
            }
            "NOTICE" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("message".to_string()));
                }
                Ok(RelayMessage::Notice {
                    message: str_field(&arr[1], "message")?,
                })
            }
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

fn str_field(value: &Value, what: &str) -> Result<String, MessageError> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| MessageError::InvalidFormat(format!("{what} not a string")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_event() -> Event {
        Event {
            id: "abc".to_string(),
            pubkey: "pk".to_string(),
            created_at: 123,
            kind: 1,
            tags: vec![],
            content: "Hello".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn client_event_frame() {
        let json = ClientMessage::Event(dummy_event()).to_json().unwrap();
        assert!(json.starts_with("[\"EVENT\","));
        assert!(json.contains("\"id\":\"abc\""));
    }

    #[test]
    fn client_req_frame_inlines_filters() {
        let msg = ClientMessage::Req {
            subscription_id: "sub1".to_string(),
            filters: vec![Filter::new().kinds([1]).limit(10)],
        };
        let json = msg.to_json().unwrap();
        assert!(json.starts_with("[\"REQ\",\"sub1\","));
        assert!(json.contains("\"kinds\":[1]"));
    }

    #[test]
    fn client_close_frame() {
        let msg = ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        };
        assert_eq!(msg.to_json().unwrap(), r#"["CLOSE","sub1"]"#);
    }

    #[test]
    fn relay_event_frame() {
        let json = r#"["EVENT","sub1",{"id":"abc","pubkey":"pk","created_at":123,"kind":1,"tags":[],"content":"Hello","sig":"sig"}]"#;
        match RelayMessage::from_json(json).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(event.id, "abc");
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[test]
    fn relay_ok_frames() {
        match RelayMessage::from_json(r#"["OK","ev1",true,""]"#).unwrap() {
            RelayMessage::Ok {
                event_id, accepted, ..
            } => {
                assert_eq!(event_id, "ev1");
                assert!(accepted);
            }
            other => panic!("wrong message type: {other:?}"),
        }

        match RelayMessage::from_json(r#"["OK","ev1",false,"blocked: spam"]"#).unwrap() {
            RelayMessage::Ok {
                accepted, message, ..
            } => {
                assert!(!accepted);
                assert_eq!(message, "blocked: spam");
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[test]
    fn relay_eose_and_closed_and_notice() {
        assert!(matches!(
            RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap(),
            RelayMessage::Eose { subscription_id } if subscription_id == "sub1"
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["CLOSED","sub1","rate limited"]"#).unwrap(),
            RelayMessage::Closed { message, .. } if message == "rate limited"
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["NOTICE","slow down"]"#).unwrap(),
            RelayMessage::Notice { message } if message == "slow down"
        ));
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(RelayMessage::from_json("not json").is_err());
        assert!(RelayMessage::from_json("[]").is_err());
        assert!(RelayMessage::from_json(r#"["UNKNOWN"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["EVENT","sub-only"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["OK","ev1","yes",""]"#).is_err());
    }
}
