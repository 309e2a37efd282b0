//! JSON envelopes exchanged between broker clients and the coordinator.
//!
//! Requests:
//!
//! ```json
//! {"type": "send_event", "event": {...}, "username": "...", "password": "..."}
//! {"type": "send_bulk", "events": [...], "username": "...", "password": "..."}
//! {"type": "get_event", "event_type": "new_request", "num_events": 8, "wait_ms": 0, ...}
//! ```
//!
//! Replies carry the request type with a `_ret` suffix, or `error`:
//!
//! ```json
//! {"type": "get_event_ret", "ret": [...]}
//! {"type": "error", "ret": "bad credentials"}
//! ```

use crate::error::{Error, Result};
use crate::model::{Event, EventType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerRequest {
    SendEvent {
        event: Event,
    },
    SendBulk {
        events: Vec<Event>,
    },
    GetEvent {
        event_type: EventType,
        num_events: usize,
        #[serde(default)]
        wait_ms: u64,
    },
}

impl BrokerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerRequest::SendEvent { .. } => "send_event",
            BrokerRequest::SendBulk { .. } => "send_bulk",
            BrokerRequest::GetEvent { .. } => "get_event",
        }
    }
}

/// A request plus the caller's credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(flatten)]
    pub request: BrokerRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "ret", rename_all = "snake_case")]
pub enum BrokerReply {
    SendEventRet(bool),
    SendBulkRet(bool),
    GetEventRet(Vec<Event>),
    Error(Option<String>),
}

impl BrokerReply {
    pub fn error(message: impl Into<String>) -> Self {
        BrokerReply::Error(Some(message.into()))
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode_envelope(raw: &str) -> Result<Envelope> {
    serde_json::from_str(raw).map_err(|e| Error::Broker(format!("malformed request: {e}")))
}

pub fn decode_reply(raw: &str) -> Result<BrokerReply> {
    serde_json::from_str(raw).map_err(|e| Error::Broker(format!("malformed reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_layout() {
        let envelope = Envelope {
            username: "idds".into(),
            password: "secret".into(),
            request: BrokerRequest::GetEvent {
                event_type: EventType::NewRequest,
                num_events: 4,
                wait_ms: 0,
            },
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "get_event",
                "event_type": "new_request",
                "num_events": 4,
                "wait_ms": 0,
                "username": "idds",
                "password": "secret"
            })
        );
        assert_eq!(decode_envelope(&value.to_string()).unwrap(), envelope);
    }

    #[test]
    fn reply_layout() {
        let ok = encode(&BrokerReply::SendEventRet(true)).unwrap();
        assert_eq!(ok, r#"{"type":"send_event_ret","ret":true}"#);
        assert_eq!(
            decode_reply(r#"{"type":"error","ret":null}"#).unwrap(),
            BrokerReply::Error(None)
        );
    }

    #[test]
    fn garbage_is_a_broker_error() {
        assert!(matches!(decode_envelope("{not json"), Err(Error::Broker(_))));
        assert!(matches!(
            decode_envelope(r#"{"type":"drop_table"}"#),
            Err(Error::Broker(_))
        ));
    }
}
