//! Relay protocol frames.
//!
//! Client → relay:
//!   `["REQ", <sub id>, <filter>]`, `["EVENT", <event>]`, `["CLOSE", <sub id>]`
//!
//! Relay → client:
//!   `["EVENT", <sub id>, <event>]`, `["EOSE", <sub id>]`,
//!   `["OK", <event id>, <accepted>, <message>]`, `["CLOSED", <sub id>, <message>]`,
//!   `["NOTICE", <message>]`, `["AUTH", <challenge>]`

use serde_json::{json, Value};

use crate::error::ProtoError;
use crate::event::Event;
use crate::filter::Filter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filter: Filter,
    },
    Event(Box<Event>),
    Close {
        subscription_id: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        let value = match self {
            Self::Req {
                subscription_id,
                filter,
            } => json!(["REQ", subscription_id, filter]),
            Self::Event(event) => json!(["EVENT", event]),
            Self::Close { subscription_id } => json!(["CLOSE", subscription_id]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Eose {
        subscription_id: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        let value: Value = serde_json::from_str(text)?;
        let frame = value
            .as_array()
            .ok_or_else(|| ProtoError::Malformed("expected a JSON array".into()))?;
        let tag = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtoError::Malformed("missing message type".into()))?;

        match tag {
            "EVENT" => {
                let subscription_id = str_at(frame, 1)?;
                let raw = frame
                    .get(2)
                    .cloned()
                    .ok_or_else(|| ProtoError::Malformed("EVENT without payload".into()))?;
                let event: Event = serde_json::from_value(raw)?;
                Ok(Self::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "OK" => Ok(Self::Ok {
                event_id: str_at(frame, 1)?,
                accepted: frame
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| ProtoError::Malformed("OK without accepted flag".into()))?,
                message: opt_str_at(frame, 3),
            }),
            "EOSE" => Ok(Self::Eose {
                subscription_id: str_at(frame, 1)?,
            }),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: str_at(frame, 1)?,
                message: opt_str_at(frame, 2),
            }),
            "NOTICE" => Ok(Self::Notice {
                message: opt_str_at(frame, 1),
            }),
            "AUTH" => Ok(Self::Auth {
                challenge: str_at(frame, 1)?,
            }),
            other => Err(ProtoError::UnknownMessage(other.to_string())),
        }
    }
}

fn str_at(frame: &[Value], idx: usize) -> Result<String, ProtoError> {
    frame
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtoError::Malformed(format!("expected string at position {idx}")))
}

fn opt_str_at(frame: &[Value], idx: usize) -> String {
    frame
        .get(idx)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
