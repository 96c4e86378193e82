//! NIP-01 websocket framing.
//!
//! Resound answers the protocol verbs a storageless relay can honestly
//! serve: `EVENT` frames are validated and handed to the ingress adapter;
//! `REQ` subscriptions get an immediate `EOSE` followed by `CLOSED` since
//! nothing is ever stored; `CLOSE` is acknowledged silently.

use nostr::Event;
use serde_json::Value;
use thiserror::Error;

/// Errors parsing a client frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown verb: {0}")]
    UnknownVerb(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    /// `["EVENT", <event>]`
    Event(Box<Event>),
    /// `["REQ", <subscription_id>, <filters>...]`; filters are ignored,
    /// there is nothing to query
    Req { subscription_id: String },
    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },
}

impl ClientFrame {
    /// Parse a JSON frame from the client.
    pub fn from_json(json: &str) -> Result<Self, FrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(json).map_err(|e| FrameError::InvalidJson(e.to_string()))?;

        let verb = arr
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| FrameError::InvalidFrame("first element not a string".to_string()))?;

        match verb {
            "EVENT" => {
                let raw = arr
                    .get(1)
                    .ok_or_else(|| FrameError::InvalidFrame("missing event".to_string()))?;
                let event: Event = serde_json::from_value(raw.clone())
                    .map_err(|e| FrameError::InvalidFrame(format!("invalid event: {}", e)))?;
                Ok(ClientFrame::Event(Box::new(event)))
            }
            "REQ" => {
                let subscription_id = subscription_id(&arr)?;
                Ok(ClientFrame::Req { subscription_id })
            }
            "CLOSE" => {
                let subscription_id = subscription_id(&arr)?;
                Ok(ClientFrame::Close { subscription_id })
            }
            other => Err(FrameError::UnknownVerb(other.to_string())),
        }
    }
}

fn subscription_id(arr: &[Value]) -> Result<String, FrameError> {
    arr.get(1)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| FrameError::InvalidFrame("subscription id not a string".to_string()))
}

/// Messages sent from relay to client.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", <subscription_id>]`
    Eose { subscription_id: String },
    /// `["CLOSED", <subscription_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },
    /// `["NOTICE", <message>]`
    Notice { message: String },
}

impl RelayFrame {
    /// Serialize for sending to the client.
    pub fn to_json(&self) -> String {
        match self {
            RelayFrame::Ok {
                event_id,
                accepted,
                message,
            } => serde_json::json!(["OK", event_id, accepted, message]).to_string(),
            RelayFrame::Eose { subscription_id } => {
                serde_json::json!(["EOSE", subscription_id]).to_string()
            }
            RelayFrame::Closed {
                subscription_id,
                message,
            } => serde_json::json!(["CLOSED", subscription_id, message]).to_string(),
            RelayFrame::Notice { message } => serde_json::json!(["NOTICE", message]).to_string(),
        }
    }

    pub fn ok_accepted(event_id: impl Into<String>) -> Self {
        RelayFrame::Ok {
            event_id: event_id.into(),
            accepted: true,
            message: String::new(),
        }
    }

    pub fn ok_rejected(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayFrame::Ok {
            event_id: event_id.into(),
            accepted: false,
            message: reason.into(),
        }
    }

    pub fn eose(subscription_id: impl Into<String>) -> Self {
        RelayFrame::Eose {
            subscription_id: subscription_id.into(),
        }
    }

    pub fn closed(subscription_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayFrame::Closed {
            subscription_id: subscription_id.into(),
            message: message.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        RelayFrame::Notice {
            message: message.into(),
        }
    }
}
