//! Hub wire format and REST payload shapes.
//!
//! The hub speaks the JSON hub protocol: every record is a JSON object
//! terminated by [`RECORD_SEPARATOR`], and one websocket text frame may
//! carry several records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{Message, MessageId, Notification, UserId},
    error::FrameError,
};

pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const HUB_PROTOCOL: &str = "json";
pub const HUB_PROTOCOL_VERSION: u32 = 1;

pub const SEND_MESSAGE: &str = "SendMessage";
pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
pub const RECEIVE_NOTIFICATION: &str = "ReceiveNotification";

const INVOCATION: u8 = 1;
const COMPLETION: u8 = 3;
const PING: u8 = 6;
const CLOSE: u8 = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items, cancel requests and anything newer than this client.
    Unsupported(u8),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubFrame {
    pub fn invocation(
        invocation_id: Option<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self::Invocation {
            invocation_id,
            target: target.into(),
            arguments,
        }
    }

    /// Serializes the frame as one separator-terminated record.
    pub fn encode(&self) -> String {
        let raw = match self {
            Self::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawFrame {
                kind: INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..RawFrame::default()
            },
            Self::Completion {
                invocation_id,
                result,
                error,
            } => RawFrame {
                kind: COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..RawFrame::default()
            },
            Self::Ping => RawFrame {
                kind: PING,
                ..RawFrame::default()
            },
            Self::Close {
                error,
                allow_reconnect,
            } => RawFrame {
                kind: CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..RawFrame::default()
            },
            Self::Unsupported(kind) => RawFrame {
                kind: *kind,
                ..RawFrame::default()
            },
        };
        // RawFrame only holds strings, numbers and json values.
        let mut record = serde_json::to_string(&raw).unwrap_or_default();
        record.push(RECORD_SEPARATOR);
        record
    }

    pub fn decode(record: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(record)?;
        Ok(match raw.kind {
            INVOCATION => Self::Invocation {
                invocation_id: raw.invocation_id,
                target: raw.target.ok_or(FrameError::MissingField("target"))?,
                arguments: raw.arguments.unwrap_or_default(),
            },
            COMPLETION => Self::Completion {
                invocation_id: raw
                    .invocation_id
                    .ok_or(FrameError::MissingField("invocationId"))?,
                result: raw.result,
                error: raw.error,
            },
            PING => Self::Ping,
            CLOSE => Self::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            },
            other => Self::Unsupported(other),
        })
    }
}

/// Splits a websocket text payload into its records, skipping empty tails.
pub fn split_records(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

pub fn decode_records(payload: &str) -> Vec<Result<HubFrame, FrameError>> {
    split_records(payload).map(HubFrame::decode).collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

#[derive(Debug, Default, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

pub fn handshake_request() -> String {
    let mut record = serde_json::to_string(&HandshakeRequest {
        protocol: HUB_PROTOCOL,
        version: HUB_PROTOCOL_VERSION,
    })
    .unwrap_or_default();
    record.push(RECORD_SEPARATOR);
    record
}

pub fn parse_handshake_response(record: &str) -> Result<(), FrameError> {
    let response: HandshakeResponse = serde_json::from_str(record)?;
    match response.error {
        Some(error) => Err(FrameError::HandshakeRejected(error)),
        None => Ok(()),
    }
}

/// Server-to-client invocations this client understands.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    MessageReceived { sender_id: UserId, body: String },
    NotificationReceived(Notification),
    Unknown { target: String },
}

impl HubEvent {
    pub fn from_invocation(target: &str, arguments: &[Value]) -> Result<Self, FrameError> {
        if target.eq_ignore_ascii_case(RECEIVE_MESSAGE) {
            let sender_id = string_argument(target, arguments, 0)?;
            let body = string_argument(target, arguments, 1)?;
            return Ok(Self::MessageReceived {
                sender_id: UserId(sender_id),
                body,
            });
        }

        if target.eq_ignore_ascii_case(RECEIVE_NOTIFICATION) {
            let payload = arguments.first().ok_or_else(|| FrameError::BadArgument {
                target: target.to_string(),
                index: 0,
            })?;
            let notification = serde_json::from_value(payload.clone())?;
            return Ok(Self::NotificationReceived(notification));
        }

        Ok(Self::Unknown {
            target: target.to_string(),
        })
    }
}

fn string_argument(target: &str, arguments: &[Value], index: usize) -> Result<String, FrameError> {
    match arguments.get(index) {
        Some(Value::String(value)) => Ok(value.clone()),
        // Numeric user ids arrive unquoted from some backends.
        Some(Value::Number(value)) => Ok(value.to_string()),
        _ => Err(FrameError::BadArgument {
            target: target.to_string(),
            index,
        }),
    }
}

pub fn send_message_arguments(receiver_id: &UserId, body: &str) -> Vec<Value> {
    vec![
        Value::String(receiver_id.0.clone()),
        Value::String(body.to_string()),
    ]
}

/// A message as returned by the history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(alias = "id")]
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(alias = "content")]
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn into_message(self, local_user: &UserId) -> Message {
        Message {
            is_local_sender: &self.sender_id == local_user,
            message_id: Some(self.message_id),
            correlation_id: None,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            body: self.body,
            sent_at: self.sent_at,
            delivery: Default::default(),
        }
    }
}
