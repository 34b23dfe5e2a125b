//! Sync protocol messages
//!
//! Every message is a relay invocation whose first two positional arguments
//! are the sender's origin id and the event id.
//!
//! | target               | arguments                                  |
//! |----------------------|--------------------------------------------|
//! | `tokenUsed`          | originId, eventId, token                   |
//! | `resetEvent`         | originId, eventId                          |
//! | `setEventDetails`    | originId, eventId, name, nextToken         |
//! | `pingEvent`          | originId, eventId                          |
//! | `tokenAssignments`   | originId, eventId, assignment records      |
//! | `syncDigest`         | originId, eventId, count, tokens           |
//! | `deviceAddedToEvent` | originId, eventId                          |
//! | `requestFullHistory` | originId, eventId                          |

use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::models::WireAssignment;
use crate::relay::Invocation;

pub const TOKEN_USED: &str = "tokenUsed";
pub const RESET_EVENT: &str = "resetEvent";
pub const SET_EVENT_DETAILS: &str = "setEventDetails";
pub const PING_EVENT: &str = "pingEvent";
pub const TOKEN_ASSIGNMENTS: &str = "tokenAssignments";
pub const SYNC_DIGEST: &str = "syncDigest";
pub const DEVICE_ADDED_TO_EVENT: &str = "deviceAddedToEvent";
pub const REQUEST_FULL_HISTORY: &str = "requestFullHistory";

/// Errors decoding an inbound invocation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Unknown message '{0}'")]
    UnknownTarget(String),

    #[error("Message '{target}' is missing argument {index}")]
    MissingArgument { target: String, index: usize },

    #[error("Message '{target}' has an invalid argument {index}: {details}")]
    InvalidArgument {
        target: String,
        index: usize,
        details: String,
    },
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    TokenUsed {
        origin_id: String,
        event_id: String,
        token: u32,
    },
    ResetEvent {
        origin_id: String,
        event_id: String,
    },
    /// `next_token` is `None` when the sender passed something that is not
    /// an integer
    SetEventDetails {
        origin_id: String,
        event_id: String,
        name: String,
        next_token: Option<i64>,
    },
    PingEvent {
        origin_id: String,
        event_id: String,
    },
    TokenAssignments {
        origin_id: String,
        event_id: String,
        assignments: Vec<WireAssignment>,
    },
    SyncDigest {
        origin_id: String,
        event_id: String,
        count: usize,
        tokens: Vec<u32>,
    },
    DeviceAddedToEvent {
        origin_id: String,
        event_id: String,
    },
    RequestFullHistory {
        origin_id: String,
        event_id: String,
    },
}

impl ProtocolMessage {
    /// Invocation target of this message
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolMessage::TokenUsed { .. } => TOKEN_USED,
            ProtocolMessage::ResetEvent { .. } => RESET_EVENT,
            ProtocolMessage::SetEventDetails { .. } => SET_EVENT_DETAILS,
            ProtocolMessage::PingEvent { .. } => PING_EVENT,
            ProtocolMessage::TokenAssignments { .. } => TOKEN_ASSIGNMENTS,
            ProtocolMessage::SyncDigest { .. } => SYNC_DIGEST,
            ProtocolMessage::DeviceAddedToEvent { .. } => DEVICE_ADDED_TO_EVENT,
            ProtocolMessage::RequestFullHistory { .. } => REQUEST_FULL_HISTORY,
        }
    }

    pub fn origin_id(&self) -> &str {
        match self {
            ProtocolMessage::TokenUsed { origin_id, .. }
            | ProtocolMessage::ResetEvent { origin_id, .. }
            | ProtocolMessage::SetEventDetails { origin_id, .. }
            | ProtocolMessage::PingEvent { origin_id, .. }
            | ProtocolMessage::TokenAssignments { origin_id, .. }
            | ProtocolMessage::SyncDigest { origin_id, .. }
            | ProtocolMessage::DeviceAddedToEvent { origin_id, .. }
            | ProtocolMessage::RequestFullHistory { origin_id, .. } => origin_id,
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            ProtocolMessage::TokenUsed { event_id, .. }
            | ProtocolMessage::ResetEvent { event_id, .. }
            | ProtocolMessage::SetEventDetails { event_id, .. }
            | ProtocolMessage::PingEvent { event_id, .. }
            | ProtocolMessage::TokenAssignments { event_id, .. }
            | ProtocolMessage::SyncDigest { event_id, .. }
            | ProtocolMessage::DeviceAddedToEvent { event_id, .. }
            | ProtocolMessage::RequestFullHistory { event_id, .. } => event_id,
        }
    }

    /// Encode as a relay invocation
    pub fn to_invocation(&self) -> Invocation {
        let head = vec![json!(self.origin_id()), json!(self.event_id())];
        let tail = match self {
            ProtocolMessage::TokenUsed { token, .. } => vec![json!(token)],
            ProtocolMessage::SetEventDetails {
                name, next_token, ..
            } => vec![json!(name), json!(next_token)],
            ProtocolMessage::TokenAssignments { assignments, .. } => vec![json!(assignments)],
            ProtocolMessage::SyncDigest { count, tokens, .. } => vec![json!(count), json!(tokens)],
            ProtocolMessage::ResetEvent { .. }
            | ProtocolMessage::PingEvent { .. }
            | ProtocolMessage::DeviceAddedToEvent { .. }
            | ProtocolMessage::RequestFullHistory { .. } => Vec::new(),
        };

        Invocation::new(self.name(), head.into_iter().chain(tail).collect())
    }

    /// Decode a relay invocation
    ///
    /// Individual assignment records or digest tokens that cannot be read
    /// are dropped; the rest of the message is kept.
    pub fn from_invocation(invocation: &Invocation) -> Result<Self, MessageError> {
        let args = Args {
            target: &invocation.target,
            values: &invocation.arguments,
        };
        let origin_id = args.string(0)?;
        let event_id = args.string(1)?;

        let message = match invocation.target.as_str() {
            TOKEN_USED => {
                let token = args.integer(2)?;
                let token = u32::try_from(token).map_err(|_| args.invalid(2, "negative token"))?;
                ProtocolMessage::TokenUsed {
                    origin_id,
                    event_id,
                    token,
                }
            }
            RESET_EVENT => ProtocolMessage::ResetEvent {
                origin_id,
                event_id,
            },
            SET_EVENT_DETAILS => ProtocolMessage::SetEventDetails {
                origin_id,
                event_id,
                name: args.optional_string(2),
                next_token: args.integer(3).ok(),
            },
            PING_EVENT => ProtocolMessage::PingEvent {
                origin_id,
                event_id,
            },
            TOKEN_ASSIGNMENTS => {
                let records = args.array(2)?;
                let assignments = records
                    .iter()
                    .filter_map(|record| {
                        serde_json::from_value::<WireAssignment>(record.clone())
                            .map_err(|e| warn!("Dropping assignment record {}: {}", record, e))
                            .ok()
                    })
                    .collect();
                ProtocolMessage::TokenAssignments {
                    origin_id,
                    event_id,
                    assignments,
                }
            }
            SYNC_DIGEST => {
                let count = args.integer(2)?;
                let count = usize::try_from(count).map_err(|_| args.invalid(2, "negative count"))?;
                let tokens = args
                    .array(3)?
                    .iter()
                    .filter_map(as_integer)
                    .filter_map(|t| u32::try_from(t).ok())
                    .collect();
                ProtocolMessage::SyncDigest {
                    origin_id,
                    event_id,
                    count,
                    tokens,
                }
            }
            DEVICE_ADDED_TO_EVENT => ProtocolMessage::DeviceAddedToEvent {
                origin_id,
                event_id,
            },
            REQUEST_FULL_HISTORY => ProtocolMessage::RequestFullHistory {
                origin_id,
                event_id,
            },
            other => return Err(MessageError::UnknownTarget(other.to_string())),
        };

        Ok(message)
    }
}

struct Args<'a> {
    target: &'a str,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    fn get(&self, index: usize) -> Result<&'a Value, MessageError> {
        self.values
            .get(index)
            .ok_or_else(|| MessageError::MissingArgument {
                target: self.target.to_string(),
                index,
            })
    }

    fn invalid(&self, index: usize, details: &str) -> MessageError {
        MessageError::InvalidArgument {
            target: self.target.to_string(),
            index,
            details: details.to_string(),
        }
    }

    fn string(&self, index: usize) -> Result<String, MessageError> {
        match self.get(index)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(self.invalid(index, "expected a string")),
        }
    }

    fn optional_string(&self, index: usize) -> String {
        self.string(index).unwrap_or_default()
    }

    fn integer(&self, index: usize) -> Result<i64, MessageError> {
        as_integer(self.get(index)?).ok_or_else(|| self.invalid(index, "expected an integer"))
    }

    fn array(&self, index: usize) -> Result<&'a Vec<Value>, MessageError> {
        self.get(index)?
            .as_array()
            .ok_or_else(|| self.invalid(index, "expected an array"))
    }
}

/// Read an integer sent either as a JSON number or a numeric string
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
