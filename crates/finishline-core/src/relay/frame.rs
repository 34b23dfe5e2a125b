//! Relay wire frames
//!
//! Frames exchanged with the WebSocket relay using CBOR encoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Invocation, RelayCommand, RelayError, RelayResult};

/// Frames sent to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Join a group
    #[serde(rename = "join")]
    Join { group: String },

    /// Leave a group
    #[serde(rename = "leave")]
    Leave { group: String },

    /// Broadcast an invocation to a group
    #[serde(rename = "broadcast")]
    Broadcast {
        group: String,
        target: String,
        arguments: Vec<Value>,
    },
}

/// Frames received from the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Handshake response carrying the connection id
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },

    /// An invocation broadcast to one of our groups
    #[serde(rename = "invocation")]
    Invocation { target: String, arguments: Vec<Value> },

    /// Error reported by the relay
    #[serde(rename = "error")]
    Error { message: String },
}

impl From<RelayCommand> for ClientFrame {
    fn from(command: RelayCommand) -> Self {
        match command {
            RelayCommand::JoinGroup { group } => ClientFrame::Join { group },
            RelayCommand::LeaveGroup { group } => ClientFrame::Leave { group },
            RelayCommand::Broadcast { group, invocation } => ClientFrame::Broadcast {
                group,
                target: invocation.target,
                arguments: invocation.arguments,
            },
        }
    }
}

impl ClientFrame {
    /// Encode frame to CBOR bytes
    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        encode(self)
    }

    /// Decode frame from CBOR bytes
    pub fn decode(bytes: &[u8]) -> RelayResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| RelayError::Codec(e.to_string()))
    }
}

impl ServerFrame {
    /// Encode frame to CBOR bytes
    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        encode(self)
    }

    /// Decode frame from CBOR bytes
    pub fn decode(bytes: &[u8]) -> RelayResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| RelayError::Codec(e.to_string()))
    }

    /// Convert an invocation frame into an [`Invocation`]
    pub fn into_invocation(self) -> Option<Invocation> {
        match self {
            ServerFrame::Invocation { target, arguments } => {
                Some(Invocation { target, arguments })
            }
            _ => None,
        }
    }
}

fn encode<T: Serialize>(frame: &T) -> RelayResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(frame, &mut bytes).map_err(|e| RelayError::Codec(e.to_string()))?;
    Ok(bytes)
}
