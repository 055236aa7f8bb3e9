//! Packet definitions
//!
//! Defines the packets exchanged between realtime clients and the server.
//! Every WebSocket text frame carries exactly one JSON-encoded packet.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::transport::ROOT_NAMESPACE;

/// Maximum length of an event name
pub const MAX_EVENT_NAME_LENGTH: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

fn root_namespace() -> String {
    ROOT_NAMESPACE.to_string()
}

// ============================================================================
// Packets
// ============================================================================

/// A single protocol packet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// Socket connected to a namespace
    Connect {
        #[serde(default = "root_namespace")]
        nsp: String,
        /// Socket id assigned by the server
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sid: Option<String>,
    },

    /// Socket left a namespace
    Disconnect {
        #[serde(default = "root_namespace")]
        nsp: String,
    },

    /// Named event; `data[0]` is the event name, the rest are arguments
    Event {
        #[serde(default = "root_namespace")]
        nsp: String,
        data: Vec<Value>,
        /// Set when the sender wants an acknowledgement
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Acknowledgement of event `id`
    Ack {
        #[serde(default = "root_namespace")]
        nsp: String,
        #[serde(default)]
        data: Vec<Value>,
        id: u64,
    },

    /// Error report
    Error {
        #[serde(default = "root_namespace")]
        nsp: String,
        message: String,
    },
}

impl Packet {
    pub fn connect(nsp: impl Into<String>, sid: Option<String>) -> Self {
        Packet::Connect {
            nsp: nsp.into(),
            sid,
        }
    }

    pub fn disconnect(nsp: impl Into<String>) -> Self {
        Packet::Disconnect { nsp: nsp.into() }
    }

    /// Create an event packet from an event name and its arguments
    pub fn event(nsp: impl Into<String>, event: &str, args: Vec<Value>, id: Option<u64>) -> Self {
        let data = std::iter::once(Value::String(event.to_string()))
            .chain(args)
            .collect();
        Packet::Event {
            nsp: nsp.into(),
            data,
            id,
        }
    }

    pub fn ack(nsp: impl Into<String>, id: u64, data: Vec<Value>) -> Self {
        Packet::Ack {
            nsp: nsp.into(),
            data,
            id,
        }
    }

    pub fn error(nsp: impl Into<String>, message: impl Into<String>) -> Self {
        Packet::Error {
            nsp: nsp.into(),
            message: message.into(),
        }
    }

    /// Namespace the packet belongs to
    pub fn nsp(&self) -> &str {
        match self {
            Packet::Connect { nsp, .. }
            | Packet::Disconnect { nsp }
            | Packet::Event { nsp, .. }
            | Packet::Ack { nsp, .. }
            | Packet::Error { nsp, .. } => nsp.as_str(),
        }
    }

    /// Event name of an event packet
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Packet::Event { data, .. } => data.first().and_then(Value::as_str),
            _ => None,
        }
    }

    /// Parse and validate a packet from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let packet: Self = serde_json::from_str(json)?;
        packet.validate()?;
        Ok(packet)
    }

    /// Serialize the packet to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validate packet contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if !self.nsp().starts_with('/') {
            return Err(ProtocolError::InvalidPacket(format!(
                "namespace '{}' must start with '/'",
                self.nsp()
            )));
        }

        if let Packet::Event { data, .. } = self {
            let name = match data.first() {
                Some(Value::String(name)) => name,
                Some(_) => {
                    return Err(ProtocolError::InvalidPacket(
                        "event name must be a string".to_string(),
                    ))
                }
                None => {
                    return Err(ProtocolError::InvalidPacket(
                        "event data cannot be empty".to_string(),
                    ))
                }
            };
            if name.is_empty() {
                return Err(ProtocolError::InvalidPacket(
                    "event name cannot be empty".to_string(),
                ));
            }
            if name.len() > MAX_EVENT_NAME_LENGTH {
                return Err(ProtocolError::InvalidPacket(format!(
                    "event name exceeds maximum length of {} bytes",
                    MAX_EVENT_NAME_LENGTH
                )));
            }
        }

        Ok(())
    }
}
