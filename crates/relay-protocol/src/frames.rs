//! Client frames for the WebSocket transport.
//!
//! Frames are JSON text messages tagged by `type`. Clients subscribe to
//! destinations such as `/topic/stream/42/summary` and receive `message`
//! frames addressed to them.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Error codes carried by [`ClientFrame::Error`].
pub mod codes {
    /// The frame could not be parsed.
    pub const INVALID_FRAME: u16 = 1001;
    /// Subscribing failed (bus unavailable, limits).
    pub const SUBSCRIBE_FAILED: u16 = 1002;
    /// The destination is not a stream destination.
    pub const INVALID_DESTINATION: u16 = 1003;
    /// Unsubscribing failed.
    pub const UNSUBSCRIBE_FAILED: u16 = 1008;
}

/// A frame exchanged with a WebSocket client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Initial handshake from the client.
    Connect {
        /// Optional bearer token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Handshake response.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Identifier assigned to the session.
        session_id: String,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Subscribe to a destination.
    Subscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Destination, e.g. `/topic/stream/42/message`.
        destination: String,
    },

    /// Unsubscribe from a destination.
    Unsubscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Destination previously subscribed to.
        destination: String,
    },

    /// An event delivered to a destination.
    Message {
        /// Destination the event was routed to.
        destination: String,
        /// Event payload.
        body: serde_json::Value,
    },

    /// Acknowledgment of a request.
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(session_id: impl Into<String>, heartbeat: u32) -> Self {
        ClientFrame::Connected {
            session_id: session_id.into(),
            heartbeat,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, destination: impl Into<String>) -> Self {
        ClientFrame::Subscribe {
            id,
            destination: destination.into(),
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u64, destination: impl Into<String>) -> Self {
        ClientFrame::Unsubscribe {
            id,
            destination: destination.into(),
        }
    }

    /// Create a new Message frame.
    #[must_use]
    pub fn message(destination: impl Into<String>, body: serde_json::Value) -> Self {
        ClientFrame::Message {
            destination: destination.into(),
            body,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        ClientFrame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        ClientFrame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ClientFrame::Pong { timestamp }
    }

    /// Encode the frame as JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid frame.
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
