//! Envelope codec for bus messages.
//!
//! Every event published for a topic is wrapped in an envelope that carries a
//! type tag next to the serialized payload, so heterogeneous events share one
//! bus channel per topic. The envelope is serialized once more for transit:
//!
//! - JSON: `{"type": "<tag>", "payload": "<payload as JSON text>"}`
//! - MessagePack: a named map `{type: str, payload: bin}`
//!
//! Decoding sniffs the format, so publishers and subscribers may disagree on
//! which one they write.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest envelope [`decode`] accepts (1 MiB). Encoding is not limited;
/// publishers check this bound themselves before sending.
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    EnvelopeTooLarge(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid envelope data.
    #[error("Invalid envelope: {0}")]
    Invalid(String),
}

/// Serialization used for envelopes on the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON text, compatible with existing deployments.
    #[default]
    Json,
    /// MessagePack binary.
    #[serde(alias = "msgpack")]
    MessagePack,
}

impl WireFormat {
    /// Detect the format of an encoded envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is empty or blank.
    pub fn sniff(data: &[u8]) -> Result<Self, ProtocolError> {
        match data.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => Ok(WireFormat::Json),
            Some(_) => Ok(WireFormat::MessagePack),
            None => Err(ProtocolError::Invalid("empty envelope".into())),
        }
    }
}

/// A decoded envelope: type tag plus still-serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Type tag selecting how the payload is decoded and routed.
    pub kind: String,
    /// Payload bytes, serialized in `format`.
    pub payload: Bytes,
    /// Format the payload is serialized in.
    pub format: WireFormat,
}

impl Envelope {
    /// Create an envelope around an already-serialized payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: impl Into<Bytes>, format: WireFormat) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            format,
        }
    }

    /// Decode the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not deserialize as `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        match self.format {
            WireFormat::Json => Ok(serde_json::from_slice(&self.payload)?),
            WireFormat::MessagePack => Ok(rmp_serde::from_slice(&self.payload)?),
        }
    }

    /// Serialize this envelope for transit.
    ///
    /// # Errors
    ///
    /// Returns an error if a JSON payload is not UTF-8.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let encoded = match self.format {
            WireFormat::Json => {
                let payload = std::str::from_utf8(&self.payload)
                    .map_err(|_| ProtocolError::Invalid("JSON payload is not UTF-8".into()))?;
                serde_json::to_vec(&JsonEnvelope {
                    kind: self.kind.clone(),
                    payload: payload.to_owned(),
                })?
            }
            WireFormat::MessagePack => rmp_serde::to_vec_named(&PackedEnvelope {
                kind: self.kind.clone(),
                payload: self.payload.to_vec(),
            })?,
        };
        Ok(Bytes::from(encoded))
    }
}

#[derive(Serialize, Deserialize)]
struct JsonEnvelope {
    #[serde(rename = "type")]
    kind: String,
    payload: String,
}

#[derive(Serialize, Deserialize)]
struct PackedEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

/// Serialize a payload and wrap it in an envelope.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode<T: Serialize + ?Sized>(
    format: WireFormat,
    kind: &str,
    payload: &T,
) -> Result<Bytes, ProtocolError> {
    let payload = match format {
        WireFormat::Json => serde_json::to_vec(payload)?,
        WireFormat::MessagePack => rmp_serde::to_vec_named(payload)?,
    };
    Envelope::new(kind, payload, format).to_bytes()
}

/// Decode an envelope from bus bytes.
///
/// The payload is left serialized; see [`Envelope::payload_as`].
///
/// # Errors
///
/// Returns an error if the data is too large, empty, or malformed.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(data.len()));
    }

    match WireFormat::sniff(data)? {
        WireFormat::Json => {
            let wire: JsonEnvelope = serde_json::from_slice(data)?;
            Ok(Envelope::new(
                wire.kind,
                wire.payload.into_bytes(),
                WireFormat::Json,
            ))
        }
        WireFormat::MessagePack => {
            let wire: PackedEnvelope = rmp_serde::from_slice(data)?;
            Ok(Envelope::new(wire.kind, wire.payload, WireFormat::MessagePack))
        }
    }
}

/// Codec bound to the wire format an instance publishes with.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    format: WireFormat,
}

impl EnvelopeCodec {
    /// Create a codec that encodes with `format`.
    #[must_use]
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// The format this codec encodes with.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Serialize a payload and wrap it in an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        kind: &str,
        payload: &T,
    ) -> Result<Bytes, ProtocolError> {
        encode(self.format, kind, payload)
    }

    /// Decode an envelope in whichever format it was written.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, data: &[u8]) -> Result<Envelope, ProtocolError> {
        decode(data)
    }
}
