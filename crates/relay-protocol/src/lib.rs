//! # relay-protocol
//!
//! Wire formats for the relay broadcast backplane.
//!
//! Two audiences share this crate:
//!
//! - **Bus envelopes** - every event published for a topic travels on one bus
//!   channel, wrapped in an [`Envelope`] whose `type` tag says how to decode the
//!   payload. Envelopes are JSON (interoperable) or MessagePack (compact).
//! - **Client frames** - the JSON text frames exchanged with WebSocket clients.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, EventKind, SummaryResult, WireFormat};
//!
//! let summary = SummaryResult {
//!     stream_id: "42".into(),
//!     summary: "Everyone loves the new map".into(),
//! };
//!
//! let bytes = codec::encode(WireFormat::Json, EventKind::Summary.tag(), &summary).unwrap();
//! let envelope = codec::decode(&bytes).unwrap();
//!
//! assert_eq!(envelope.kind, "summary");
//! assert_eq!(envelope.payload_as::<SummaryResult>().unwrap(), summary);
//! ```

pub mod codec;
pub mod events;
pub mod frames;

pub use codec::{decode, encode, Envelope, EnvelopeCodec, ProtocolError, WireFormat};
pub use events::{
    AnalysisResult, BroadcastEvent, ChatMessage, EventKind, SenderInfo, StreamUserCountUpdate,
    SummaryResult,
};
pub use frames::ClientFrame;
