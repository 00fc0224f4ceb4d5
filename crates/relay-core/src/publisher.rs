//! Publish side of the backplane.

use crate::bus::{BusError, MessageBus};
use crate::topic::{InvalidTopic, Topic};
use relay_protocol::codec::MAX_ENVELOPE_SIZE;
use relay_protocol::{BroadcastEvent, EnvelopeCodec, ProtocolError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Publish errors. Nothing is sent when one is returned.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The payload could not be encoded.
    #[error("Encode failed: {0}")]
    Encode(#[from] ProtocolError),

    /// The encoded envelope is larger than subscribers accept.
    #[error("Envelope size {size} exceeds maximum {limit}")]
    TooLarge { size: usize, limit: usize },

    /// The event's stream id is not a valid topic.
    #[error(transparent)]
    InvalidTopic(#[from] InvalidTopic),

    /// The bus rejected the message.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Encodes events into envelopes and publishes them on topic channels.
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    codec: EnvelopeCodec,
}

impl Publisher {
    /// Create a publisher writing envelopes with `codec`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, codec: EnvelopeCodec) -> Self {
        Self { bus, codec }
    }

    /// Encode `payload` under the type tag `kind` and publish it on `topic`'s
    /// channel. Returns the number of listeners the bus reported.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the envelope exceeds
    /// [`MAX_ENVELOPE_SIZE`] (nothing is sent in either case), or if the bus
    /// rejects the message. Failures are not retried.
    pub async fn publish<T: Serialize + ?Sized + Sync>(
        &self,
        topic: &Topic,
        kind: &str,
        payload: &T,
    ) -> Result<usize, PublishError> {
        let bytes = self.codec.encode(kind, payload)?;
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(PublishError::TooLarge {
                size: bytes.len(),
                limit: MAX_ENVELOPE_SIZE,
            });
        }
        let channel = topic.channel();
        let receivers = self.bus.publish(&channel, bytes).await?;
        debug!(topic = %topic, kind, receivers, "Published");
        Ok(receivers)
    }

    /// Publish a typed event on the topic named by its stream id.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream id is not a valid topic, or as
    /// [`Publisher::publish`].
    pub async fn publish_event(&self, event: &BroadcastEvent) -> Result<usize, PublishError> {
        let topic = Topic::new(event.stream_id())?;
        self.publish(&topic, event.kind().tag(), event).await
    }
}
