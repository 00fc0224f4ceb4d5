//! Bus message dispatcher.
//!
//! Decodes envelopes arriving on a topic's bus channel and hands the typed
//! event to the fan-out target under the destination for its kind. Every
//! message is handled on its own; a bad message is logged and dropped.

use crate::bus::BusListener;
use crate::topic::{DestinationScheme, Topic};
use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{
    codec, AnalysisResult, BroadcastEvent, ChatMessage, Envelope, EventKind, ProtocolError,
    StreamUserCountUpdate, SummaryResult,
};
use std::sync::Weak;
use tracing::{trace, warn};

/// Delivers a decoded event to local sessions.
#[async_trait]
pub trait FanOut: Send + Sync {
    /// Deliver `event` to the sessions on `topic` that follow `destination`.
    /// Returns the number of successful sends.
    async fn fan_out(&self, topic: &Topic, destination: &str, event: &BroadcastEvent) -> usize;
}

type DecodeFn = fn(&Envelope) -> Result<BroadcastEvent, ProtocolError>;

/// One routing table entry.
struct Route {
    kind: EventKind,
    decode: DecodeFn,
}

fn decode_chat(envelope: &Envelope) -> Result<BroadcastEvent, ProtocolError> {
    envelope.payload_as::<ChatMessage>().map(BroadcastEvent::Chat)
}

fn decode_analysis(envelope: &Envelope) -> Result<BroadcastEvent, ProtocolError> {
    envelope
        .payload_as::<AnalysisResult>()
        .map(BroadcastEvent::Analysis)
}

fn decode_summary(envelope: &Envelope) -> Result<BroadcastEvent, ProtocolError> {
    envelope
        .payload_as::<SummaryResult>()
        .map(BroadcastEvent::Summary)
}

fn decode_user_count(envelope: &Envelope) -> Result<BroadcastEvent, ProtocolError> {
    envelope
        .payload_as::<StreamUserCountUpdate>()
        .map(BroadcastEvent::UserCount)
}

/// Event kind → decoder.
const ROUTES: &[Route] = &[
    Route { kind: EventKind::Chat, decode: decode_chat },
    Route { kind: EventKind::Analysis, decode: decode_analysis },
    Route { kind: EventKind::Summary, decode: decode_summary },
    Route { kind: EventKind::UserCount, decode: decode_user_count },
];

/// Route for an envelope tag; tag aliases resolve through [`EventKind::from_tag`].
fn route(tag: &str) -> Option<&'static Route> {
    let kind = EventKind::from_tag(tag)?;
    ROUTES.iter().find(|route| route.kind == kind)
}

/// What happened to one bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Decoded and handed to fan-out; carries the number of sessions reached.
    Delivered(usize),
    /// The envelope or its payload could not be decoded.
    Malformed,
    /// The envelope tag is not routed.
    UnknownType(String),
    /// The channel does not carry a topic.
    UnknownChannel,
    /// The fan-out target is gone (shutting down).
    NoTarget,
}

/// Routes bus messages to the fan-out target.
pub struct Dispatcher {
    target: Weak<dyn FanOut>,
    scheme: DestinationScheme,
}

impl Dispatcher {
    /// Create a dispatcher delivering to `target`.
    #[must_use]
    pub fn new(target: Weak<dyn FanOut>, scheme: DestinationScheme) -> Self {
        Self { target, scheme }
    }

    /// Decode and deliver one message received for `topic`.
    pub async fn dispatch(&self, topic: &Topic, data: &[u8]) -> DispatchOutcome {
        let envelope = match codec::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping undecodable envelope");
                return DispatchOutcome::Malformed;
            }
        };

        let Some(route) = route(&envelope.kind) else {
            warn!(topic = %topic, kind = %envelope.kind, "Dropping message of unknown type");
            return DispatchOutcome::UnknownType(envelope.kind);
        };

        let event = match (route.decode)(&envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!(topic = %topic, kind = %route.kind, error = %e, "Dropping malformed payload");
                return DispatchOutcome::Malformed;
            }
        };

        let Some(target) = self.target.upgrade() else {
            trace!(topic = %topic, "No fan-out target");
            return DispatchOutcome::NoTarget;
        };

        let destination = self.scheme.destination(topic, route.kind);
        let delivered = target.fan_out(topic, &destination, &event).await;
        trace!(topic = %topic, destination = %destination, delivered, "Dispatched");
        DispatchOutcome::Delivered(delivered)
    }
}

#[async_trait]
impl BusListener for Dispatcher {
    async fn on_message(&self, channel: &str, payload: Bytes) {
        match Topic::from_channel(channel) {
            Some(topic) => {
                self.dispatch(&topic, &payload).await;
            }
            None => warn!(channel, "Message on unexpected channel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{SenderInfo, WireFormat};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Capture {
        calls: Mutex<Vec<(Topic, String, BroadcastEvent)>>,
    }

    #[async_trait]
    impl FanOut for Capture {
        async fn fan_out(&self, topic: &Topic, destination: &str, event: &BroadcastEvent) -> usize {
            self.calls
                .lock()
                .await
                .push((topic.clone(), destination.to_string(), event.clone()));
            1
        }
    }

    fn setup() -> (Arc<Capture>, Dispatcher) {
        let capture = Arc::new(Capture::default());
        let target: Arc<dyn FanOut> = capture.clone();
        let dispatcher = Dispatcher::new(Arc::downgrade(&target), DestinationScheme::default());
        (capture, dispatcher)
    }

    fn topic() -> Topic {
        Topic::new("42").unwrap()
    }

    #[test]
    fn test_every_kind_and_alias_has_a_route() {
        for kind in EventKind::ALL {
            assert_eq!(route(kind.tag()).map(|r| r.kind), Some(kind));
            assert_eq!(route(kind.suffix()).map(|r| r.kind), Some(kind));
        }
        assert!(route("bogus").is_none());
    }

    #[tokio::test]
    async fn test_routes_every_kind_to_its_destination() {
        let (capture, dispatcher) = setup();
        let summary = SummaryResult {
            stream_id: "42".into(),
            summary: "quiet".into(),
        };
        let analysis = AnalysisResult {
            stream_id: "42".into(),
            total_count: 10,
            ratios: BTreeMap::from([("positive".to_string(), 0.7)]),
        };
        let count = StreamUserCountUpdate {
            stream_id: "42".into(),
            user_count: 3,
        };
        let chat = ChatMessage {
            sender: SenderInfo {
                id: "u".into(),
                name: "n".into(),
                profile_image_url: None,
            },
            content: "c".into(),
            stream_id: "42".into(),
        };

        let messages = [
            codec::encode(WireFormat::Json, "summary", &summary).unwrap(),
            codec::encode(WireFormat::MessagePack, "analysis", &analysis).unwrap(),
            codec::encode(WireFormat::Json, "stream-update", &count).unwrap(),
            codec::encode(WireFormat::Json, "chat", &chat).unwrap(),
        ];
        for data in &messages {
            assert_eq!(dispatcher.dispatch(&topic(), data).await, DispatchOutcome::Delivered(1));
        }

        let calls = capture.calls.lock().await;
        let destinations: Vec<&str> = calls.iter().map(|(_, d, _)| d.as_str()).collect();
        assert_eq!(
            destinations,
            [
                "/topic/stream/42/summary",
                "/topic/stream/42/analysis",
                "/topic/stream/42/user-count",
                "/topic/stream/42/message",
            ]
        );
        assert_eq!(calls[0].2, BroadcastEvent::Summary(summary));
        assert_eq!(calls[1].2, BroadcastEvent::Analysis(analysis));
        assert_eq!(calls[3].2, BroadcastEvent::Chat(chat));
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped() {
        let (capture, dispatcher) = setup();
        let data = codec::encode(WireFormat::Json, "bogus", &serde_json::json!({})).unwrap();

        assert_eq!(
            dispatcher.dispatch(&topic(), &data).await,
            DispatchOutcome::UnknownType("bogus".into())
        );
        assert!(capture.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_messages_are_dropped() {
        let (capture, dispatcher) = setup();

        assert_eq!(dispatcher.dispatch(&topic(), b"{oops").await, DispatchOutcome::Malformed);

        let wrong_shape =
            codec::encode(WireFormat::Json, "summary", &serde_json::json!({"x": 1})).unwrap();
        assert_eq!(
            dispatcher.dispatch(&topic(), &wrong_shape).await,
            DispatchOutcome::Malformed
        );
        assert!(capture.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_target() {
        let (capture, dispatcher) = setup();
        drop(capture);

        let data = codec::encode(
            WireFormat::Json,
            "summary",
            &SummaryResult {
                stream_id: "42".into(),
                summary: "s".into(),
            },
        )
        .unwrap();
        assert_eq!(dispatcher.dispatch(&topic(), &data).await, DispatchOutcome::NoTarget);
    }

    #[tokio::test]
    async fn test_listener_derives_topic_from_channel() {
        let (capture, dispatcher) = setup();
        let data = codec::encode(
            WireFormat::Json,
            "user-count",
            &StreamUserCountUpdate {
                stream_id: "7".into(),
                user_count: 1,
            },
        )
        .unwrap();

        dispatcher.on_message("broadcast:7", data.clone()).await;
        dispatcher.on_message("elsewhere:7", data).await;

        let calls = capture.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_str(), "7");
        assert_eq!(calls[0].1, "/topic/stream/7/user-count");
    }
}
