//! Event payloads carried by the backplane.
//!
//! Upstream processing produces four kinds of per-stream events. Each kind has
//! a wire tag (written into the envelope) and a destination suffix (the last
//! segment of the client-facing destination it is delivered to).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::codec::ProtocolError;

/// The closed set of event kinds the backplane routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A chat line posted to a stream.
    Chat,
    /// Sentiment analysis over a stream's recent chat.
    Analysis,
    /// A generated summary of a stream's chat.
    Summary,
    /// The number of viewers currently in a stream.
    UserCount,
}

impl EventKind {
    /// Every known kind, in routing-table order.
    pub const ALL: [EventKind; 4] = [
        EventKind::Chat,
        EventKind::Analysis,
        EventKind::Summary,
        EventKind::UserCount,
    ];

    /// The tag written into envelopes for this kind.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            EventKind::Chat => "chat",
            EventKind::Analysis => "analysis",
            EventKind::Summary => "summary",
            EventKind::UserCount => "stream-update",
        }
    }

    /// The destination suffix clients subscribe to for this kind.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            EventKind::Chat => "message",
            EventKind::Analysis => "analysis",
            EventKind::Summary => "summary",
            EventKind::UserCount => "user-count",
        }
    }

    /// Resolve an envelope tag. Destination suffixes are accepted as aliases.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag || kind.suffix() == tag)
    }

    /// Resolve a destination suffix.
    #[must_use]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.suffix() == suffix)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Author of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

/// A chat line posted to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender: SenderInfo,
    pub content: String,
    pub stream_id: String,
}

/// Sentiment ratios over a stream's chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub stream_id: String,
    pub total_count: u64,
    /// Label to share of messages, each in `0.0..=1.0`.
    #[serde(default)]
    pub ratios: BTreeMap<String, f64>,
}

/// A generated summary of a stream's chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResult {
    pub stream_id: String,
    pub summary: String,
}

/// Viewer count change for a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamUserCountUpdate {
    pub stream_id: String,
    pub user_count: u64,
}

/// A decoded event, ready to hand to client sessions.
///
/// Serializes as the bare payload so clients see the same JSON the publisher
/// produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BroadcastEvent {
    Chat(ChatMessage),
    Analysis(AnalysisResult),
    Summary(SummaryResult),
    UserCount(StreamUserCountUpdate),
}

impl BroadcastEvent {
    /// The kind of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            BroadcastEvent::Chat(_) => EventKind::Chat,
            BroadcastEvent::Analysis(_) => EventKind::Analysis,
            BroadcastEvent::Summary(_) => EventKind::Summary,
            BroadcastEvent::UserCount(_) => EventKind::UserCount,
        }
    }

    /// The stream id carried inside the payload.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        match self {
            BroadcastEvent::Chat(e) => &e.stream_id,
            BroadcastEvent::Analysis(e) => &e.stream_id,
            BroadcastEvent::Summary(e) => &e.stream_id,
            BroadcastEvent::UserCount(e) => &e.stream_id,
        }
    }

    /// Build an event of the given kind from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not match the kind's shape.
    pub fn from_json(kind: EventKind, value: serde_json::Value) -> Result<Self, ProtocolError> {
        Ok(match kind {
            EventKind::Chat => BroadcastEvent::Chat(serde_json::from_value(value)?),
            EventKind::Analysis => BroadcastEvent::Analysis(serde_json::from_value(value)?),
            EventKind::Summary => BroadcastEvent::Summary(serde_json::from_value(value)?),
            EventKind::UserCount => BroadcastEvent::UserCount(serde_json::from_value(value)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_and_suffix() {
        assert_eq!(EventKind::Chat.tag(), "chat");
        assert_eq!(EventKind::Chat.suffix(), "message");
        assert_eq!(EventKind::UserCount.tag(), "stream-update");
        assert_eq!(EventKind::UserCount.suffix(), "user-count");
    }

    #[test]
    fn test_from_tag_accepts_aliases() {
        assert_eq!(EventKind::from_tag("chat"), Some(EventKind::Chat));
        assert_eq!(EventKind::from_tag("message"), Some(EventKind::Chat));
        assert_eq!(EventKind::from_tag("user-count"), Some(EventKind::UserCount));
        assert_eq!(EventKind::from_tag("bogus"), None);

        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_tag(kind.tag()), Some(kind));
            assert_eq!(EventKind::from_suffix(kind.suffix()), Some(kind));
        }
    }

    #[test]
    fn test_chat_message_camel_case() {
        let value = json!({
            "sender": {"id": "u1", "name": "alice", "profileImageUrl": "https://img/a.png"},
            "content": "hi",
            "streamId": "42"
        });
        let event = BroadcastEvent::from_json(EventKind::Chat, value.clone()).unwrap();
        assert_eq!(event.kind(), EventKind::Chat);
        assert_eq!(event.stream_id(), "42");

        // Untagged serialization yields the bare payload again.
        assert_eq!(serde_json::to_value(&event).unwrap(), value);
    }

    #[test]
    fn test_from_json_rejects_wrong_shape() {
        let value = json!({"streamId": "42"});
        assert!(BroadcastEvent::from_json(EventKind::Summary, value).is_err());
    }
}
