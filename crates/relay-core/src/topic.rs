//! Topic identifiers and the names derived from them.
//!
//! A topic (usually a stream id) maps 1:1 to a bus channel named
//! `broadcast:<topic>` and to one client-facing destination per event kind,
//! `<prefix>/stream/<topic>/<suffix>`.

use relay_protocol::EventKind;
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Maximum topic length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Prefix of every bus channel carrying a topic.
pub const CHANNEL_PREFIX: &str = "broadcast:";

/// Default prefix of client-facing destinations.
pub const DEFAULT_TOPIC_PREFIX: &str = "/topic";

/// Segment between the prefix and the topic in a destination.
const STREAM_SEGMENT: &str = "/stream/";

/// Topic validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid topic: {0}")]
pub struct InvalidTopic(pub &'static str);

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic is invalid.
pub fn validate_topic(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic cannot be empty");
    }
    if name.len() > MAX_TOPIC_LENGTH {
        return Err("Topic too long");
    }
    if name.contains('/') {
        return Err("Topic cannot contain '/'");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic contains invalid characters");
    }
    Ok(())
}

/// A validated topic key.
///
/// Cheap to clone; the name is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(Arc<str>);

impl Topic {
    /// Create a topic, validating the name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, too long, or contains `/` or
    /// non-printable characters.
    pub fn new(name: impl AsRef<str>) -> Result<Self, InvalidTopic> {
        let name = name.as_ref();
        validate_topic(name).map_err(InvalidTopic)?;
        Ok(Self(Arc::from(name)))
    }

    /// Recover the topic from a bus channel name.
    #[must_use]
    pub fn from_channel(channel: &str) -> Option<Self> {
        channel
            .strip_prefix(CHANNEL_PREFIX)
            .and_then(|name| Self::new(name).ok())
    }

    /// The bus channel carrying this topic.
    #[must_use]
    pub fn channel(&self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.0)
    }

    /// Get the topic as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Topic {
    type Error = InvalidTopic;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// A parsed client destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Topic the destination belongs to.
    pub topic: Topic,
    /// Event kind selected by the suffix, `None` when the suffix is not a known kind.
    pub kind: Option<EventKind>,
}

/// Builds and parses `<prefix>/stream/<topic>/<suffix>` destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationScheme {
    prefix: String,
}

impl DestinationScheme {
    /// Create a scheme with the given prefix (e.g. `/topic`).
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// The destination prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The destination for events of `kind` on `topic`.
    #[must_use]
    pub fn destination(&self, topic: &Topic, kind: EventKind) -> String {
        format!("{}{STREAM_SEGMENT}{topic}/{}", self.prefix, kind.suffix())
    }

    /// Parse a destination, returning `None` if it is not a stream destination.
    #[must_use]
    pub fn parse(&self, destination: &str) -> Option<Destination> {
        let rest = destination
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(STREAM_SEGMENT)?;
        let (topic, suffix) = rest.split_once('/')?;
        let topic = Topic::new(topic).ok()?;

        Some(Destination {
            topic,
            kind: EventKind::from_suffix(suffix),
        })
    }
}

impl Default for DestinationScheme {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_validation() {
        assert!(Topic::new("42").is_ok());
        assert!(Topic::new("stream-7:eu").is_ok());
        assert!(Topic::new("").is_err());
        assert!(Topic::new("a/b").is_err());
        assert!(Topic::new("tab\there").is_err());

        let long_name = "a".repeat(MAX_TOPIC_LENGTH + 1);
        assert!(Topic::new(long_name).is_err());
    }

    #[test]
    fn test_channel_naming() {
        let topic = Topic::new("42").unwrap();
        assert_eq!(topic.channel(), "broadcast:42");
        assert_eq!(Topic::from_channel("broadcast:42"), Some(topic));
        assert_eq!(Topic::from_channel("other:42"), None);
        assert_eq!(Topic::from_channel("broadcast:"), None);
    }

    #[test]
    fn test_destination_naming() {
        let scheme = DestinationScheme::default();
        let topic = Topic::new("42").unwrap();

        assert_eq!(
            scheme.destination(&topic, EventKind::Summary),
            "/topic/stream/42/summary"
        );
        assert_eq!(
            scheme.destination(&topic, EventKind::UserCount),
            "/topic/stream/42/user-count"
        );
        assert_eq!(
            scheme.destination(&topic, EventKind::Chat),
            "/topic/stream/42/message"
        );
    }

    #[test]
    fn test_destination_parsing() {
        let scheme = DestinationScheme::new("/topic/");

        let parsed = scheme.parse("/topic/stream/42/analysis").unwrap();
        assert_eq!(parsed.topic.as_str(), "42");
        assert_eq!(parsed.kind, Some(EventKind::Analysis));

        // Unknown suffixes still select the topic.
        let parsed = scheme.parse("/topic/stream/42/highlights").unwrap();
        assert_eq!(parsed.kind, None);

        assert!(scheme.parse("/topic/stream/42").is_none());
        assert!(scheme.parse("/topic/other/42/message").is_none());
        assert!(scheme.parse("/queue/stream/42/message").is_none());
        assert!(scheme.parse("/topic/stream//message").is_none());
    }
}
