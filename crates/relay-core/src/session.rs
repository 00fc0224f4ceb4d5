//! Session identity and the outbound send capability.

use async_trait::async_trait;
use relay_protocol::BroadcastEvent;
use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque identifier of one connected client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// Create a session ID.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Generate a process-unique session ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::new(format!("sess_{timestamp:x}_{seq:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Failure to deliver to a session. Any variant means the session is gone.
#[derive(Debug, Error)]
pub enum SendError {
    /// The session's connection is closed.
    #[error("Session closed")]
    Closed,

    /// The session's outbound queue is full.
    #[error("Session queue full")]
    Full,

    /// The transport does not know the session.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Any other transport failure.
    #[error("Send failed: {0}")]
    Failed(String),
}

/// Delivers decoded events to client sessions.
///
/// Implemented by the client-facing transport.
#[async_trait]
pub trait SessionSender: Send + Sync {
    /// Push `event` to `session`, addressed to `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session can no longer be reached.
    async fn send_to_session(
        &self,
        session: &SessionId,
        destination: &str,
        event: &BroadcastEvent,
    ) -> Result<(), SendError>;
}
