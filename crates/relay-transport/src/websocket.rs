//! WebSocket session hub.
//!
//! Every connected WebSocket session registers a bounded outbound queue here;
//! its socket task drains the queue into the socket. Fan-out only enqueues, so
//! one slow client never stalls delivery to the others: a full or closed
//! queue counts as a departed session and is dropped from the hub.

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::{SendError, SessionId, SessionSender};
use relay_protocol::{BroadcastEvent, ClientFrame};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Default per-session queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Outbound queues of the locally connected WebSocket sessions.
pub struct WsSessionHub {
    sessions: DashMap<SessionId, mpsc::Sender<ClientFrame>>,
    capacity: usize,
}

impl WsSessionHub {
    /// Create a hub whose session queues hold `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register a session and return the receiving end of its queue.
    ///
    /// Registering an existing id replaces its queue.
    pub fn register(&self, session: SessionId) -> mpsc::Receiver<ClientFrame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.sessions.insert(session.clone(), tx).is_some() {
            warn!(session = %session, "Replaced existing session queue");
        }
        debug!(session = %session, "Session registered");
        rx
    }

    /// Remove a session. Returns whether it was registered.
    pub fn unregister(&self, session: &SessionId) -> bool {
        self.sessions.remove(session).is_some()
    }

    /// Whether a session is registered.
    #[must_use]
    pub fn contains(&self, session: &SessionId) -> bool {
        self.sessions.contains_key(session)
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for WsSessionHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[async_trait]
impl SessionSender for WsSessionHub {
    async fn send_to_session(
        &self,
        session: &SessionId,
        destination: &str,
        event: &BroadcastEvent,
    ) -> Result<(), SendError> {
        let queue = self
            .sessions
            .get(session)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SendError::UnknownSession(session.to_string()))?;

        let body = serde_json::to_value(event).map_err(|e| SendError::Failed(e.to_string()))?;

        match queue.try_send(ClientFrame::message(destination, body)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.sessions.remove(session);
                Err(SendError::Full)
            }
            Err(TrySendError::Closed(_)) => {
                self.sessions.remove(session);
                Err(SendError::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::SummaryResult;

    fn event() -> BroadcastEvent {
        BroadcastEvent::Summary(SummaryResult {
            stream_id: "42".into(),
            summary: "s".into(),
        })
    }

    #[tokio::test]
    async fn test_send_enqueues_message_frame() {
        let hub = WsSessionHub::new(4);
        let session = SessionId::from("A");
        let mut rx = hub.register(session.clone());

        hub.send_to_session(&session, "/topic/stream/42/summary", &event())
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ClientFrame::Message { destination, body } => {
                assert_eq!(destination, "/topic/stream/42/summary");
                assert_eq!(body["summary"], "s");
                assert_eq!(body["streamId"], "42");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let hub = WsSessionHub::default();
        assert!(matches!(
            hub.send_to_session(&SessionId::from("ghost"), "/d", &event()).await,
            Err(SendError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_full_queue_drops_session() {
        let hub = WsSessionHub::new(1);
        let session = SessionId::from("slow");
        let _rx = hub.register(session.clone());

        hub.send_to_session(&session, "/d", &event()).await.unwrap();
        assert!(matches!(
            hub.send_to_session(&session, "/d", &event()).await,
            Err(SendError::Full)
        ));
        assert!(!hub.contains(&session));
    }

    #[tokio::test]
    async fn test_closed_queue_drops_session() {
        let hub = WsSessionHub::new(4);
        let session = SessionId::from("gone");
        drop(hub.register(session.clone()));

        assert!(matches!(
            hub.send_to_session(&session, "/d", &event()).await,
            Err(SendError::Closed)
        ));
        assert!(hub.is_empty());
    }
}
