//! Session tracker.
//!
//! Bridges transport events to the registry. Each session carries a reverse
//! index of the topics it follows, and per topic the event kinds it asked
//! for, so disconnect cleanup touches only that session's own topics and
//! fan-out only reaches sessions subscribed to the event's destination.

use crate::dispatcher::FanOut;
use crate::registry::{RegistryError, SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome};
use crate::session::{SessionId, SessionSender};
use crate::topic::{DestinationScheme, Topic};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use relay_protocol::{BroadcastEvent, EventKind};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tracker errors.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The registry rejected the change.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The session follows too many topics.
    #[error("Maximum subscriptions reached")]
    SubscriptionLimitReached,
}

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Maximum topics a single session may follow.
    pub max_subscriptions_per_session: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_session: 100,
        }
    }
}

type Interests = HashMap<Topic, BTreeSet<EventKind>>;

/// Tracks session interests and delivers events to sessions.
pub struct SessionTracker {
    registry: Arc<SubscriptionRegistry>,
    sender: Arc<dyn SessionSender>,
    scheme: DestinationScheme,
    /// Session → topic → event kinds.
    interests: DashMap<SessionId, Interests>,
    config: TrackerConfig,
}

impl SessionTracker {
    /// Create a tracker over `registry` that delivers through `sender`.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        sender: Arc<dyn SessionSender>,
        scheme: DestinationScheme,
        config: TrackerConfig,
    ) -> Self {
        Self {
            registry,
            sender,
            scheme,
            interests: DashMap::new(),
            config,
        }
    }

    /// The registry this tracker drives.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// The destination scheme used to parse client destinations.
    #[must_use]
    pub fn scheme(&self) -> &DestinationScheme {
        &self.scheme
    }

    /// Subscribe a session to every event kind of a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the session limit is reached or the registry fails
    /// to attach the topic's listener.
    pub async fn on_session_subscribed(
        &self,
        session: &SessionId,
        topic: &Topic,
    ) -> Result<SubscribeOutcome, TrackerError> {
        self.subscribe_kinds(session, topic, &EventKind::ALL).await
    }

    /// Subscribe a session to a client destination.
    ///
    /// Destinations that are not stream destinations are ignored and yield
    /// `Ok(false)`. An unrecognised suffix subscribes to every kind.
    ///
    /// # Errors
    ///
    /// See [`SessionTracker::on_session_subscribed`].
    pub async fn on_destination_subscribed(
        &self,
        session: &SessionId,
        destination: &str,
    ) -> Result<bool, TrackerError> {
        let Some(parsed) = self.scheme.parse(destination) else {
            debug!(session = %session, destination, "Ignoring non-stream destination");
            return Ok(false);
        };

        match parsed.kind {
            Some(kind) => self.subscribe_kinds(session, &parsed.topic, &[kind]).await?,
            None => self.subscribe_kinds(session, &parsed.topic, &EventKind::ALL).await?,
        };
        Ok(true)
    }

    /// Unsubscribe a session from a client destination.
    ///
    /// The session leaves the topic once it follows none of its kinds.
    /// Returns `Ok(false)` for destinations that are not stream destinations.
    ///
    /// # Errors
    ///
    /// Returns an error if leaving the topic fails to detach its listener.
    pub async fn on_destination_unsubscribed(
        &self,
        session: &SessionId,
        destination: &str,
    ) -> Result<bool, TrackerError> {
        let Some(parsed) = self.scheme.parse(destination) else {
            debug!(session = %session, destination, "Ignoring non-stream destination");
            return Ok(false);
        };

        let kinds: &[EventKind] = match parsed.kind {
            Some(ref kind) => std::slice::from_ref(kind),
            None => &EventKind::ALL,
        };

        let leave = match self.interests.get_mut(session) {
            Some(mut topics) => match topics.get_mut(&parsed.topic) {
                Some(followed) => {
                    for kind in kinds {
                        followed.remove(kind);
                    }
                    if followed.is_empty() {
                        topics.remove(&parsed.topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            },
            None => false,
        };
        self.interests.remove_if(session, |_, topics| topics.is_empty());

        if leave {
            self.registry.unsubscribe(&parsed.topic, session).await?;
        }
        Ok(true)
    }

    /// Unsubscribe a session from a topic entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic's listener cannot be detached.
    pub async fn on_session_unsubscribed(
        &self,
        session: &SessionId,
        topic: &Topic,
    ) -> Result<UnsubscribeOutcome, TrackerError> {
        if let Some(mut topics) = self.interests.get_mut(session) {
            topics.remove(topic);
        }
        self.interests.remove_if(session, |_, topics| topics.is_empty());

        Ok(self.registry.unsubscribe(topic, session).await?)
    }

    /// Remove a session from every topic it follows.
    ///
    /// Registry failures are logged; a topic whose listener failed to detach
    /// is retried during its next fan-out. Returns the number of topics left.
    pub async fn on_session_disconnected(&self, session: &SessionId) -> usize {
        let Some((_, topics)) = self.interests.remove(session) else {
            debug!(session = %session, "Disconnect of session without subscriptions");
            return 0;
        };

        let mut left = 0;
        for topic in topics.keys() {
            match self.registry.unsubscribe(topic, session).await {
                Ok(_) => left += 1,
                Err(e) => warn!(session = %session, topic = %topic, error = %e, "Cleanup failed"),
            }
        }

        info!(session = %session, topics = left, "Session cleaned up");
        left
    }

    /// Topics a session follows.
    #[must_use]
    pub fn topics_for(&self, session: &SessionId) -> Vec<Topic> {
        self.interests
            .get(session)
            .map(|topics| topics.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of sessions with at least one subscription.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.interests.len()
    }

    async fn subscribe_kinds(
        &self,
        session: &SessionId,
        topic: &Topic,
        kinds: &[EventKind],
    ) -> Result<SubscribeOutcome, TrackerError> {
        let new_topic = {
            let mut topics = self.interests.entry(session.clone()).or_default();
            let new_topic = !topics.contains_key(topic);
            if new_topic && topics.len() >= self.config.max_subscriptions_per_session {
                drop(topics);
                self.interests.remove_if(session, |_, topics| topics.is_empty());
                return Err(TrackerError::SubscriptionLimitReached);
            }
            topics
                .entry(topic.clone())
                .or_default()
                .extend(kinds.iter().copied());
            new_topic
        };

        match self.registry.subscribe(topic, session).await {
            Ok(outcome) => {
                debug!(session = %session, topic = %topic, ?kinds, "Session subscribed");
                Ok(outcome)
            }
            Err(e) => {
                if new_topic {
                    if let Some(mut topics) = self.interests.get_mut(session) {
                        topics.remove(topic);
                    }
                    self.interests.remove_if(session, |_, topics| topics.is_empty());
                }
                Err(e.into())
            }
        }
    }

    /// Whether `session` wants `kind` on `topic`; `None` if it follows nothing there.
    fn wants(&self, session: &SessionId, topic: &Topic, kind: EventKind) -> Option<bool> {
        self.interests
            .get(session)
            .and_then(|topics| topics.get(topic).map(|kinds| kinds.contains(&kind)))
    }
}

#[async_trait]
impl FanOut for SessionTracker {
    async fn fan_out(&self, topic: &Topic, destination: &str, event: &BroadcastEvent) -> usize {
        let kind = event.kind();
        let mut recipients = Vec::new();

        for session in self.registry.sessions(topic).await {
            match self.wants(&session, topic, kind) {
                Some(true) => recipients.push(session),
                Some(false) => {}
                None => {
                    // Left behind by a failed detach or a racing disconnect.
                    debug!(session = %session, topic = %topic, "Removing stale session");
                    if let Err(e) = self.registry.unsubscribe(topic, &session).await {
                        warn!(session = %session, topic = %topic, error = %e, "Stale cleanup failed");
                    }
                }
            }
        }

        let sends = recipients.iter().map(|session| async move {
            let result = self.sender.send_to_session(session, destination, event).await;
            (session, result)
        });

        let mut delivered = 0;
        for (session, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(session = %session, destination, error = %e, "Send failed, dropping session");
                    self.on_session_disconnected(session).await;
                }
            }
        }
        delivered
    }
}
