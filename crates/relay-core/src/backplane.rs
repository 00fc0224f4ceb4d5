//! The assembled backplane.
//!
//! Owns one publisher, one dispatcher, one registry and one session tracker,
//! wired to a shared bus. Build one per process and share it by `Arc`.
//!
//! Ownership runs registry → dispatcher (strong) and tracker → registry
//! (strong); the dispatcher only holds a weak reference back to the tracker.

use crate::bus::MessageBus;
use crate::dispatcher::{Dispatcher, FanOut};
use crate::publisher::{PublishError, Publisher};
use crate::registry::{RegistryConfig, SubscribeOutcome, SubscriptionRegistry};
use crate::session::{SessionId, SessionSender};
use crate::topic::{DestinationScheme, Topic, DEFAULT_TOPIC_PREFIX};
use crate::tracker::{SessionTracker, TrackerConfig, TrackerError};
use relay_protocol::{BroadcastEvent, EnvelopeCodec, WireFormat};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::info;

/// Backplane configuration.
#[derive(Debug, Clone)]
pub struct BackplaneConfig {
    /// Prefix of client destinations.
    pub topic_prefix: String,
    /// Format envelopes are published in.
    pub wire_format: WireFormat,
    /// Registry limits.
    pub registry: RegistryConfig,
    /// Per-session limits.
    pub tracker: TrackerConfig,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            wire_format: WireFormat::default(),
            registry: RegistryConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

/// Per-process broadcast backplane.
pub struct Backplane {
    publisher: Publisher,
    tracker: Arc<SessionTracker>,
}

impl Backplane {
    /// Build a backplane on `bus`, delivering to sessions through `sender`.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        sender: Arc<dyn SessionSender>,
        config: BackplaneConfig,
    ) -> Self {
        info!(
            bus = bus.name(),
            prefix = %config.topic_prefix,
            format = ?config.wire_format,
            "Creating backplane"
        );

        let scheme = DestinationScheme::new(config.topic_prefix.as_str());
        let tracker = Arc::new_cyclic(|tracker: &Weak<SessionTracker>| {
            let target: Weak<dyn FanOut> = tracker.clone();
            let dispatcher = Arc::new(Dispatcher::new(target, scheme.clone()));
            let registry = Arc::new(SubscriptionRegistry::new(
                Arc::clone(&bus),
                dispatcher,
                config.registry.clone(),
            ));
            SessionTracker::new(registry, sender, scheme, config.tracker.clone())
        });

        Self {
            publisher: Publisher::new(bus, EnvelopeCodec::new(config.wire_format)),
            tracker,
        }
    }

    /// Publish a payload of type `kind` to every instance following `topic`.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub async fn publish<T: Serialize + ?Sized + Sync>(
        &self,
        topic: &Topic,
        kind: &str,
        payload: &T,
    ) -> Result<usize, PublishError> {
        self.publisher.publish(topic, kind, payload).await
    }

    /// Publish a typed event on its stream's topic.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish_event`].
    pub async fn publish_event(&self, event: &BroadcastEvent) -> Result<usize, PublishError> {
        self.publisher.publish_event(event).await
    }

    /// A session started following every event kind of `topic`.
    ///
    /// # Errors
    ///
    /// See [`SessionTracker::on_session_subscribed`].
    pub async fn on_session_subscribed(
        &self,
        session: &SessionId,
        topic: &Topic,
    ) -> Result<SubscribeOutcome, TrackerError> {
        self.tracker.on_session_subscribed(session, topic).await
    }

    /// A session went away.
    pub async fn on_session_disconnected(&self, session: &SessionId) -> usize {
        self.tracker.on_session_disconnected(session).await
    }

    /// The session tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    /// The subscription registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.tracker.registry()
    }

    /// The destination scheme.
    #[must_use]
    pub fn scheme(&self) -> &DestinationScheme {
        self.tracker.scheme()
    }

    /// Detach every bus listener. Returns the number detached.
    pub async fn shutdown(&self) -> usize {
        let detached = self.registry().drain().await;
        info!(detached, "Backplane shut down");
        detached
    }
}
