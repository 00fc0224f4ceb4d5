//! Per-topic subscription registry.
//!
//! Tracks which local sessions follow which topic and keeps exactly one bus
//! listener attached per topic while at least one session follows it. The
//! listener is attached on the first subscribe and detached on the last
//! unsubscribe; both edges happen under the topic's own lock, so concurrent
//! subscribe/unsubscribe calls on one topic cannot both observe the edge.
//! Different topics never contend beyond a map shard, and the read paths
//! (`topics_snapshot`, `stats`) never wait on a topic lock.

use crate::bus::{BusError, BusListener, ListenerHandle, MessageBus};
use crate::session::SessionId;
use crate::topic::Topic;
use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The bus refused the listener; the topic stays inactive.
    #[error("Failed to attach listener for topic {topic}: {source}")]
    Attach {
        topic: Topic,
        #[source]
        source: BusError,
    },

    /// The bus refused to detach; the session is kept subscribed.
    #[error("Failed to detach listener for topic {topic}: {source}")]
    Detach {
        topic: Topic,
        #[source]
        source: BusError,
    },

    /// Maximum number of active topics reached.
    #[error("Maximum topics reached")]
    TopicLimitReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of topics with an attached listener.
    pub max_topics: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_topics: 10_000 }
    }
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First session on the topic; a listener was attached.
    Attached,
    /// Joined a topic that already had a listener.
    Joined,
    /// The session was already subscribed; nothing changed.
    AlreadySubscribed,
}

/// Result of an unsubscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// Last session left; the listener was detached.
    Detached,
    /// Left a topic other sessions still follow.
    Left,
    /// The session was not subscribed to the topic.
    NotSubscribed,
    /// The topic has no subscribers.
    UnknownTopic,
}

/// Point-in-time view of one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicState {
    /// Subscribed sessions.
    pub sessions: usize,
    /// Whether a bus listener is attached.
    pub listening: bool,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Active topics.
    pub topic_count: usize,
    /// Sum of sessions over all active topics.
    pub subscription_count: usize,
}

#[derive(Default)]
struct TopicSlot {
    sessions: HashSet<SessionId>,
    handle: Option<ListenerHandle>,
    /// Set once the slot is removed from the map; holders must re-fetch.
    retired: bool,
}

/// Topic → sessions registry owning the per-topic bus listeners.
pub struct SubscriptionRegistry {
    bus: Arc<dyn MessageBus>,
    listener: Arc<dyn BusListener>,
    topics: DashMap<Topic, Arc<Mutex<TopicSlot>>>,
    /// Topics with an attached listener and at least one session.
    active: DashSet<Topic>,
    /// Topic slots counted against `max_topics`, including in-flight attaches.
    reserved: AtomicUsize,
    subscriptions: AtomicUsize,
    config: RegistryConfig,
}

impl SubscriptionRegistry {
    /// Create a registry that attaches `listener` to the bus for every active topic.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        listener: Arc<dyn BusListener>,
        config: RegistryConfig,
    ) -> Self {
        info!(
            bus = bus.name(),
            max_topics = config.max_topics,
            "Creating subscription registry"
        );
        Self {
            bus,
            listener,
            topics: DashMap::new(),
            active: DashSet::new(),
            reserved: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            config,
        }
    }

    /// The bus this registry attaches to.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Subscribe a session to a topic.
    ///
    /// Attaches the bus listener when the session is the topic's first.
    /// Subscribing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be attached or the topic limit
    /// is reached. The topic is left without sessions in both cases.
    pub async fn subscribe(
        &self,
        topic: &Topic,
        session: &SessionId,
    ) -> Result<SubscribeOutcome, RegistryError> {
        loop {
            let slot = self.slot(topic);
            let mut state = slot.lock().await;
            if state.retired {
                continue;
            }

            if state.sessions.contains(session) {
                debug!(topic = %topic, session = %session, "Already subscribed");
                return Ok(SubscribeOutcome::AlreadySubscribed);
            }

            if !state.sessions.is_empty() {
                state.sessions.insert(session.clone());
                self.subscriptions.fetch_add(1, Ordering::AcqRel);
                debug!(topic = %topic, session = %session, "Joined topic");
                return Ok(SubscribeOutcome::Joined);
            }

            if !self.reserve_topic() {
                self.retire(topic, &slot, &mut state);
                warn!(topic = %topic, "Topic limit reached");
                return Err(RegistryError::TopicLimitReached);
            }

            return match self
                .bus
                .attach(&topic.channel(), Arc::clone(&self.listener))
                .await
            {
                Ok(handle) => {
                    state.handle = Some(handle);
                    state.sessions.insert(session.clone());
                    self.subscriptions.fetch_add(1, Ordering::AcqRel);
                    self.active.insert(topic.clone());
                    info!(topic = %topic, session = %session, "Topic activated");
                    Ok(SubscribeOutcome::Attached)
                }
                Err(source) => {
                    self.release_topic();
                    self.retire(topic, &slot, &mut state);
                    warn!(topic = %topic, error = %source, "Failed to attach listener");
                    Err(RegistryError::Attach {
                        topic: topic.clone(),
                        source,
                    })
                }
            };
        }
    }

    /// Unsubscribe a session from a topic.
    ///
    /// Detaches the bus listener when the session was the topic's last.
    /// Unknown topics and sessions are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be detached. The session stays
    /// subscribed so that the listener still has an owner.
    pub async fn unsubscribe(
        &self,
        topic: &Topic,
        session: &SessionId,
    ) -> Result<UnsubscribeOutcome, RegistryError> {
        loop {
            let Some(slot) = self.existing_slot(topic) else {
                warn!(topic = %topic, session = %session, "Unsubscribe from unknown topic");
                return Ok(UnsubscribeOutcome::UnknownTopic);
            };
            let mut state = slot.lock().await;
            if state.retired {
                continue;
            }

            if !state.sessions.remove(session) {
                warn!(topic = %topic, session = %session, "Session not subscribed to topic");
                return Ok(UnsubscribeOutcome::NotSubscribed);
            }

            if !state.sessions.is_empty() {
                self.subscriptions.fetch_sub(1, Ordering::AcqRel);
                debug!(topic = %topic, session = %session, "Left topic");
                return Ok(UnsubscribeOutcome::Left);
            }

            if let Some(handle) = state.handle.take() {
                if let Err(source) = self.bus.detach(&handle).await {
                    state.handle = Some(handle);
                    state.sessions.insert(session.clone());
                    warn!(topic = %topic, error = %source, "Failed to detach listener");
                    return Err(RegistryError::Detach {
                        topic: topic.clone(),
                        source,
                    });
                }
            }

            self.subscriptions.fetch_sub(1, Ordering::AcqRel);
            self.deactivate(topic);
            self.retire(topic, &slot, &mut state);
            info!(topic = %topic, session = %session, "Topic deactivated");
            return Ok(UnsubscribeOutcome::Detached);
        }
    }

    /// Topics that currently have subscribers.
    ///
    /// Topics whose first attach is still in flight are not included.
    #[must_use]
    pub fn topics_snapshot(&self) -> BTreeSet<Topic> {
        self.active.iter().map(|topic| topic.key().clone()).collect()
    }

    /// Sessions subscribed to a topic.
    pub async fn sessions(&self, topic: &Topic) -> Vec<SessionId> {
        match self.existing_slot(topic) {
            Some(slot) => {
                let state = slot.lock().await;
                if state.retired {
                    Vec::new()
                } else {
                    state.sessions.iter().cloned().collect()
                }
            }
            None => Vec::new(),
        }
    }

    /// Number of sessions subscribed to a topic.
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topic_state(topic).await.map_or(0, |s| s.sessions)
    }

    /// Whether a bus listener is attached for a topic.
    pub async fn is_listening(&self, topic: &Topic) -> bool {
        self.topic_state(topic).await.is_some_and(|s| s.listening)
    }

    /// Session count and listener presence for a topic, `None` if inactive.
    pub async fn topic_state(&self, topic: &Topic) -> Option<TopicState> {
        let slot = self.existing_slot(topic)?;
        let state = slot.lock().await;
        if state.retired || (state.sessions.is_empty() && state.handle.is_none()) {
            return None;
        }
        Some(TopicState {
            sessions: state.sessions.len(),
            listening: state.handle.is_some(),
        })
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            topic_count: self.active.len(),
            subscription_count: self.subscriptions.load(Ordering::Acquire),
        }
    }

    /// Detach every listener and forget all subscriptions.
    ///
    /// Topics are drained concurrently, so a slow detach only delays its own
    /// topic. Returns the number of listeners detached. Detach failures are
    /// logged.
    pub async fn drain(&self) -> usize {
        let drained = join_all(
            self.slots()
                .into_iter()
                .map(|(topic, slot)| async move { self.drain_topic(&topic, &slot).await }),
        )
        .await;
        let detached = drained.into_iter().filter(|detached| *detached).count();
        info!(detached, "Registry drained");
        detached
    }

    async fn drain_topic(&self, topic: &Topic, slot: &Arc<Mutex<TopicSlot>>) -> bool {
        let mut state = slot.lock().await;
        if state.retired {
            return false;
        }
        let mut detached = false;
        if let Some(handle) = state.handle.take() {
            match self.bus.detach(&handle).await {
                Ok(()) => detached = true,
                Err(e) => warn!(topic = %topic, error = %e, "Failed to detach on drain"),
            }
        }
        if !state.sessions.is_empty() {
            self.subscriptions
                .fetch_sub(state.sessions.len(), Ordering::AcqRel);
            state.sessions.clear();
            self.deactivate(topic);
        }
        self.retire(topic, slot, &mut state);
        detached
    }

    fn slot(&self, topic: &Topic) -> Arc<Mutex<TopicSlot>> {
        Arc::clone(self.topics.entry(topic.clone()).or_default().value())
    }

    fn existing_slot(&self, topic: &Topic) -> Option<Arc<Mutex<TopicSlot>>> {
        self.topics.get(topic).map(|slot| Arc::clone(slot.value()))
    }

    fn slots(&self) -> Vec<(Topic, Arc<Mutex<TopicSlot>>)> {
        self.topics
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Count a new topic against `max_topics`; false when the limit is reached.
    fn reserve_topic(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.max_topics).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_topic(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    fn deactivate(&self, topic: &Topic) {
        self.active.remove(topic);
        self.release_topic();
    }

    /// Remove a slot from the map. Caller holds the slot's lock.
    fn retire(&self, topic: &Topic, slot: &Arc<Mutex<TopicSlot>>, state: &mut TopicSlot) {
        state.retired = true;
        self.topics
            .remove_if(topic, |_, current| Arc::ptr_eq(current, slot));
    }
}
