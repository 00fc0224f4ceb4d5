//! Message bus abstraction.
//!
//! The bus is the cross-instance pub/sub channel. Each topic is carried on the
//! channel `broadcast:<topic>`; an instance attaches at most one listener per
//! channel and fans messages out to its own sessions.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Could not reach the bus.
    #[error("Bus connection failed: {0}")]
    Connection(String),

    /// Subscribing to a channel failed.
    #[error("Subscribe to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },

    /// Unsubscribing from a channel failed.
    #[error("Unsubscribe from {channel} failed: {reason}")]
    Unsubscribe { channel: String, reason: String },

    /// Publishing to a channel failed.
    #[error("Publish to {channel} failed: {reason}")]
    Publish { channel: String, reason: String },

    /// The handle does not belong to this bus or was already detached.
    #[error("Unknown listener handle: {0}")]
    UnknownHandle(String),
}

/// Receives messages published on an attached channel.
#[async_trait]
pub trait BusListener: Send + Sync {
    /// Handle one message. Must not fail; problems are logged and dropped.
    async fn on_message(&self, channel: &str, payload: Bytes);
}

/// Proof of an attached listener, consumed by [`MessageBus::detach`].
#[derive(Debug, PartialEq, Eq)]
pub struct ListenerHandle {
    id: u64,
    channel: String,
}

impl ListenerHandle {
    /// Create a handle. Used by bus implementations.
    #[must_use]
    pub fn new(id: u64, channel: impl Into<String>) -> Self {
        Self {
            id,
            channel: channel.into(),
        }
    }

    /// Bus-assigned listener id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Channel the listener is attached to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// A pub/sub bus shared by every instance.
///
/// Implementations must not wait for in-flight listener calls in `detach`: a
/// listener may itself trigger a detach while it runs.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish `payload` on `channel`, returning the number of listeners
    /// reported by the bus. Publishing to a channel nobody listens on is legal.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError>;

    /// Attach `listener` to `channel`.
    async fn attach(
        &self,
        channel: &str,
        listener: Arc<dyn BusListener>,
    ) -> Result<ListenerHandle, BusError>;

    /// Detach a listener. On error the listener may still be attached.
    async fn detach(&self, handle: &ListenerHandle) -> Result<(), BusError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

type ListenerEntry = (u64, Arc<dyn BusListener>);

/// In-process bus.
///
/// Delivery is synchronous: `publish` returns after every listener ran. Share
/// one `MemoryBus` between several backplanes to simulate several instances.
#[derive(Default)]
pub struct MemoryBus {
    channels: DashMap<String, Vec<ListenerEntry>>,
    next_id: AtomicU64,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
    fail_attach: AtomicBool,
    fail_detach: AtomicBool,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful attach calls so far.
    #[must_use]
    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    /// Successful detach calls so far.
    #[must_use]
    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    /// Listeners currently attached to `channel`.
    #[must_use]
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |l| l.len())
    }

    /// Make subsequent attach calls fail.
    pub fn fail_attaches(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent detach calls fail.
    pub fn fail_detaches(&self, fail: bool) {
        self.fail_detach.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        // Snapshot so listeners may attach/detach while being called.
        let listeners: Vec<Arc<dyn BusListener>> = match self.channels.get(channel) {
            Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => Vec::new(),
        };

        trace!(channel, listeners = listeners.len(), "Publishing");
        for listener in &listeners {
            listener.on_message(channel, payload.clone()).await;
        }

        Ok(listeners.len())
    }

    async fn attach(
        &self,
        channel: &str,
        listener: Arc<dyn BusListener>,
    ) -> Result<ListenerHandle, BusError> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(BusError::Subscribe {
                channel: channel.to_string(),
                reason: "injected failure".into(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push((id, listener));
        self.attaches.fetch_add(1, Ordering::SeqCst);

        debug!(channel, id, "Listener attached");
        Ok(ListenerHandle::new(id, channel))
    }

    async fn detach(&self, handle: &ListenerHandle) -> Result<(), BusError> {
        if self.fail_detach.load(Ordering::SeqCst) {
            return Err(BusError::Unsubscribe {
                channel: handle.channel.clone(),
                reason: "injected failure".into(),
            });
        }

        let removed = match self.channels.get_mut(&handle.channel) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|(id, _)| *id != handle.id);
                before != entries.len()
            }
            None => false,
        };
        self.channels
            .remove_if(&handle.channel, |_, entries| entries.is_empty());

        if !removed {
            return Err(BusError::UnknownHandle(format!(
                "{}#{}",
                handle.channel, handle.id
            )));
        }

        self.detaches.fetch_add(1, Ordering::SeqCst);
        debug!(channel = %handle.channel, id = handle.id, "Listener detached");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
