//! Redis bus.
//!
//! `PUBLISH` goes through one shared [`ConnectionManager`]. Every attached
//! channel is multiplexed over a single pub/sub connection: the first listener
//! on a channel issues `SUBSCRIBE`, the last one to leave issues
//! `UNSUBSCRIBE`, and one spawned pump task reads the connection and hands
//! each message to the listeners of its channel. A lost pub/sub connection is
//! re-established with backoff and every tracked channel is subscribed again.
//!
//! Attach and detach on the same channel must not race each other; the
//! subscription registry serializes them per topic.

use ::redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use ::redis::AsyncCommands;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use relay_core::{BusError, BusListener, ListenerHandle, MessageBus};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, trace, warn};

const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(5);

type ListenerEntry = (u64, Arc<dyn BusListener>);

/// Channel table and subscription handle shared with the pump task.
#[derive(Default)]
struct Subscriptions {
    channels: DashMap<String, Vec<ListenerEntry>>,
    /// Command half of the pub/sub connection; `None` while reconnecting.
    sink: Mutex<Option<PubSubSink>>,
}

impl Subscriptions {
    async fn current_sink(&self) -> Option<PubSubSink> {
        self.sink.lock().await.clone()
    }

    async fn add(
        &self,
        id: u64,
        channel: &str,
        listener: Arc<dyn BusListener>,
    ) -> Result<(), BusError> {
        let first = {
            let mut listeners = self.channels.entry(channel.to_string()).or_default();
            listeners.push((id, listener));
            listeners.len() == 1
        };
        if !first {
            return Ok(());
        }

        let result = match self.current_sink().await {
            Some(mut sink) => sink.subscribe(channel).await.map_err(|e| e.to_string()),
            None => Err("pub/sub connection is down".to_string()),
        };
        if let Err(reason) = result {
            self.forget(id, channel);
            return Err(BusError::Subscribe {
                channel: channel.to_string(),
                reason,
            });
        }
        Ok(())
    }

    async fn remove(&self, handle: &ListenerHandle) -> Result<(), BusError> {
        let channel = handle.channel();
        let Some(last) = self.forget(handle.id(), channel) else {
            return Err(BusError::UnknownHandle(format!("{channel}#{}", handle.id())));
        };
        if !last {
            return Ok(());
        }

        // A stale subscription only costs traffic; it is dropped on reconnect.
        if let Some(mut sink) = self.current_sink().await {
            if let Err(e) = sink.unsubscribe(channel).await {
                warn!(channel, error = %e, "Failed to unsubscribe channel");
            }
        }
        Ok(())
    }

    /// Drop listener `id` from `channel`. Returns whether it was the last one,
    /// or `None` if it was not attached.
    fn forget(&self, id: u64, channel: &str) -> Option<bool> {
        let removed = match self.channels.get_mut(channel) {
            Some(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|(entry, _)| *entry != id);
                listeners.len() != before
            }
            None => false,
        };
        if !removed {
            return None;
        }
        Some(
            self.channels
                .remove_if(channel, |_, listeners| listeners.is_empty())
                .is_some(),
        )
    }

    async fn dispatch(&self, channel: &str, payload: Bytes) {
        let listeners: Vec<Arc<dyn BusListener>> = match self.channels.get(channel) {
            Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => Vec::new(),
        };
        if listeners.is_empty() {
            trace!(channel, "Message on channel without listeners");
            return;
        }

        trace!(
            channel,
            bytes = payload.len(),
            listeners = listeners.len(),
            "Bus message"
        );
        for listener in listeners {
            listener.on_message(channel, payload.clone()).await;
        }
    }

    /// Open a fresh pub/sub connection and subscribe every tracked channel.
    async fn reconnect(&self, client: &::redis::Client) -> Result<PubSubStream, BusError> {
        let (mut sink, stream) = client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?
            .split();
        *self.sink.lock().await = Some(sink.clone());

        let channels: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for channel in &channels {
            if let Err(e) = sink.subscribe(channel).await {
                *self.sink.lock().await = None;
                return Err(BusError::Subscribe {
                    channel: channel.clone(),
                    reason: e.to_string(),
                });
            }
        }
        info!(channels = channels.len(), "Pub/sub connection established");
        Ok(stream)
    }
}

/// Read the pub/sub connection until stopped, reconnecting on loss.
async fn pump(
    client: ::redis::Client,
    subscriptions: Arc<Subscriptions>,
    stream: PubSubStream,
    mut stop: oneshot::Receiver<()>,
) {
    let mut messages: Pin<Box<PubSubStream>> = Box::pin(stream);
    loop {
        loop {
            tokio::select! {
                _ = &mut stop => {
                    debug!("Pub/sub pump stopped");
                    return;
                }
                msg = messages.next() => match msg {
                    Some(msg) => {
                        let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                        subscriptions.dispatch(msg.get_channel_name(), payload).await;
                    }
                    None => break,
                }
            }
        }

        *subscriptions.sink.lock().await = None;
        warn!("Pub/sub connection lost, reconnecting");
        let mut delay = RECONNECT_MIN;
        messages = loop {
            tokio::select! {
                _ = &mut stop => return,
                () = tokio::time::sleep(delay) => {}
            }
            match subscriptions.reconnect(&client).await {
                Ok(stream) => break Box::pin(stream),
                Err(e) => {
                    warn!(error = %e, "Reconnect failed");
                    delay = (delay * 2).min(RECONNECT_MAX);
                }
            }
        };
    }
}

/// Redis-backed [`MessageBus`].
pub struct RedisBus {
    publisher: ConnectionManager,
    subscriptions: Arc<Subscriptions>,
    next_id: AtomicU64,
    /// Dropping the bus stops the pump.
    _stop: oneshot::Sender<()>,
}

impl RedisBus {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client =
            ::redis::Client::open(url).map_err(|e| BusError::Connection(e.to_string()))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let subscriptions = Arc::new(Subscriptions::default());
        let stream = subscriptions.reconnect(&client).await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(pump(client, Arc::clone(&subscriptions), stream, stop_rx));

        info!(url, "Connected to Redis bus");
        Ok(Self {
            publisher,
            subscriptions,
            next_id: AtomicU64::new(0),
            _stop: stop_tx,
        })
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.subscriptions
            .channels
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    /// Number of channels subscribed on the shared pub/sub connection.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.subscriptions.channels.len()
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, usize>(channel, payload.as_ref())
            .await
            .map_err(|e| BusError::Publish {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    async fn attach(
        &self,
        channel: &str,
        listener: Arc<dyn BusListener>,
    ) -> Result<ListenerHandle, BusError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.add(id, channel, listener).await?;
        debug!(channel, id, "Listener attached");
        Ok(ListenerHandle::new(id, channel))
    }

    // May run inside a listener callback on the pump task.
    async fn detach(&self, handle: &ListenerHandle) -> Result<(), BusError> {
        self.subscriptions.remove(handle).await?;
        debug!(channel = handle.channel(), id = handle.id(), "Listener detached");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<(String, Bytes)>>,
    }

    #[async_trait]
    impl BusListener for Recorder {
        async fn on_message(&self, channel: &str, payload: Bytes) {
            self.seen.lock().unwrap().push((channel.to_string(), payload));
        }
    }

    /// Detaches itself from inside its own callback.
    struct SelfDetaching {
        subscriptions: Arc<Subscriptions>,
        handle: ListenerHandle,
    }

    #[async_trait]
    impl BusListener for SelfDetaching {
        async fn on_message(&self, _channel: &str, _payload: Bytes) {
            self.subscriptions.remove(&self.handle).await.unwrap();
        }
    }

    fn track(
        subscriptions: &Subscriptions,
        id: u64,
        channel: &str,
        listener: Arc<dyn BusListener>,
    ) {
        subscriptions
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((id, listener));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        assert!(matches!(
            RedisBus::connect("not a url").await,
            Err(BusError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_without_connection_leaves_no_listener() {
        let subscriptions = Subscriptions::default();
        let result = subscriptions
            .add(1, "broadcast:42", Arc::new(Recorder::default()))
            .await;

        assert!(matches!(result, Err(BusError::Subscribe { .. })));
        assert!(subscriptions.channels.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_channel_name() {
        let subscriptions = Subscriptions::default();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        track(&subscriptions, 1, "broadcast:a", a.clone());
        track(&subscriptions, 2, "broadcast:a", b.clone());
        track(&subscriptions, 3, "broadcast:b", b.clone());

        subscriptions.dispatch("broadcast:a", Bytes::from_static(b"x")).await;
        subscriptions.dispatch("broadcast:b", Bytes::from_static(b"y")).await;
        subscriptions.dispatch("broadcast:none", Bytes::from_static(b"z")).await;

        assert_eq!(
            *a.seen.lock().unwrap(),
            vec![("broadcast:a".to_string(), Bytes::from_static(b"x"))]
        );
        assert_eq!(b.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_last_detach_forgets_channel() {
        let subscriptions = Subscriptions::default();
        track(&subscriptions, 1, "broadcast:a", Arc::new(Recorder::default()));
        track(&subscriptions, 2, "broadcast:a", Arc::new(Recorder::default()));

        subscriptions
            .remove(&ListenerHandle::new(1, "broadcast:a"))
            .await
            .unwrap();
        assert_eq!(subscriptions.channels.get("broadcast:a").map(|l| l.len()), Some(1));

        subscriptions
            .remove(&ListenerHandle::new(2, "broadcast:a"))
            .await
            .unwrap();
        assert!(subscriptions.channels.is_empty());

        assert!(matches!(
            subscriptions.remove(&ListenerHandle::new(2, "broadcast:a")).await,
            Err(BusError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_may_detach_during_dispatch() {
        let subscriptions = Arc::new(Subscriptions::default());
        let listener = Arc::new(SelfDetaching {
            subscriptions: Arc::clone(&subscriptions),
            handle: ListenerHandle::new(7, "broadcast:a"),
        });
        track(&subscriptions, 7, "broadcast:a", listener);

        tokio::time::timeout(
            Duration::from_secs(1),
            subscriptions.dispatch("broadcast:a", Bytes::from_static(b"x")),
        )
        .await
        .unwrap();
        assert!(subscriptions.channels.is_empty());
    }
}
