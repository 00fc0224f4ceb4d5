//! Backplane delivery through the WebSocket session hub.

use relay_core::{Backplane, BackplaneConfig, MemoryBus, SessionId, Topic};
use relay_protocol::{ClientFrame, StreamUserCountUpdate};
use relay_transport::WsSessionHub;
use std::sync::Arc;

fn count(n: u64) -> StreamUserCountUpdate {
    StreamUserCountUpdate {
        stream_id: "42".into(),
        user_count: n,
    }
}

#[tokio::test]
async fn test_published_event_reaches_session_queue() {
    let bus = Arc::new(MemoryBus::new());
    let hub = Arc::new(WsSessionHub::new(8));
    let backplane = Backplane::new(bus, hub.clone(), BackplaneConfig::default());

    let session = SessionId::from("viewer");
    let mut rx = hub.register(session.clone());
    backplane
        .tracker()
        .on_destination_subscribed(&session, "/topic/stream/42/user-count")
        .await
        .unwrap();

    let topic = Topic::new("42").unwrap();
    backplane.publish(&topic, "stream-update", &count(5)).await.unwrap();

    let frame = rx.recv().await.unwrap();
    assert_eq!(
        frame,
        ClientFrame::message(
            "/topic/stream/42/user-count",
            serde_json::json!({"streamId": "42", "userCount": 5})
        )
    );
}

#[tokio::test]
async fn test_stalled_session_is_unsubscribed() {
    let bus = Arc::new(MemoryBus::new());
    let hub = Arc::new(WsSessionHub::new(1));
    let backplane = Backplane::new(bus.clone(), hub.clone(), BackplaneConfig::default());
    let topic = Topic::new("42").unwrap();

    let session = SessionId::from("stalled");
    let _rx = hub.register(session.clone());
    backplane.on_session_subscribed(&session, &topic).await.unwrap();

    // Nobody drains the queue: the second event overflows it.
    backplane.publish(&topic, "stream-update", &count(1)).await.unwrap();
    backplane.publish(&topic, "stream-update", &count(2)).await.unwrap();

    assert!(!hub.contains(&session));
    assert!(backplane.registry().topics_snapshot().is_empty());
    assert_eq!(bus.listener_count("broadcast:42"), 0);
}
