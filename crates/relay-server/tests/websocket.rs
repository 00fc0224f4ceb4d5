//! End-to-end tests through the axum router on a real socket.

use futures_util::{SinkExt, StreamExt};
use relay_core::{MemoryBus, Topic};
use relay_protocol::{ClientFrame, SummaryResult};
use relay_server::{build_router, AppState, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(bus: Arc<MemoryBus>) -> (SocketAddr, Arc<AppState>) {
    let state = Arc::new(AppState::new(Config::default(), bus));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr) -> (Client, String) {
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    match next_frame(&mut ws).await {
        ClientFrame::Connected { session_id, .. } => (ws, session_id),
        other => panic!("expected connected frame, got {other:?}"),
    }
}

async fn next_frame(ws: &mut Client) -> ClientFrame {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .unwrap();
    match msg {
        Message::Text(text) => ClientFrame::from_text(&text).unwrap(),
        other => panic!("unexpected message {other:?}"),
    }
}

async fn send(ws: &mut Client, frame: ClientFrame) {
    ws.send(Message::Text(frame.to_text().unwrap())).await.unwrap();
}

async fn wait_for_no_topics(state: &AppState) {
    for _ in 0..100 {
        if state.backplane.registry().topics_snapshot().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("topics were not cleaned up");
}

#[tokio::test]
async fn test_subscribe_receive_and_disconnect() {
    let bus = Arc::new(MemoryBus::new());
    let (addr, state) = start_server(bus.clone()).await;
    let (mut ws, _session) = connect(addr).await;

    send(&mut ws, ClientFrame::subscribe(1, "/topic/stream/42/summary")).await;
    assert_eq!(next_frame(&mut ws).await, ClientFrame::ack(1));
    assert_eq!(bus.listener_count("broadcast:42"), 1);

    let summary = SummaryResult {
        stream_id: "42".into(),
        summary: "everyone says hi".into(),
    };
    state
        .backplane
        .publish(&Topic::new("42").unwrap(), "summary", &summary)
        .await
        .unwrap();

    assert_eq!(
        next_frame(&mut ws).await,
        ClientFrame::message(
            "/topic/stream/42/summary",
            serde_json::json!({"streamId": "42", "summary": "everyone says hi"})
        )
    );

    ws.close(None).await.unwrap();
    wait_for_no_topics(&state).await;
    assert_eq!(bus.listener_count("broadcast:42"), 0);
}

#[tokio::test]
async fn test_invalid_frames_and_destinations_are_reported() {
    let bus = Arc::new(MemoryBus::new());
    let (addr, _state) = start_server(bus.clone()).await;
    let (mut ws, _) = connect(addr).await;

    ws.send(Message::Text("{\"type\":\"teleport\"}".into()))
        .await
        .unwrap();
    assert!(matches!(
        next_frame(&mut ws).await,
        ClientFrame::Error { code: 1001, .. }
    ));

    send(&mut ws, ClientFrame::subscribe(2, "/queue/private")).await;
    assert!(matches!(
        next_frame(&mut ws).await,
        ClientFrame::Error { id: 2, code: 1003, .. }
    ));
    assert_eq!(bus.attach_count(), 0);

    send(&mut ws, ClientFrame::Ping { timestamp: Some(7) }).await;
    assert_eq!(next_frame(&mut ws).await, ClientFrame::pong(Some(7)));
}

#[tokio::test]
async fn test_unsubscribe_detaches_last_listener() {
    let bus = Arc::new(MemoryBus::new());
    let (addr, _state) = start_server(bus.clone()).await;
    let (mut ws, _) = connect(addr).await;

    send(&mut ws, ClientFrame::subscribe(1, "/topic/stream/9/message")).await;
    assert_eq!(next_frame(&mut ws).await, ClientFrame::ack(1));
    send(&mut ws, ClientFrame::unsubscribe(2, "/topic/stream/9/message")).await;
    assert_eq!(next_frame(&mut ws).await, ClientFrame::ack(2));

    assert_eq!(bus.detach_count(), 1);
}

#[tokio::test]
async fn test_http_publish_reaches_websocket_client() {
    let bus = Arc::new(MemoryBus::new());
    let (addr, _state) = start_server(bus).await;
    let (mut ws, _) = connect(addr).await;

    send(&mut ws, ClientFrame::subscribe(1, "/topic/stream/42/user-count")).await;
    assert_eq!(next_frame(&mut ws).await, ClientFrame::ack(1));

    let status = http_post(addr, "/publish/42/stream-update", r#"{"streamId":"42","userCount":17}"#).await;
    assert!(status.contains("202"), "unexpected status line: {status}");

    assert_eq!(
        next_frame(&mut ws).await,
        ClientFrame::message(
            "/topic/stream/42/user-count",
            serde_json::json!({"streamId": "42", "userCount": 17})
        )
    );

    let status = http_post(addr, "/publish/42/bogus", "{}").await;
    assert!(status.contains("400"), "unexpected status line: {status}");
}

/// Minimal HTTP/1.1 POST returning the status line.
async fn http_post(addr: SocketAddr, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response.lines().next().unwrap_or_default().to_string()
}
