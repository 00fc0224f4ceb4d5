//! HTTP and WebSocket handlers for the relay server.
//!
//! Each WebSocket client is one session. Its frames drive the session tracker
//! (subscribe/unsubscribe to destinations); events fanned out by the
//! backplane arrive on the session's hub queue and are forwarded to the socket.

use crate::config::{BusBackend, BusConfig, Config};
use crate::metrics::{self, SessionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use relay_core::{Backplane, MemoryBus, MessageBus, PublishError, SessionId, Topic};
use relay_protocol::frames::codes;
use relay_protocol::{BroadcastEvent, ClientFrame, EventKind};
use relay_transport::{RedisBus, WsSessionHub};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The broadcast backplane.
    pub backplane: Backplane,
    /// Outbound queues of connected sessions.
    pub hub: Arc<WsSessionHub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state on top of `bus`.
    #[must_use]
    pub fn new(config: Config, bus: Arc<dyn MessageBus>) -> Self {
        let hub = Arc::new(WsSessionHub::new(config.transport.session_queue_capacity));
        let backplane = Backplane::new(bus, hub.clone(), config.backplane.to_backplane_config());

        Self {
            backplane,
            hub,
            config,
        }
    }
}

/// Connect to the configured bus.
///
/// # Errors
///
/// Returns an error if the Redis bus is selected and unreachable.
pub async fn connect_bus(config: &BusConfig) -> Result<Arc<dyn MessageBus>> {
    match config.backend {
        BusBackend::Memory => {
            warn!("Using in-process bus; events will not reach other instances");
            Ok(Arc::new(MemoryBus::new()))
        }
        BusBackend::Redis => {
            let bus = RedisBus::connect(&config.redis_url)
                .await
                .with_context(|| format!("Failed to connect to {}", config.redis_url))?;
            Ok(Arc::new(bus))
        }
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/publish/:topic/:kind", post(publish_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the bus is unreachable or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let bus = connect_bus(&config.bus).await?;
    let state = Arc::new(AppState::new(config.clone(), bus));
    let app = build_router(Arc::clone(&state));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.backplane.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.backplane.registry().stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "bus": state.backplane.registry().bus().name(),
        "sessions": state.hub.len(),
        "topics": stats.topic_count,
    }))
}

/// Publish an event: `POST /publish/:topic/:kind` with the payload as JSON body.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Path((topic, kind)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let topic = match Topic::new(&topic) {
        Ok(topic) => topic,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let Some(kind) = EventKind::from_tag(&kind) else {
        return error_response(StatusCode::BAD_REQUEST, format!("Unknown event type: {kind}"));
    };
    let event = match BroadcastEvent::from_json(kind, body) {
        Ok(event) => event,
        Err(e) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
    };

    match state.backplane.publish(&topic, kind.tag(), &event).await {
        Ok(receivers) => {
            metrics::record_published(kind.tag());
            debug!(topic = %topic, kind = %kind, receivers, "Published via HTTP");
            (StatusCode::ACCEPTED, Json(json!({ "receivers": receivers }))).into_response()
        }
        Err(e @ PublishError::TooLarge { .. }) => {
            metrics::record_error("publish");
            error_response(StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
        }
        Err(PublishError::Bus(e)) => {
            metrics::record_error("publish");
            warn!(topic = %topic, error = %e, "Publish failed");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Err(e) => {
            metrics::record_error("publish");
            error_response(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

type WsSink = SplitSink<WebSocket, Message>;

/// Handle a WebSocket session.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = SessionMetricsGuard::new();

    let session = SessionId::generate();
    let mut outbound = state.hub.register(session.clone());

    debug!(session = %session, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = ClientFrame::connected(session.as_str(), heartbeat);
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(session = %session, "Failed to send Connected frame");
        state.hub.unregister(&session);
        return;
    }

    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut deadline = tokio::time::Instant::now() + timeout;

    loop {
        tokio::select! {
            biased;

            // Events fanned out to this session
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if send_frame(&mut sender, &frame).await.is_err() {
                        break;
                    }
                }
                None => {
                    warn!(session = %session, "Session dropped from hub (stalled)");
                    metrics::record_error("stalled");
                    break;
                }
            },

            // Receive from WebSocket
            msg = receiver.next() => {
                deadline = tokio::time::Instant::now() + timeout;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_message(text.len(), "inbound");

                        let result = match ClientFrame::from_text(&text) {
                            Ok(frame) => handle_frame(&frame, &session, &state, &mut sender).await,
                            Err(e) => {
                                debug!(session = %session, error = %e, "Invalid frame");
                                let reply = ClientFrame::error(0, codes::INVALID_FRAME, e.to_string());
                                send_frame(&mut sender, &reply).await
                            }
                        };
                        if let Err(e) = result {
                            error!(session = %session, error = %e, "Frame handling error");
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = ClientFrame::error(0, codes::INVALID_FRAME, "Binary frames are not supported");
                        if send_frame(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %session, "WebSocket stream ended");
                        break;
                    }
                }
            }

            () = tokio::time::sleep_until(deadline) => {
                debug!(session = %session, "Heartbeat timeout");
                break;
            }
        }
    }

    // Cleanup: stop fan-out to this session, then leave every topic
    state.hub.unregister(&session);
    state.backplane.on_session_disconnected(&session).await;
    metrics::set_active_topics(state.backplane.registry().stats().topic_count);

    debug!(session = %session, "WebSocket disconnected");
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: &ClientFrame,
    session: &SessionId,
    state: &Arc<AppState>,
    sender: &mut WsSink,
) -> Result<()> {
    let tracker = state.backplane.tracker();

    match frame {
        ClientFrame::Subscribe { id, destination } => {
            debug!(session = %session, destination = %destination, "Subscribe request");

            let response = match tracker.on_destination_subscribed(session, destination).await {
                Ok(true) => {
                    metrics::record_subscription();
                    metrics::set_active_topics(state.backplane.registry().stats().topic_count);
                    ClientFrame::ack(*id)
                }
                Ok(false) => ClientFrame::error(
                    *id,
                    codes::INVALID_DESTINATION,
                    format!("Not a stream destination: {destination}"),
                ),
                Err(e) => {
                    warn!(session = %session, error = %e, "Subscribe failed");
                    metrics::record_error("subscribe");
                    ClientFrame::error(*id, codes::SUBSCRIBE_FAILED, e.to_string())
                }
            };

            send_frame(sender, &response).await?;
        }

        ClientFrame::Unsubscribe { id, destination } => {
            debug!(session = %session, destination = %destination, "Unsubscribe request");

            let response = match tracker.on_destination_unsubscribed(session, destination).await {
                Ok(true) => {
                    metrics::set_active_topics(state.backplane.registry().stats().topic_count);
                    ClientFrame::ack(*id)
                }
                Ok(false) => ClientFrame::error(
                    *id,
                    codes::INVALID_DESTINATION,
                    format!("Not a stream destination: {destination}"),
                ),
                Err(e) => {
                    metrics::record_error("unsubscribe");
                    ClientFrame::error(*id, codes::UNSUBSCRIBE_FAILED, e.to_string())
                }
            };

            send_frame(sender, &response).await?;
        }

        ClientFrame::Ping { timestamp } => {
            send_frame(sender, &ClientFrame::pong(*timestamp)).await?;
        }

        ClientFrame::Pong { .. } => {}

        ClientFrame::Connect { token } => {
            debug!(
                session = %session,
                has_token = token.is_some(),
                "Connect frame (already connected)"
            );
        }

        other => {
            warn!(session = %session, frame = ?other, "Unexpected frame from client");
        }
    }

    Ok(())
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSink, frame: &ClientFrame) -> Result<()> {
    let text = frame.to_text()?;
    metrics::record_message(text.len(), "outbound");
    sender.send(Message::Text(text)).await?;
    Ok(())
}
