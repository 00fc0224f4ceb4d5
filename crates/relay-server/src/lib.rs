//! # relay-server
//!
//! Realtime broadcast server. Clients connect over WebSocket and subscribe to
//! stream destinations; upstream services publish events over HTTP or straight
//! onto the bus; every instance fans the events out to its own clients.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{build_router, connect_bus, run_server, AppState};
