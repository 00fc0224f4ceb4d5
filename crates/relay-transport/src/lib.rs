//! # relay-transport
//!
//! Concrete transports for the relay backplane:
//!
//! - **Redis** - the shared bus, one pub/sub connection per attached topic
//! - **WebSocket** - bounded per-session outbound queues behind
//!   [`relay_core::SessionSender`]
//!
//! The in-process [`relay_core::MemoryBus`] covers single-node deployments and tests.

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "redis")]
pub use crate::redis::RedisBus;

#[cfg(feature = "websocket")]
pub use websocket::WsSessionHub;
