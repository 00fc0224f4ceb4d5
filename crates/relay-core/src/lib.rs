//! # relay-core
//!
//! Broadcast backplane for horizontally scaled realtime servers.
//!
//! Several server instances share one pub/sub bus. Each instance attaches a
//! single bus listener per topic its local sessions follow, decodes what
//! arrives and fans it out to those sessions:
//!
//! - **Registry** - topic → sessions, owning the per-topic bus listener
//! - **Dispatcher** - envelope decoding and routing by event type
//! - **Tracker** - session interests, disconnect cleanup, fan-out
//! - **Publisher** - encoding and publishing on topic channels
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  publish  ┌─────────┐  on_message  ┌────────────┐
//! │ Publisher │──────────▶│   Bus   │─────────────▶│ Dispatcher │
//! └───────────┘           └─────────┘              └────────────┘
//!                              ▲                          │ fan_out
//!                   attach /   │                          ▼
//!                   detach ┌──────────┐  subscribe  ┌─────────────┐
//!                          │ Registry │◀────────────│   Tracker   │──▶ sessions
//!                          └──────────┘             └─────────────┘
//! ```

pub mod backplane;
pub mod bus;
pub mod dispatcher;
pub mod publisher;
pub mod registry;
pub mod session;
pub mod topic;
pub mod tracker;

pub use backplane::{Backplane, BackplaneConfig};
pub use bus::{BusError, BusListener, ListenerHandle, MemoryBus, MessageBus};
pub use dispatcher::{DispatchOutcome, Dispatcher, FanOut};
pub use publisher::{PublishError, Publisher};
pub use registry::{
    RegistryConfig, RegistryError, RegistryStats, SubscribeOutcome, SubscriptionRegistry,
    TopicState, UnsubscribeOutcome,
};
pub use session::{SendError, SessionId, SessionSender};
pub use topic::{Destination, DestinationScheme, InvalidTopic, Topic};
pub use tracker::{SessionTracker, TrackerConfig, TrackerError};
