//! RelayCast - Pusher-compatible event multicast server
//!
//! Browsers connect over WebSocket (`/app/{key}`), subscribe to named
//! channels within an application namespace, and receive events that HTTP
//! clients publish through a REST endpoint (`POST /apps/{app}/events`).
//!
//! ## Architecture
//!
//! ```text
//! publisher → REST API → event bus → (Redis pub/sub in distributed mode)
//!           → local fan-out → WebSocket sessions owned by each process
//! ```
//!
//! Two deployment modes, selected by configuration:
//!
//! - **standalone** - single process, in-memory membership
//! - **distributed** - peer processes share membership through Redis and
//!   coordinate fan-out over its pub/sub, optionally resolving the master
//!   through a Sentinel quorum

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod pusher;
pub mod server;
pub mod session;
pub mod store;
pub mod supervisor;

pub use config::{AppConfig, Config};
pub use error::AppError;
pub use hub::Hub;
pub use store::{Channel, ChannelStore, MemoryStore, RedisStore};
pub use supervisor::{Event, EventRequest, Supervisor};
