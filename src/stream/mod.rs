//! Realtime telemetry stream modules.
//!
//! - `controller`: connection lifecycle and bounded reconnect scheduling.
//! - `heartbeat`: periodic `ping` messages while a connection is open.
//! - `dispatch`: typed routing of inbound frames to observers.
//! - `session`: IO-free facade composing the three above.
//! - `client`: `tokio` worker that drives a session over a websocket.

/// Async client handle and background worker.
pub mod client;
/// Endpoint, retry and heartbeat settings.
pub mod config;
/// Reconnect state machine.
pub mod controller;
/// Observer registry and inbound frame routing.
pub mod dispatch;
/// Keepalive ping timer.
pub mod heartbeat;
/// Stream protocol messages.
pub mod proto;
/// Session facade over a transport and a scheduler.
pub mod session;
/// Timer scheduling seam.
pub mod timer;
/// Websocket transport seam.
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{SessionSnapshot, StreamClient, StreamClientError, WeakStreamClient};
pub use config::StreamConfig;
pub use controller::ConnectionState;
pub use dispatch::{Category, ObserverError, ObserverId, ObserverResult};
