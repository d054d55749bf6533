//! Reconnecting websocket client for the sensor telemetry stream.
//!
//! The crate is organized by concern:
//! - `stream`: connection lifecycle, heartbeat, message dispatch and the
//!   async client handle.
//! - `retry`: reconnect policy shared by the stream controller.

/// Reconnect policy and backoff helpers.
pub mod retry;
/// Telemetry stream client, protocol types and session state machine.
pub mod stream;

pub use retry::ReconnectPolicy;
pub use stream::{Category, ConnectionState, StreamClient, StreamConfig};
