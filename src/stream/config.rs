use std::time::Duration;

use crate::retry::ReconnectPolicy;
use crate::stream::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;

/// Default telemetry stream endpoint.
pub const DEFAULT_STREAM_ADDRESS: &str = "ws://localhost:8081";
/// Default bound on the websocket handshake.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings injected into a stream session at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Websocket address to connect to.
    pub address: String,
    /// Retry delay and attempt ceiling after a lost connection.
    pub reconnect: ReconnectPolicy,
    /// Period between keepalive `ping` messages while open.
    pub heartbeat_interval: Duration,
    /// Upper bound on one connection handshake.
    pub open_timeout: Duration,
}

impl StreamConfig {
    /// Default settings pointed at `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self::default().with_address(address)
    }

    /// Sets the endpoint. Trailing whitespace is trimmed.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        let address = address.into();
        self.address = address.trim_end().to_string();
        self
    }

    /// Sets the reconnect policy.
    pub fn with_reconnect_policy(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the period between heartbeat pings.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the handshake timeout.
    ///
    /// An expired handshake is reported like any other failed open and
    /// takes the retry path.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_STREAM_ADDRESS.to_string(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}
