//! Connection options

use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::protocol::events::names;

/// Per-connection options
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Deadline for one connection attempt on one transport, and again for
    /// the namespace handshake that follows
    pub timeout: Duration,
    /// Transports tried in order until one opens
    pub transports: Vec<Transport>,
    pub reconnect: ReconnectPolicy,
    /// Extra fields merged into the handshake auth payload next to `token`
    pub auth: Map<String, Value>,
    /// Application-level ping/pong, off unless set
    pub heartbeat: Option<HeartbeatConfig>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            transports: vec![Transport::WebSocket, Transport::Polling],
            reconnect: ReconnectPolicy::default(),
            auth: Map::new(),
            heartbeat: None,
        }
    }
}

impl ConnectOptions {
    /// Defaults for the chat namespace: heartbeat enabled
    pub fn chat() -> Self {
        Self {
            heartbeat: Some(HeartbeatConfig::default()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_transports(mut self, transports: impl IntoIterator<Item = Transport>) -> Self {
        self.transports = transports.into_iter().collect();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_auth_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.auth.insert(key.into(), value.into());
        self
    }
}

/// Engine.IO transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    WebSocket,
    /// HTTP long-polling
    Polling,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::WebSocket => f.write_str("websocket"),
            Transport::Polling => f.write_str("polling"),
        }
    }
}

impl From<Transport> for rust_socketio::TransportType {
    fn from(transport: Transport) -> Self {
        match transport {
            Transport::WebSocket => rust_socketio::TransportType::Websocket,
            Transport::Polling => rust_socketio::TransportType::Polling,
        }
    }
}

/// Reconnection settings handed to the Socket.IO client, which runs the
/// exponential backoff itself after an established session drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// `None` retries forever
    pub max_attempts: Option<u8>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Backoff bounds in milliseconds, lower bound first
    pub(crate) fn delay_bounds_ms(&self) -> (u64, u64) {
        let base = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        (base, max.max(base))
    }
}

/// Application-level liveness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings
    pub interval: Duration,
    /// Maximum silence before the connection is reported unresponsive
    pub window: Duration,
    pub ping_event: String,
    pub pong_event: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(25),
            window: Duration::from_secs(60),
            ping_event: names::PING.to_string(),
            pong_event: names::PONG.to_string(),
        }
    }
}
