//! Client settings.
//!
//! Plain values live in [`ClientSettings`], which can be deserialized from
//! JSON (every field optional). Capabilities that cannot be expressed as data
//! (exception parsers, channel connector, buffer pool) are supplied through
//! [`ClientBuilder`](crate::ClientBuilder).
//!
//! # Example
//!
//! ```
//! use oncrpc_client::ClientSettings;
//!
//! let settings = ClientSettings::from_json_str(
//!     r#"{ "request_timeout_ms": 5000, "connection_timeout_ms": 60000 }"#,
//! ).unwrap();
//! assert_eq!(settings.max_reconnect_attempts, 4);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::protocol::DEFAULT_MAX_FRAGMENT_SIZE;
use crate::transport::{SocketOptions, DEFAULT_RECV_BUFFER_SIZE};

/// Loop tick and sweep interval in milliseconds.
pub const DEFAULT_TICK_MS: u64 = 250;

/// Default request timeout (15 s).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Default idle connection timeout (5 min).
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Default consecutive connect failures before sends fail fast.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 4;

/// Default wait before a blocked destination may be retried (10 s).
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 10_000;

/// Tunable values of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// A request not answered within this time fails with `Timeout`.
    pub request_timeout_ms: u64,
    /// A connection without activity for this long is closed.
    pub connection_timeout_ms: u64,
    /// Loop tick and timeout sweep granularity.
    pub tick_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    /// Largest fragment accepted from a server.
    pub max_fragment_size: u32,
    pub recv_buffer_size: u32,
    pub tcp_nodelay: bool,
    /// Byte counters, request timestamps and latency averaging.
    pub enable_statistics: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            tick_ms: DEFAULT_TICK_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            tcp_nodelay: true,
            enable_statistics: false,
        }
    }
}

impl ClientSettings {
    /// Parse settings from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check the timeout relationship and value ranges.
    ///
    /// # Errors
    ///
    /// `RpcError::Config` when
    /// `request_timeout_ms >= connection_timeout_ms - 2 * tick_ms`.
    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            return Err(RpcError::Config("tick_ms must be positive".into()));
        }
        let margin = self.tick_ms.saturating_mul(2);
        if self.request_timeout_ms.saturating_add(margin) >= self.connection_timeout_ms {
            return Err(RpcError::Config(format!(
                "request timeout must be smaller than connection timeout less {}ms \
                 (request_timeout_ms={}, connection_timeout_ms={})",
                margin, self.request_timeout_ms, self.connection_timeout_ms
            )));
        }
        if self.max_fragment_size == 0 {
            return Err(RpcError::Config("max_fragment_size must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            nodelay: self.tcp_nodelay,
            recv_buffer_size: self.recv_buffer_size,
        }
    }
}
