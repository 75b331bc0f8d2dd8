//! Error types for oncrpc-client.
//!
//! Every failure of an individual call is reported through [`RpcError`],
//! delivered to the caller's [`ResponseFuture`](crate::ResponseFuture) or
//! [`ResponseListener`](crate::ResponseListener). Nothing is thrown out of
//! `send_request` itself.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::exception::RemoteException;
use crate::protocol::AcceptStatus;

/// Main error type for all RPC client operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Invalid client configuration (fatal, raised at construction).
    #[error("configuration error: {0}")]
    Config(String),

    /// The client was started twice or used outside its lifecycle.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Socket-level connect error or refused handshake.
    #[error("server '{endpoint}' not reachable: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// The reconnect allowance is exhausted, no I/O was attempted.
    #[error("server '{endpoint}' not reachable")]
    Unreachable { endpoint: String },

    /// Peer closed the connection or a read/write observed end-of-stream.
    #[error("connection to '{endpoint}' closed: {reason}")]
    ConnectionClosed { endpoint: String, reason: CloseReason },

    /// The server answered with a protocol-range accept status.
    #[error("protocol error: {0}")]
    Protocol(AcceptStatus),

    /// The response could not be framed or its header could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The request cannot be encoded within wire limits.
    #[error("request too large: {0}")]
    RequestTooLarge(String),

    /// Application-range accept status that no registered parser recognizes.
    #[error("received invalid remote exception with id {0}")]
    UnrecognizedException(i32),

    /// Structured exception raised by the remote procedure.
    #[error("remote exception {status}: {exception}")]
    RemoteException {
        status: i32,
        exception: RemoteException,
    },

    /// The request was not answered within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The client was shut down before the request completed.
    #[error("client was shut down")]
    ShutDown,

    /// I/O error outside of a specific connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// JSON settings could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Build a connect failure for `endpoint`.
    pub fn connect_failed(endpoint: impl Into<String>, source: Arc<io::Error>) -> Self {
        RpcError::ConnectFailed {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Build a connection-closed failure for `endpoint`.
    pub fn connection_closed(endpoint: impl Into<String>, reason: CloseReason) -> Self {
        RpcError::ConnectionClosed {
            endpoint: endpoint.into(),
            reason,
        }
    }

    /// True for the terminal "client was shut down" error.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RpcError::ShutDown)
    }

    /// True for the remote exception outcome.
    pub fn is_remote_exception(&self) -> bool {
        matches!(self, RpcError::RemoteException { .. })
    }
}

/// Why a connection was torn down.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// The server closed its end of the stream.
    PeerClosed,
    /// A read or write failed.
    Io(Arc<io::Error>),
    /// The response stream can no longer be framed.
    InvalidFraming(String),
    /// Idle eviction by the timeout sweeper.
    Idle,
    /// Client shutdown.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("server closed connection"),
            CloseReason::Io(e) => write!(f, "server closed connection ({})", e),
            CloseReason::InvalidFraming(msg) => write!(f, "invalid response framing ({})", msg),
            CloseReason::Idle => f.write_str("idle connection evicted"),
            CloseReason::Shutdown => f.write_str("client was shut down"),
        }
    }
}

impl CloseReason {
    /// The per-request error this close reason turns into.
    pub(crate) fn to_error(&self, endpoint: &str) -> RpcError {
        match self {
            CloseReason::Shutdown => RpcError::ShutDown,
            other => RpcError::connection_closed(endpoint, other.clone()),
        }
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecognized_exception_message() {
        let err = RpcError::UnrecognizedException(150);
        assert_eq!(
            err.to_string(),
            "received invalid remote exception with id 150"
        );
    }

    #[test]
    fn test_connect_failed_names_endpoint() {
        let io = Arc::new(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        let err = RpcError::connect_failed("127.0.0.1:1", io);
        assert!(err.to_string().contains("'127.0.0.1:1' not reachable"));
    }

    #[test]
    fn test_shutdown_reason_maps_to_shutdown_error() {
        assert!(CloseReason::Shutdown.to_error("x").is_shutdown());
        assert!(matches!(
            CloseReason::PeerClosed.to_error("x"),
            RpcError::ConnectionClosed { .. }
        ));
    }
}
