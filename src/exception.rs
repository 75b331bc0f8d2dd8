//! Remote exception resolution.
//!
//! Accept statuses above [`SYSTEM_ERR_MAX`](crate::protocol::SYSTEM_ERR_MAX)
//! carry an application exception. Parsers are consulted in registration
//! order and the first one that claims the status decodes the exception body.

use std::fmt;
use std::sync::Arc;

use tracing::error;

use crate::error::{Result, RpcError};

/// A structured exception decoded from a reply body.
pub type RemoteException = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Decodes application exceptions for a range of accept statuses.
pub trait ExceptionParser: Send + Sync {
    /// Whether this parser owns `status`.
    fn can_parse_exception(&self, status: i32) -> bool;

    /// Decode the exception carried in `body`.
    fn parse_exception(&self, status: i32, body: &[u8]) -> Result<RemoteException>;
}

/// Ordered list of parsers, first match wins.
#[derive(Clone, Default)]
pub struct ExceptionResolver {
    parsers: Vec<Arc<dyn ExceptionParser>>,
}

impl ExceptionResolver {
    /// Create a resolver over `parsers` in the given order.
    pub fn new(parsers: Vec<Arc<dyn ExceptionParser>>) -> Self {
        Self { parsers }
    }

    /// Append a parser after the existing ones.
    pub fn push(&mut self, parser: Arc<dyn ExceptionParser>) {
        self.parsers.push(parser);
    }

    /// Number of registered parsers.
    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    /// Returns true if no parser is registered.
    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    /// Turn an application status and its body into the request outcome.
    ///
    /// Always returns an error value: `RemoteException` when a parser claims
    /// the status, `UnrecognizedException` when none does, or
    /// `InvalidResponse` when the claiming parser cannot decode the body.
    pub fn resolve(&self, status: i32, body: &[u8]) -> RpcError {
        let Some(parser) = self.parsers.iter().find(|p| p.can_parse_exception(status)) else {
            error!(status, "received invalid remote exception");
            return RpcError::UnrecognizedException(status);
        };

        match parser.parse_exception(status, body) {
            Ok(exception) => RpcError::RemoteException { status, exception },
            Err(e) => {
                error!(status, error = %e, "failed to decode remote exception");
                RpcError::InvalidResponse(format!("invalid exception data received: {}", e))
            }
        }
    }
}

impl fmt::Debug for ExceptionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionResolver")
            .field("parsers", &self.parsers.len())
            .finish()
    }
}
