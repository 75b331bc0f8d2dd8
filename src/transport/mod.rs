//! Transport module - channel capability and plain TCP channels.
//!
//! Provides abstraction over:
//! - Plain TCP sockets ([`PlainChannel`])
//! - Secured channels supplied through a custom [`ChannelConnector`]

mod channel;

pub use channel::{
    BoxFuture, Channel, ChannelConnector, Handshake, PlainChannel, PlainConnector, SocketOptions, Transfer,
    DEFAULT_RECV_BUFFER_SIZE,
};

#[cfg(test)]
pub(crate) mod testing;
