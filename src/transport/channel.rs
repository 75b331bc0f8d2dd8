//! Channel capability over a non-blocking stream socket.
//!
//! The event loop only talks to sockets through [`Channel`]: connect,
//! readiness, optional handshake, non-blocking read/write and close. The
//! plain TCP implementation lives here; a secured channel (TLS-like wrapper)
//! plugs in through a custom [`ChannelConnector`].
//!
//! # Example
//!
//! ```ignore
//! use oncrpc_client::transport::{ChannelConnector, PlainConnector, SocketOptions};
//!
//! let mut channel = PlainConnector.open(addr, &SocketOptions::default())?;
//! channel.connect(addr)?;
//! channel.finish_connect().await?;
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::io::{Interest, Ready};
use tokio::net::{TcpSocket, TcpStream};

/// Boxed future returned by channel operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default socket receive buffer (256 KB).
pub const DEFAULT_RECV_BUFFER_SIZE: u32 = 256 * 1024;

/// Outcome of a single non-blocking read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// `n` bytes were moved.
    Bytes(usize),
    /// The socket has no capacity right now, retry on the next readiness.
    WouldBlock,
    /// End of stream: the peer closed the connection.
    Eof,
}

/// Progress of a channel handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Read and write are valid.
    Done,
    /// Incomplete, call again once the socket is readable.
    NeedRead,
    /// Incomplete, call again once the socket is writable.
    NeedWrite,
}

impl Handshake {
    /// Readiness to wait for before the next attempt, `None` when done.
    pub fn interest(self) -> Option<Interest> {
        match self {
            Handshake::Done => None,
            Handshake::NeedRead => Some(Interest::READABLE),
            Handshake::NeedWrite => Some(Interest::WRITABLE),
        }
    }
}

/// Socket options applied to every new channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    /// SO_RCVBUF in bytes.
    pub recv_buffer_size: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

/// A stream socket that may require a handshake before read/write is valid.
pub trait Channel: Send + Sync + 'static {
    /// Start connecting to `addr`.
    fn connect(&mut self, addr: SocketAddr) -> io::Result<()>;

    /// True between `connect` and a successful `finish_connect`.
    fn is_connection_pending(&self) -> bool;

    /// Complete the connect started by [`connect`](Channel::connect).
    fn finish_connect(&mut self) -> BoxFuture<'_, io::Result<()>>;

    /// True while a secured channel is tearing down its session.
    fn is_shutdown_in_progress(&self) -> bool;

    /// Wait until the socket is ready for `interest`.
    fn ready(&self, interest: Interest) -> BoxFuture<'_, io::Result<Ready>>;

    /// Advance the handshake given the readiness just observed.
    ///
    /// An incomplete handshake names the readiness it waits for; the caller
    /// waits on exactly that before calling again.
    fn do_handshake(&mut self, ready: Ready) -> io::Result<Handshake>;

    /// Non-blocking read into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Transfer>;

    /// Non-blocking write from `buf`.
    fn write(&mut self, buf: &[u8]) -> io::Result<Transfer>;

    /// Close the socket. Further reads and writes fail.
    fn close(&mut self) -> io::Result<()>;

    /// Local address, if connected.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Opens channels for new connections.
///
/// The default [`PlainConnector`] opens plain TCP channels; a secure
/// transport provides its own connector wrapping the socket.
pub trait ChannelConnector: Send + Sync {
    /// Open a non-blocking channel for `endpoint` with `options` applied.
    ///
    /// Errors here are immediate establishment failures.
    fn open(&self, endpoint: SocketAddr, options: &SocketOptions) -> io::Result<Box<dyn Channel>>;
}

/// Connector for plain TCP channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainConnector;

impl ChannelConnector for PlainConnector {
    fn open(&self, endpoint: SocketAddr, options: &SocketOptions) -> io::Result<Box<dyn Channel>> {
        Ok(Box::new(PlainChannel::open(endpoint, options)?))
    }
}

enum State {
    /// Socket created and configured, no target yet.
    Open(TcpSocket),
    /// Target chosen, connect completes in `finish_connect`.
    Pending(TcpSocket, SocketAddr),
    /// Connect in progress (socket moved into the connect future).
    Connecting,
    Connected(TcpStream),
    Closed,
}

/// Plain, unencrypted TCP channel.
pub struct PlainChannel {
    state: State,
    nodelay: bool,
}

impl PlainChannel {
    /// Create a non-blocking socket matching the address family of `endpoint`.
    pub fn open(endpoint: SocketAddr, options: &SocketOptions) -> io::Result<Self> {
        let socket = if endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_recv_buffer_size(options.recv_buffer_size)?;
        Ok(Self {
            state: State::Open(socket),
            nodelay: options.nodelay,
        })
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        match &self.state {
            State::Connected(stream) => Ok(stream),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel is not connected",
            )),
        }
    }
}

impl Channel for PlainChannel {
    fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(socket) => {
                self.state = State::Pending(socket, addr);
                Ok(())
            }
            other => {
                self.state = other;
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "connect already started",
                ))
            }
        }
    }

    fn is_connection_pending(&self) -> bool {
        matches!(self.state, State::Pending(..) | State::Connecting)
    }

    fn finish_connect(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let (socket, addr) = match std::mem::replace(&mut self.state, State::Connecting) {
                State::Pending(socket, addr) => (socket, addr),
                State::Connected(stream) => {
                    self.state = State::Connected(stream);
                    return Ok(());
                }
                _ => {
                    self.state = State::Closed;
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "no connect in progress",
                    ));
                }
            };

            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(self.nodelay)?;
                    self.state = State::Connected(stream);
                    Ok(())
                }
                Err(e) => {
                    self.state = State::Closed;
                    Err(e)
                }
            }
        })
    }

    fn is_shutdown_in_progress(&self) -> bool {
        false
    }

    fn ready(&self, interest: Interest) -> BoxFuture<'_, io::Result<Ready>> {
        Box::pin(async move { self.stream()?.ready(interest).await })
    }

    fn do_handshake(&mut self, _ready: Ready) -> io::Result<Handshake> {
        Ok(Handshake::Done)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<Transfer> {
        if buf.is_empty() {
            return Ok(Transfer::Bytes(0));
        }
        match self.stream()?.try_read(buf) {
            Ok(0) => Ok(Transfer::Eof),
            Ok(n) => Ok(Transfer::Bytes(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<Transfer> {
        if buf.is_empty() {
            return Ok(Transfer::Bytes(0));
        }
        match self.stream()?.try_write(buf) {
            Ok(0) => Ok(Transfer::Eof),
            Ok(n) => Ok(Transfer::Bytes(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                ) =>
            {
                Ok(Transfer::Eof)
            }
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the socket/stream closes the descriptor.
        self.state = State::Closed;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream().ok().and_then(|s| s.local_addr().ok())
    }
}
