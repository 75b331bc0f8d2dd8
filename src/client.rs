//! Client builder and lifecycle.
//!
//! The [`ClientBuilder`] provides a fluent API for settings and pluggable
//! capabilities. The [`Client`] manages the lifecycle:
//! 1. `start()` spawns the loop thread and waits until it runs
//! 2. `send_request()` may be called from any thread, any number of times
//! 3. `shutdown()` fails everything outstanding and closes every socket
//!
//! # Example
//!
//! ```ignore
//! use oncrpc_client::{Client, RawMessage};
//!
//! let client = Client::builder()
//!     .request_timeout_ms(5_000)
//!     .connection_timeout_ms(60_000)
//!     .start()?;
//!
//! let ping = RawMessage::new(&b"ping"[..]);
//! let response = client
//!     .send_request(server, 1, 1, 7, &ping, None)
//!     .wait()?;
//! assert_eq!(&response.body()[..], b"pong");
//!
//! client.shutdown();
//! client.wait_for_shutdown();
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::codec::Message;
use crate::config::ClientSettings;
use crate::error::{Result, RpcError};
use crate::event_loop::{self, ClientInner, Registration};
use crate::exception::{ExceptionParser, ExceptionResolver};
use crate::pool::{BufferPool, SizeClassPool};
use crate::protocol::CallHeader;
use crate::request::{FutureListener, PendingRequest, RequestInfo, ResponseFuture, ResponseListener};
use crate::stats::TransferStats;
use crate::transport::{ChannelConnector, PlainConnector};

/// Name of the loop thread.
pub const LOOP_THREAD_NAME: &str = "oncrpc-client";

/// Builder for configuring and creating a client.
///
/// `build()` validates the settings; `start()` builds and starts in one go.
pub struct ClientBuilder {
    settings: ClientSettings,
    parsers: Vec<Arc<dyn ExceptionParser>>,
    connector: Option<Arc<dyn ChannelConnector>>,
    pool: Option<Arc<dyn BufferPool>>,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::with_settings(ClientSettings::default())
    }

    /// Create a builder from existing settings.
    pub fn with_settings(settings: ClientSettings) -> Self {
        Self {
            settings,
            parsers: Vec::new(),
            connector: None,
            pool: None,
        }
    }

    /// Replace all plain settings at once.
    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the request timeout.
    ///
    /// Must be smaller than the connection timeout less two ticks.
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.settings.request_timeout_ms = ms;
        self
    }

    /// Set the idle connection timeout.
    pub fn connection_timeout_ms(mut self, ms: u64) -> Self {
        self.settings.connection_timeout_ms = ms;
        self
    }

    /// Set the number of consecutive connect failures tolerated.
    ///
    /// Default: 4
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.settings.max_reconnect_attempts = attempts;
        self
    }

    /// Set the wait before a blocked destination is tried again.
    ///
    /// Default: 10 seconds
    pub fn reconnect_backoff_ms(mut self, ms: u64) -> Self {
        self.settings.reconnect_backoff_ms = ms;
        self
    }

    /// Set the largest fragment accepted from servers.
    ///
    /// Default: 1 GB
    pub fn max_fragment_size(mut self, bytes: u32) -> Self {
        self.settings.max_fragment_size = bytes;
        self
    }

    /// Enable byte counters, request timestamps and latency averaging.
    pub fn enable_statistics(mut self, enabled: bool) -> Self {
        self.settings.enable_statistics = enabled;
        self
    }

    /// Register an exception parser. Parsers are consulted in registration
    /// order and the first one that claims a status wins.
    pub fn exception_parser(mut self, parser: Arc<dyn ExceptionParser>) -> Self {
        self.parsers.push(parser);
        self
    }

    /// Use a custom channel connector (e.g. a secured transport).
    pub fn connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use a custom buffer pool for response fragments.
    pub fn buffer_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Validate the settings and create a stopped client.
    ///
    /// # Errors
    ///
    /// `RpcError::Config` when the timeout relationship is violated.
    pub fn build(self) -> Result<Client> {
        self.settings.validate()?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(PlainConnector));
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(SizeClassPool::new()));
        let (inner, registrations) = ClientInner::new(
            self.settings,
            ExceptionResolver::new(self.parsers),
            connector,
            pool,
        );

        Ok(Client {
            inner: Arc::new(inner),
            registrations: Mutex::new(Some(registrations)),
            thread: Mutex::new(None),
        })
    }

    /// Build and start the client.
    pub fn start(self) -> Result<Client> {
        let client = self.build()?;
        client.start()?;
        Ok(client)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An asynchronous ONC-RPC client multiplexing calls over one socket per
/// destination.
///
/// Dropping the client signals shutdown without waiting for the loop thread.
pub struct Client {
    inner: Arc<ClientInner>,
    registrations: Mutex<Option<mpsc::UnboundedReceiver<Registration>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a stopped client from settings.
    pub fn new(settings: ClientSettings) -> Result<Self> {
        ClientBuilder::with_settings(settings).build()
    }

    /// Start the loop thread and wait until it is running.
    ///
    /// # Errors
    ///
    /// `RpcError::Lifecycle` when called a second time or after shutdown;
    /// `RpcError::Io` when the thread or its runtime cannot be created.
    pub fn start(&self) -> Result<()> {
        if self.inner.is_shutting_down() {
            return Err(RpcError::Lifecycle("client was shut down".into()));
        }
        let registrations = self
            .registrations
            .lock()
            .take()
            .ok_or_else(|| RpcError::Lifecycle("client already started".into()))?;

        let (started_tx, started_rx) = std::sync::mpsc::sync_channel(1);
        let inner = Arc::clone(&self.inner);

        let handle = std::thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = started_tx.send(Err(e));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let _ = started_tx.send(Ok(()));
                    event_loop::run(inner, registrations).await;
                });
            })?;

        match started_rx.recv() {
            Ok(Ok(())) => {
                *self.thread.lock() = Some(handle);
                debug!("client started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(RpcError::Io(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(RpcError::Lifecycle(
                    "loop thread exited during startup".into(),
                ))
            }
        }
    }

    /// Whether the loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Send a call and get a future for its outcome.
    ///
    /// Never blocks and never fails directly: every failure resolves the
    /// returned future.
    pub fn send_request(
        &self,
        target: SocketAddr,
        program: u32,
        version: u32,
        procedure: u32,
        payload: &dyn Message,
        credentials: Option<&dyn Message>,
    ) -> ResponseFuture {
        let (listener, future) = FutureListener::channel();
        self.send_request_with_listener(
            listener,
            target,
            program,
            version,
            procedure,
            payload,
            credentials,
        );
        future
    }

    /// Send a call whose outcome is delivered to `listener`.
    ///
    /// Exactly one listener method is invoked, on the loop thread (or on the
    /// calling thread for failures detected before any I/O).
    #[allow(clippy::too_many_arguments)]
    pub fn send_request_with_listener<L: ResponseListener>(
        &self,
        listener: L,
        target: SocketAddr,
        program: u32,
        version: u32,
        procedure: u32,
        payload: &dyn Message,
        credentials: Option<&dyn Message>,
    ) {
        let info = RequestInfo {
            xid: self.inner.xids.next_xid(),
            target,
            program,
            version,
            procedure,
        };

        let call = CallHeader::new(info.xid, program, version, procedure);
        let mut header = BytesMut::new();
        if let Err(e) = call.encode_into(&mut header, credentials) {
            Box::new(listener).request_failed(info, e);
            return;
        }

        let mut body = BytesMut::with_capacity(payload.size_in_bytes());
        payload.serialize_into(&mut body);

        let request = PendingRequest::new(
            info,
            header.freeze(),
            body.freeze(),
            self.inner.settings.enable_statistics,
            Box::new(listener),
        );
        self.inner.submit(request);
    }

    /// Signal the loop to stop.
    ///
    /// Every queued and in-flight request fails with `RpcError::ShutDown`
    /// and every channel is closed. Use
    /// [`wait_for_shutdown`](Self::wait_for_shutdown) to wait for completion.
    pub fn shutdown(&self) {
        let started = self.registrations.lock().is_none();
        if started {
            self.inner.begin_shutdown();
        } else {
            self.inner.shutdown_without_loop();
        }
    }

    /// Block until the loop thread has exited.
    ///
    /// Must not be called from the loop thread (i.e. from a listener).
    pub fn wait_for_shutdown(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("loop thread panicked");
            }
        }
    }

    /// Byte counters for `target`, `None` if there is no connection to it.
    pub fn get_transfer_stats(&self, target: &SocketAddr) -> Option<TransferStats> {
        self.inner.transfer_stats(target)
    }

    /// Number of destinations with a live connection entry.
    pub fn connection_count(&self) -> usize {
        self.inner.connection_count()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("settings", &self.inner.settings)
            .field("connections", &self.inner.connection_count())
            .finish_non_exhaustive()
    }
}
