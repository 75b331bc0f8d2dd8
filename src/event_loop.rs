//! The client's event loop: connection registry, drivers and timeout sweep.
//!
//! # Architecture
//!
//! ```text
//! caller threads                     loop thread (current-thread runtime)
//! ──────────────                     ────────────────────────────────────
//! submit() ─► registry ─► Connection ◄── driver task (one per channel)
//!                │             ▲            connect → read → write
//!                └─ new channel ┘
//!                      │
//!                      └─► registrations ─► loop task ─► spawn driver
//!                                              │
//!                                              └─► sweep every tick
//! ```
//!
//! Callers never touch sockets. A new channel is created and its connect is
//! started on the caller's thread, then handed to the loop through an
//! unbounded queue; readiness registration and all socket I/O happen on the
//! loop thread. Listener callbacks run on the loop thread without any lock
//! held.
//!
//! Lock order: registry, then connection. The loop task takes the registry
//! lock only for the sweep and for shutdown; drivers only lock their own
//! connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::Interest;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

use crate::config::ClientSettings;
use crate::connection::{Connection, ConnectionState, LinkState, ReconnectAllowance};
use crate::error::{CloseReason, RpcError};
use crate::exception::ExceptionResolver;
use crate::pool::{BufferPool, PooledBuffer};
use crate::protocol::{FragmentReader, ReadOutcome, ResponseHeader};
use crate::request::PendingRequest;
use crate::stats::TransferStats;
use crate::transport::{Channel, ChannelConnector};
use crate::writer::{FlushOutcome, RequestWriter};
use crate::xid::XidGenerator;

/// Pause after an idle tick when the timer returns early.
const SPIN_GUARD_PAUSE: Duration = Duration::from_millis(25);

/// Probe wait used to detect a timer that does not block.
const TIMER_PROBE: Duration = Duration::from_millis(20);

/// A probe shorter than this means the timer is broken.
const TIMER_PROBE_MIN: Duration = Duration::from_millis(15);

/// Back-off while a secured channel finishes its own shutdown.
const SHUTDOWN_IN_PROGRESS_POLL: Duration = Duration::from_millis(10);

/// A channel whose connect was started, waiting for its driver.
pub(crate) struct Registration {
    conn: Arc<Connection>,
    channel: Box<dyn Channel>,
}

/// State shared by the client handle, the loop task and every driver.
pub(crate) struct ClientInner {
    pub(crate) settings: ClientSettings,
    registry: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    pub(crate) xids: XidGenerator,
    resolver: ExceptionResolver,
    connector: Arc<dyn ChannelConnector>,
    pool: Arc<dyn BufferPool>,
    registrations: mpsc::UnboundedSender<Registration>,
    shutdown: AtomicBool,
    shutdown_signal: Notify,
}

impl ClientInner {
    pub(crate) fn new(
        settings: ClientSettings,
        resolver: ExceptionResolver,
        connector: Arc<dyn ChannelConnector>,
        pool: Arc<dyn BufferPool>,
    ) -> (Self, mpsc::UnboundedReceiver<Registration>) {
        let (registrations, rx) = mpsc::unbounded_channel();
        let inner = Self {
            settings,
            registry: Mutex::new(HashMap::new()),
            xids: XidGenerator::new(),
            resolver,
            connector,
            pool,
            registrations,
            shutdown: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
        };
        (inner, rx)
    }

    fn statistics(&self) -> bool {
        self.settings.enable_statistics
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Set the shutdown flag and wake the loop.
    pub(crate) fn begin_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            debug!("client shutdown requested");
        }
        self.shutdown_signal.notify_one();
    }

    /// Queue `request` on its destination, establishing a channel if needed.
    ///
    /// Never blocks on I/O and never returns an error: every failure is
    /// delivered to the request's listener.
    pub(crate) fn submit(&self, request: PendingRequest) {
        let target = request.info.target;
        loop {
            let conn = {
                let mut registry = self.registry.lock();
                Arc::clone(registry.entry(target).or_insert_with(|| {
                    Arc::new(Connection::new(
                        target,
                        ReconnectAllowance::new(
                            self.settings.max_reconnect_attempts,
                            self.settings.reconnect_backoff(),
                        ),
                    ))
                }))
            };

            let mut state = conn.state();
            if state.evicted && !self.is_shutting_down() {
                // Lost a race with the sweeper, the registry holds a new entry.
                continue;
            }
            if self.is_shutting_down() {
                drop(state);
                request.fail(RpcError::ShutDown);
                return;
            }

            trace!(xid = request.info.xid, target = %target, "request queued");
            state.send_queue.push_back(request);
            state.last_used = Instant::now();

            match state.link {
                LinkState::Connected => {
                    drop(state);
                    conn.notify_queued();
                }
                // The driver checks the queue once the connect completes.
                LinkState::Connecting => {}
                LinkState::Disconnected => {
                    let failed = self.establish(&conn, &mut state);
                    drop(state);
                    for (request, error) in failed {
                        request.fail(error);
                    }
                }
            }
            return;
        }
    }

    /// Open a channel for a disconnected connection and hand it to the loop.
    ///
    /// Returns the queued requests to fail when no attempt can be made.
    fn establish(
        &self,
        conn: &Arc<Connection>,
        state: &mut ConnectionState,
    ) -> Vec<(PendingRequest, RpcError)> {
        let now = Instant::now();
        let endpoint = conn.endpoint();

        if !state.reconnect.can_attempt(now) {
            debug!(endpoint, "reconnect to server still blocked");
            return state
                .send_queue
                .drain(..)
                .map(|request| {
                    let error = RpcError::Unreachable {
                        endpoint: endpoint.to_string(),
                    };
                    (request, error)
                })
                .collect();
        }

        let opened = self
            .connector
            .open(conn.target(), &self.settings.socket_options())
            .and_then(|mut channel| {
                channel.connect(conn.target())?;
                Ok(channel)
            });

        match opened {
            Ok(channel) => {
                debug!(endpoint, "connecting");
                state.link = LinkState::Connecting;
                let registration = Registration {
                    conn: Arc::clone(conn),
                    channel,
                };
                if self.registrations.send(registration).is_err() {
                    // Loop is gone.
                    state.link = LinkState::Disconnected;
                    return state
                        .send_queue
                        .drain(..)
                        .map(|request| (request, RpcError::ShutDown))
                        .collect();
                }
                Vec::new()
            }
            Err(e) => {
                state.reconnect.record_failure(now);
                debug!(endpoint, error = %e, "cannot establish connection");
                let source = Arc::new(e);
                state
                    .send_queue
                    .drain(..)
                    .map(|request| {
                        let error = RpcError::connect_failed(endpoint, Arc::clone(&source));
                        (request, error)
                    })
                    .collect()
            }
        }
    }

    pub(crate) fn transfer_stats(&self, target: &SocketAddr) -> Option<TransferStats> {
        self.registry
            .lock()
            .get(target)
            .map(|conn| conn.stats().snapshot())
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Evict idle connections and fail requests past the request timeout.
    fn sweep(&self, now: Instant) {
        let request_timeout = self.settings.request_timeout();
        let connection_timeout = self.settings.connection_timeout();
        let mut timed_out = Vec::new();
        let mut evicted = Vec::new();

        {
            let mut registry = self.registry.lock();
            registry.retain(|_, conn| {
                let mut state = conn.state();
                if state.is_idle_since(connection_timeout, now) {
                    state.evicted = true;
                    let residual = state.drain_all();
                    drop(state);
                    evicted.push((Arc::clone(conn), residual));
                    return false;
                }
                timed_out.extend(state.take_expired(request_timeout, now));
                true
            });
        }

        for (conn, residual) in evicted {
            debug!(endpoint = conn.endpoint(), "removing idle connection");
            conn.request_close(CloseReason::Idle);
            for request in residual {
                request.fail(CloseReason::Idle.to_error(conn.endpoint()));
            }
        }
        for request in timed_out {
            debug!(xid = request.info.xid, "request timed out");
            request.fail(RpcError::Timeout);
        }
    }

    /// Fail everything outstanding and ask every driver to close.
    fn fail_all_outstanding(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut registry = self.registry.lock();
            registry.drain().map(|(_, conn)| conn).collect()
        };

        for conn in connections {
            let outstanding = {
                let mut state = conn.state();
                state.evicted = true;
                state.drain_all()
            };
            if !outstanding.is_empty() {
                debug!(
                    endpoint = conn.endpoint(),
                    count = outstanding.len(),
                    "failing outstanding requests on shutdown"
                );
            }
            for request in outstanding {
                request.fail(RpcError::ShutDown);
            }
            conn.request_close(CloseReason::Shutdown);
        }
    }

    /// Shutdown path for a client whose loop never started.
    pub(crate) fn shutdown_without_loop(&self) {
        self.begin_shutdown();
        self.fail_all_outstanding();
    }
}

/// Measure whether the timer actually waits.
///
/// Returns the pause to insert after idle ticks, if it does not.
async fn probe_timer() -> Option<Duration> {
    let started = Instant::now();
    tokio::time::sleep(TIMER_PROBE).await;
    let waited = started.elapsed();
    if waited < TIMER_PROBE_MIN {
        warn!(
            ?waited,
            "timer returned before its deadline, pausing after idle ticks"
        );
        return Some(SPIN_GUARD_PAUSE);
    }
    None
}

/// Run the loop until shutdown. Must be called on the loop thread's runtime.
pub(crate) async fn run(
    inner: Arc<ClientInner>,
    mut registrations: mpsc::UnboundedReceiver<Registration>,
) {
    let tick = inner.settings.tick();
    let idle_pause = probe_timer().await;
    let mut drivers = JoinSet::new();
    let mut last_sweep = Instant::now();

    debug!(tick_ms = inner.settings.tick_ms, "event loop running");

    while !inner.is_shutting_down() {
        let mut activity = false;

        tokio::select! {
            biased;
            _ = inner.shutdown_signal.notified() => break,
            registration = registrations.recv() => {
                if let Some(registration) = registration {
                    spawn_driver(&mut drivers, &inner, registration);
                    activity = true;
                }
            }
            Some(joined) = drivers.join_next(), if !drivers.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "connection driver panicked");
                    }
                }
                activity = true;
            }
            _ = tokio::time::sleep(tick) => {}
        }

        // Drain whatever else was registered during this tick.
        while let Ok(registration) = registrations.try_recv() {
            spawn_driver(&mut drivers, &inner, registration);
            activity = true;
        }

        if last_sweep.elapsed() >= tick {
            let now = Instant::now();
            inner.sweep(now);
            last_sweep = now;
        }

        if !activity {
            if let Some(pause) = idle_pause {
                tokio::time::sleep(pause).await;
            }
        }
    }

    debug!("event loop shutting down");
    inner.fail_all_outstanding();

    registrations.close();
    while let Ok(mut registration) = registrations.try_recv() {
        let outstanding = registration.conn.state().drain_all();
        for request in outstanding {
            request.fail(RpcError::ShutDown);
        }
        let _ = registration.channel.close();
    }

    while drivers.join_next().await.is_some() {}
    debug!("event loop stopped");
}

fn spawn_driver(
    drivers: &mut JoinSet<()>,
    inner: &Arc<ClientInner>,
    registration: Registration,
) {
    let driver = Driver {
        reader: FragmentReader::new(Arc::clone(&inner.pool), inner.settings.max_fragment_size),
        writer: RequestWriter::new(),
        inner: Arc::clone(inner),
        conn: registration.conn,
        channel: registration.channel,
        handshake: None,
    };
    drivers.spawn(driver.run());
}

/// Result of the connect phase.
enum Connect {
    Established,
    Failed(io::Error),
    Closed(CloseReason),
}

/// Owns one channel: connect, then read/write until it closes.
struct Driver {
    inner: Arc<ClientInner>,
    conn: Arc<Connection>,
    channel: Box<dyn Channel>,
    reader: FragmentReader,
    writer: RequestWriter,
    /// Readiness a renegotiating handshake waits for.
    handshake: Option<Interest>,
}

impl Driver {
    async fn run(mut self) {
        match self.connect().await {
            Connect::Established => {
                let reason = self.exchange().await;
                self.teardown(reason);
            }
            Connect::Failed(e) => self.connect_failed(e),
            Connect::Closed(reason) => self.teardown(reason),
        }
    }

    async fn connect(&mut self) -> Connect {
        let channel = self.channel.as_mut();
        let conn = &self.conn;

        let result = tokio::select! {
            biased;
            reason = conn.close_requested() => return Connect::Closed(reason),
            result = establish(channel) => result,
        };

        match result {
            Ok(()) => {
                {
                    let mut state = self.conn.state();
                    state.link = LinkState::Connected;
                    state.reconnect.reset();
                }
                debug!(
                    endpoint = self.conn.endpoint(),
                    local = ?self.channel.local_addr(),
                    "connected"
                );
                Connect::Established
            }
            Err(e) => Connect::Failed(e),
        }
    }

    /// Serve readiness events until the channel must close.
    async fn exchange(&mut self) -> CloseReason {
        loop {
            let want_write = self.writer.is_busy() || self.conn.has_queued();
            let interest = match self.handshake {
                Some(interest) => interest,
                None if want_write => Interest::READABLE | Interest::WRITABLE,
                None => Interest::READABLE,
            };

            let ready = {
                let channel = &self.channel;
                let conn = &self.conn;
                tokio::select! {
                    biased;
                    reason = conn.close_requested() => return reason,
                    _ = conn.queued(), if !want_write => continue,
                    ready = channel.ready(interest) => match ready {
                        Ok(ready) => ready,
                        Err(e) => return CloseReason::Io(Arc::new(e)),
                    },
                }
            };

            if self.channel.is_shutdown_in_progress() {
                tokio::time::sleep(SHUTDOWN_IN_PROGRESS_POLL).await;
                continue;
            }
            match self.channel.do_handshake(ready) {
                Ok(progress) => {
                    self.handshake = progress.interest();
                    if self.handshake.is_some() {
                        continue;
                    }
                }
                Err(e) => return CloseReason::Io(Arc::new(e)),
            }

            if ready.is_readable() || ready.is_read_closed() {
                if let Err(reason) = self.read_responses() {
                    return reason;
                }
            }
            if ready.is_writable() || ready.is_write_closed() {
                if let Err(reason) = self.write_requests() {
                    return reason;
                }
            }
        }
    }

    fn read_responses(&mut self) -> Result<(), CloseReason> {
        loop {
            let outcome = self.reader.read_record(self.channel.as_mut());
            let received = self.reader.take_received();
            if self.inner.statistics() {
                self.conn.stats().add_received(received);
            }

            match outcome {
                Ok(ReadOutcome::Record(fragments)) => self.deliver(fragments)?,
                Ok(ReadOutcome::WouldBlock) => return Ok(()),
                Ok(ReadOutcome::Eof) => return Err(CloseReason::PeerClosed),
                Err(RpcError::Io(e)) => return Err(CloseReason::Io(Arc::new(e))),
                Err(other) => return Err(CloseReason::InvalidFraming(other.to_string())),
            }
        }
    }

    /// Match a complete record to its request and hand it the outcome.
    fn deliver(&mut self, fragments: Vec<PooledBuffer>) -> Result<(), CloseReason> {
        let header = match fragments.first() {
            Some(first) => ResponseHeader::decode(&first[..])
                .map_err(|e| CloseReason::InvalidFraming(e.to_string()))?,
            None => return Err(CloseReason::InvalidFraming("empty record".into())),
        };

        let Some(request) = self.conn.take_in_flight(header.xid) else {
            // Already failed by the sweeper; the buffers go back to the pool.
            warn!(
                xid = header.xid,
                endpoint = self.conn.endpoint(),
                "received response for unknown transaction id"
            );
            return Ok(());
        };

        trace!(xid = header.xid, status = header.accept_status, "response received");
        let timings = request.complete(header.status(), fragments, &self.inner.resolver);
        if self.inner.statistics() {
            if let Some(rtt) = timings.and_then(|t| t.round_trip()) {
                self.conn.stats().record_round_trip(rtt);
            }
        }
        Ok(())
    }

    fn write_requests(&mut self) -> Result<(), CloseReason> {
        let conn = &self.conn;
        let outcome = self.writer.flush(
            self.channel.as_mut(),
            || conn.pop_queued(),
            |request| conn.mark_in_flight(request),
        );
        let sent = self.writer.take_sent();
        if self.inner.statistics() {
            self.conn.stats().add_sent(sent);
        }

        match outcome {
            Ok(FlushOutcome::Idle) | Ok(FlushOutcome::WouldBlock) => Ok(()),
            Ok(FlushOutcome::Eof) => Err(CloseReason::PeerClosed),
            Err(RpcError::Io(e)) => Err(CloseReason::Io(Arc::new(e))),
            Err(other) => Err(CloseReason::Io(Arc::new(io::Error::new(
                io::ErrorKind::Other,
                other.to_string(),
            )))),
        }
    }

    fn connect_failed(mut self, e: io::Error) {
        let _ = self.channel.close();
        let failed = {
            let mut state = self.conn.state();
            state.reconnect.record_failure(Instant::now());
            state.link = LinkState::Disconnected;
            state.drain_all()
        };

        let endpoint = self.conn.endpoint();
        debug!(endpoint, error = %e, "connect failed");
        let source = Arc::new(e);
        for request in failed {
            request.fail(RpcError::connect_failed(endpoint, Arc::clone(&source)));
        }
    }

    /// Close the channel and fail everything that was bound to it.
    fn teardown(mut self, reason: CloseReason) {
        let _ = self.channel.close();
        self.reader.reset();

        let mut failed: Vec<PendingRequest> = self.writer.take_current().into_iter().collect();
        {
            let mut state = self.conn.state();
            failed.extend(state.drain_all());
            state.link = LinkState::Disconnected;
        }

        let endpoint = self.conn.endpoint();
        debug!(endpoint, reason = %reason, failed = failed.len(), "closing connection");
        for request in failed {
            request.fail(reason.to_error(endpoint));
        }
    }
}

/// Finish the connect and complete any handshake.
async fn establish(channel: &mut dyn Channel) -> io::Result<()> {
    channel.finish_connect().await?;
    let mut interest = Interest::READABLE | Interest::WRITABLE;
    loop {
        let ready = channel.ready(interest).await?;
        match channel.do_handshake(ready)?.interest() {
            None => return Ok(()),
            Some(next) => interest = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawMessage;
    use crate::pool::SizeClassPool;
    use crate::request::{FutureListener, RequestInfo, ResponseFuture};
    use crate::transport::PlainConnector;
    use bytes::Bytes;

    fn inner(settings: ClientSettings) -> (Arc<ClientInner>, mpsc::UnboundedReceiver<Registration>) {
        let (inner, rx) = ClientInner::new(
            settings,
            ExceptionResolver::default(),
            Arc::new(PlainConnector),
            Arc::new(SizeClassPool::new()),
        );
        (Arc::new(inner), rx)
    }

    fn request(inner: &ClientInner, target: SocketAddr) -> (PendingRequest, ResponseFuture) {
        let (listener, future) = FutureListener::channel();
        let payload = RawMessage::new(&b"ping"[..]);
        let request = PendingRequest::new(
            RequestInfo {
                xid: inner.xids.next_xid(),
                target,
                program: 1,
                version: 1,
                procedure: 7,
            },
            Bytes::new(),
            payload.to_bytes(),
            false,
            Box::new(listener),
        );
        (request, future)
    }

    #[tokio::test]
    async fn test_submit_registers_new_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let (inner, mut rx) = inner(ClientSettings::default());

        let (req, _future) = request(&inner, target);
        inner.submit(req);

        let registration = rx.try_recv().unwrap();
        assert_eq!(registration.conn.target(), target);
        assert_eq!(registration.conn.state().link, LinkState::Connecting);
        assert_eq!(registration.conn.state().send_queue.len(), 1);

        // Second request rides on the pending connect.
        let (req, _future) = request(&inner, target);
        inner.submit(req);
        assert!(rx.try_recv().is_err());
        assert_eq!(inner.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let (inner, _rx) = inner(ClientSettings::default());
        inner.begin_shutdown();

        let (req, future) = request(&inner, "127.0.0.1:9".parse().unwrap());
        inner.submit(req);
        assert!(future.await.unwrap_err().is_shutdown());
    }

    #[tokio::test]
    async fn test_submit_without_loop_fails_with_shutdown() {
        let (inner, rx) = inner(ClientSettings::default());
        drop(rx);

        let (req, future) = request(&inner, "127.0.0.1:9".parse().unwrap());
        inner.submit(req);
        assert!(future.await.unwrap_err().is_shutdown());
    }

    #[tokio::test]
    async fn test_exhausted_allowance_fails_fast() {
        let settings = ClientSettings {
            max_reconnect_attempts: 1,
            ..Default::default()
        };
        let (inner, _rx) = inner(settings);
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let (req, _future) = request(&inner, target);
        inner.submit(req);
        {
            let registry = inner.registry.lock();
            let conn = registry.get(&target).unwrap();
            let mut state = conn.state();
            state.send_queue.clear();
            state.link = LinkState::Disconnected;
            state.reconnect.record_failure(Instant::now());
        }

        let (req, future) = request(&inner, target);
        inner.submit(req);
        let err = future.await.unwrap_err();
        assert!(matches!(err, RpcError::Unreachable { ref endpoint } if endpoint == "127.0.0.1:9"));
    }

    #[tokio::test]
    async fn test_sweep_times_out_and_evicts() {
        let settings = ClientSettings {
            request_timeout_ms: 100,
            connection_timeout_ms: 1000,
            ..Default::default()
        };
        let (inner, _rx) = inner(settings);
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let (req, future) = request(&inner, target);
        let queued_at = req.queued_at;
        inner.submit(req);

        inner.sweep(queued_at + Duration::from_millis(100));
        assert_eq!(inner.connection_count(), 1);

        inner.sweep(queued_at + Duration::from_millis(150));
        assert!(matches!(future.await, Err(RpcError::Timeout)));

        let last_used = {
            let registry = inner.registry.lock();
            let conn = registry.get(&target).unwrap();
            let state = conn.state();
            state.last_used
        };
        inner.sweep(last_used + Duration::from_millis(1001));
        assert_eq!(inner.connection_count(), 0);
        assert!(inner.transfer_stats(&target).is_none());
    }

    #[tokio::test]
    async fn test_timer_probe_on_working_timer() {
        assert_eq!(probe_timer().await, None);
    }
}
