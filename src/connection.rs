//! Per-destination connection state.
//!
//! A [`Connection`] is shared between caller threads (enqueueing requests)
//! and the loop thread (driving the channel, sweeping timeouts). All mutable
//! request state sits behind one `parking_lot::Mutex`; listeners are never
//! invoked while it is held.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──send──► Connecting ──connect ok──► Connected
//!      ▲                     │                          │
//!      └──── connect failed ─┘◄──── closed (peer/io) ───┘
//! ```
//!
//! Eviction and shutdown are terminal: the connection is marked and a fresh
//! one is created for later sends.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::CloseReason;
use crate::request::PendingRequest;
use crate::stats::ConnectionStats;

/// Channel state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    /// No channel. The next send attempts to establish one.
    Disconnected,
    /// A channel was handed to the loop and is connecting.
    Connecting,
    /// Connected and handshaken. A driver owns the channel.
    Connected,
}

/// Bounded consecutive connect failures with a back-off window.
#[derive(Debug, Clone)]
pub(crate) struct ReconnectAllowance {
    failures: u32,
    last_failure: Option<Instant>,
    max_attempts: u32,
    backoff: Duration,
}

impl ReconnectAllowance {
    pub(crate) fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            failures: 0,
            last_failure: None,
            max_attempts,
            backoff,
        }
    }

    /// Whether a connect attempt may be started at `now`.
    ///
    /// Once exhausted, one attempt is allowed per elapsed back-off window.
    pub(crate) fn can_attempt(&self, now: Instant) -> bool {
        if self.failures < self.max_attempts {
            return true;
        }
        match self.last_failure {
            Some(at) => now.saturating_duration_since(at) >= self.backoff,
            None => true,
        }
    }

    pub(crate) fn record_failure(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }

    #[cfg(test)]
    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

/// Mutable state guarded by the connection lock.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub(crate) link: LinkState,
    pub(crate) send_queue: VecDeque<PendingRequest>,
    pub(crate) in_flight: HashMap<u32, PendingRequest>,
    pub(crate) reconnect: ReconnectAllowance,
    pub(crate) last_used: Instant,
    /// Removed from the registry. Senders must look up a new connection.
    pub(crate) evicted: bool,
}

impl ConnectionState {
    /// Remove every queued and in-flight request.
    ///
    /// Queued requests come first, in queue order.
    pub(crate) fn drain_all(&mut self) -> Vec<PendingRequest> {
        let mut drained: Vec<PendingRequest> = self.send_queue.drain(..).collect();
        drained.extend(self.in_flight.drain().map(|(_, request)| request));
        drained
    }

    /// Remove requests older than `timeout`.
    ///
    /// The send queue is chronological, so its scan stops at the first
    /// request still within the deadline.
    pub(crate) fn take_expired(&mut self, timeout: Duration, now: Instant) -> Vec<PendingRequest> {
        let stale: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, request)| request.is_expired(timeout, now))
            .map(|(xid, _)| *xid)
            .collect();
        let mut expired: Vec<PendingRequest> = stale
            .iter()
            .filter_map(|xid| self.in_flight.remove(xid))
            .collect();

        while self
            .send_queue
            .front()
            .map_or(false, |request| request.is_expired(timeout, now))
        {
            if let Some(request) = self.send_queue.pop_front() {
                expired.push(request);
            }
        }
        expired
    }

    pub(crate) fn is_idle_since(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_used) > timeout
    }
}

/// A destination and everything outstanding towards it.
pub(crate) struct Connection {
    target: SocketAddr,
    endpoint: String,
    state: Mutex<ConnectionState>,
    stats: ConnectionStats,
    /// Signalled when a request is queued for an open channel.
    queued: Notify,
    close_reason: Mutex<Option<CloseReason>>,
    close: Notify,
}

impl Connection {
    pub(crate) fn new(target: SocketAddr, reconnect: ReconnectAllowance) -> Self {
        Self {
            target,
            endpoint: describe_endpoint(Some(target)),
            state: Mutex::new(ConnectionState {
                link: LinkState::Disconnected,
                send_queue: VecDeque::new(),
                in_flight: HashMap::new(),
                reconnect,
                last_used: Instant::now(),
                evicted: false,
            }),
            stats: ConnectionStats::default(),
            queued: Notify::new(),
            close_reason: Mutex::new(None),
            close: Notify::new(),
        }
    }

    pub(crate) fn target(&self) -> SocketAddr {
        self.target
    }

    /// Endpoint text used in error messages.
    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn state(&self) -> parking_lot::MutexGuard<'_, ConnectionState> {
        self.state.lock()
    }

    pub(crate) fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Pop the head of the send queue.
    pub(crate) fn pop_queued(&self) -> Option<PendingRequest> {
        self.state.lock().send_queue.pop_front()
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.state.lock().send_queue.is_empty()
    }

    /// Move a fully transmitted request into the in-flight table.
    pub(crate) fn mark_in_flight(&self, request: PendingRequest) {
        self.state
            .lock()
            .in_flight
            .insert(request.info.xid, request);
    }

    /// Remove the in-flight request `xid` and record activity.
    pub(crate) fn take_in_flight(&self, xid: u32) -> Option<PendingRequest> {
        let mut state = self.state.lock();
        state.last_used = Instant::now();
        state.in_flight.remove(&xid)
    }

    /// Wake the driver after a request was queued.
    pub(crate) fn notify_queued(&self) {
        self.queued.notify_one();
    }

    pub(crate) async fn queued(&self) {
        self.queued.notified().await
    }

    /// Ask the driver to close the channel. The first reason wins.
    pub(crate) fn request_close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.close.notify_waiters();
    }

    /// Resolves once [`request_close`](Self::request_close) was called.
    pub(crate) async fn close_requested(&self) -> CloseReason {
        loop {
            // Registered before the check, so a concurrent request is not lost.
            let notified = self.close.notified();
            let reason = self.close_reason.lock().clone();
            if let Some(reason) = reason {
                return reason;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Printable endpoint, `"unknown"` when the address is not usable.
pub(crate) fn describe_endpoint(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(addr) if !addr.ip().is_unspecified() && addr.port() != 0 => addr.to_string(),
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FutureListener, RequestInfo};
    use bytes::Bytes;

    fn request(xid: u32) -> PendingRequest {
        let (listener, _future) = FutureListener::channel();
        PendingRequest::new(
            RequestInfo {
                xid,
                target: "127.0.0.1:2049".parse().unwrap(),
                program: 1,
                version: 1,
                procedure: 0,
            },
            Bytes::new(),
            Bytes::new(),
            false,
            Box::new(listener),
        )
    }

    #[test]
    fn test_allowance_blocks_after_max_failures() {
        let now = Instant::now();
        let mut allowance = ReconnectAllowance::new(2, Duration::from_secs(10));
        assert!(allowance.can_attempt(now));

        allowance.record_failure(now);
        assert!(allowance.can_attempt(now));
        allowance.record_failure(now);
        assert!(!allowance.can_attempt(now + Duration::from_secs(9)));
        assert!(allowance.can_attempt(now + Duration::from_secs(10)));

        allowance.reset();
        assert_eq!(allowance.failures(), 0);
        assert!(allowance.can_attempt(now));
    }

    #[test]
    fn test_take_expired_stops_at_first_live_queued_request() {
        let conn = Connection::new(
            "127.0.0.1:2049".parse().unwrap(),
            ReconnectAllowance::new(4, Duration::from_secs(10)),
        );
        let timeout = Duration::from_millis(100);

        let mut state = conn.state();
        let old = request(1);
        let now = old.queued_at + Duration::from_millis(500);
        state.send_queue.push_back(old);

        // Out of order on purpose: the scan must stop at the fresh head.
        let mut fresh = request(2);
        fresh.queued_at = now;
        state.send_queue.push_back(fresh);
        let mut stale_behind = request(3);
        stale_behind.queued_at = now - Duration::from_secs(1);
        state.send_queue.push_back(stale_behind);

        let mut stale_in_flight = request(4);
        stale_in_flight.queued_at = now - Duration::from_secs(1);
        state.in_flight.insert(4, stale_in_flight);
        let mut live_in_flight = request(5);
        live_in_flight.queued_at = now;
        state.in_flight.insert(5, live_in_flight);

        let mut expired: Vec<u32> = state
            .take_expired(timeout, now)
            .iter()
            .map(|r| r.info.xid)
            .collect();
        expired.sort_unstable();
        assert_eq!(expired, vec![1, 4]);
        assert_eq!(state.send_queue.len(), 2);
        assert!(state.in_flight.contains_key(&5));
    }

    #[test]
    fn test_drain_all_queue_first() {
        let conn = Connection::new(
            "127.0.0.1:2049".parse().unwrap(),
            ReconnectAllowance::new(4, Duration::from_secs(10)),
        );
        conn.state().send_queue.push_back(request(1));
        conn.state().send_queue.push_back(request(2));
        conn.mark_in_flight(request(3));

        let drained: Vec<u32> = conn.state().drain_all().iter().map(|r| r.info.xid).collect();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(!conn.has_queued());
    }

    #[tokio::test]
    async fn test_close_request_reaches_waiter() {
        let conn = std::sync::Arc::new(Connection::new(
            "127.0.0.1:2049".parse().unwrap(),
            ReconnectAllowance::new(4, Duration::from_secs(10)),
        ));
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close_requested().await })
        };
        tokio::task::yield_now().await;

        conn.request_close(CloseReason::Idle);
        conn.request_close(CloseReason::Shutdown);
        assert!(matches!(waiter.await.unwrap(), CloseReason::Idle));
        assert!(matches!(conn.close_requested().await, CloseReason::Idle));
    }

    #[test]
    fn test_describe_endpoint() {
        assert_eq!(
            describe_endpoint(Some("10.0.0.1:32636".parse().unwrap())),
            "10.0.0.1:32636"
        );
        assert_eq!(describe_endpoint(Some("0.0.0.0:0".parse().unwrap())), "unknown");
        assert_eq!(describe_endpoint(None), "unknown");
    }
}
