//! Per-call state and result delivery.
//!
//! A [`PendingRequest`] lives in exactly one place at a time: the send queue
//! of its connection, the writer cursor while it is being transmitted, or the
//! in-flight table. It is consumed when its outcome is delivered, so the
//! listener is invoked at most once by construction.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::codec::MsgPackCodec;
use crate::error::{Result, RpcError};
use crate::exception::{ExceptionResolver, RemoteException};
use crate::pool::PooledBuffer;
use crate::protocol::{AcceptStatus, RESPONSE_HEADER_SIZE};

/// Identity of a request, handed to every listener callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestInfo {
    pub xid: u32,
    pub target: SocketAddr,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

/// Timestamps of one request.
///
/// `sent_at` and `completed_at` are recorded only with statistics enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimings {
    pub queued_at: Instant,
    pub sent_at: Option<Instant>,
    pub completed_at: Option<Instant>,
}

impl RequestTimings {
    /// Time from the end of transmission to the reply.
    pub fn round_trip(&self) -> Option<Duration> {
        Some(self.completed_at?.saturating_duration_since(self.sent_at?))
    }

    /// Time from enqueue to the reply.
    pub fn total(&self) -> Option<Duration> {
        Some(self.completed_at?.saturating_duration_since(self.queued_at))
    }
}

/// A successful reply.
///
/// The body stays in the pool buffers it was received into and is released
/// when the response is dropped.
pub struct Response {
    info: RequestInfo,
    timings: RequestTimings,
    fragments: Vec<PooledBuffer>,
}

impl Response {
    pub(crate) fn new(
        info: RequestInfo,
        timings: RequestTimings,
        fragments: Vec<PooledBuffer>,
    ) -> Self {
        Self {
            info,
            timings,
            fragments,
        }
    }

    pub fn xid(&self) -> u32 {
        self.info.xid
    }

    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    pub fn timings(&self) -> &RequestTimings {
        &self.timings
    }

    /// Reply body split along fragment boundaries, reply header excluded.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.fragments.iter().enumerate().map(|(i, fragment)| {
            if i == 0 {
                &fragment[RESPONSE_HEADER_SIZE.min(fragment.len())..]
            } else {
                &fragment[..]
            }
        })
    }

    /// Reply body length in bytes.
    pub fn body_len(&self) -> usize {
        self.chunks().map(<[u8]>::len).sum()
    }

    /// Copy the reply body into one contiguous buffer.
    pub fn body(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.body_len());
        for chunk in self.chunks() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    /// Decode a MsgPack reply body.
    pub fn decode_msgpack<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.body())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("xid", &self.info.xid)
            .field("target", &self.info.target)
            .field("fragments", &self.fragments.len())
            .field("body_len", &self.body_len())
            .finish()
    }
}

/// Receives the outcome of one request.
///
/// Exactly one method is called, on the client's loop thread. Implementations
/// must not block.
pub trait ResponseListener: Send + 'static {
    /// The server answered with SUCCESS.
    fn response_available(self: Box<Self>, response: Response);

    /// The server raised an application exception a parser recognized.
    fn remote_exception_thrown(
        self: Box<Self>,
        request: RequestInfo,
        status: i32,
        exception: RemoteException,
    );

    /// Any other outcome.
    fn request_failed(self: Box<Self>, request: RequestInfo, error: RpcError);
}

/// Listener resolving a [`ResponseFuture`].
pub(crate) struct FutureListener {
    tx: oneshot::Sender<Result<Response>>,
}

impl FutureListener {
    pub(crate) fn channel() -> (Self, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, ResponseFuture { rx })
    }
}

impl ResponseListener for FutureListener {
    fn response_available(self: Box<Self>, response: Response) {
        // The caller may have dropped the future.
        let _ = self.tx.send(Ok(response));
    }

    fn remote_exception_thrown(
        self: Box<Self>,
        _request: RequestInfo,
        status: i32,
        exception: RemoteException,
    ) {
        let _ = self
            .tx
            .send(Err(RpcError::RemoteException { status, exception }));
    }

    fn request_failed(self: Box<Self>, _request: RequestInfo, error: RpcError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Outcome of a request sent with [`Client::send_request`](crate::Client::send_request).
///
/// Resolves exactly once. A remote exception arrives as
/// [`RpcError::RemoteException`].
#[must_use = "the response is lost if the future is dropped"]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Response>>,
}

impl ResponseFuture {
    /// Block the current thread until the outcome is available.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn wait(self) -> Result<Response> {
        self.rx.blocking_recv().unwrap_or(Err(RpcError::ShutDown))
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Listener dropped without an outcome: the loop is gone.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ShutDown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture").finish_non_exhaustive()
    }
}

/// A queued or in-flight call.
pub(crate) struct PendingRequest {
    pub(crate) info: RequestInfo,
    /// Encoded call header and credentials.
    pub(crate) header: Bytes,
    pub(crate) payload: Bytes,
    pub(crate) queued_at: Instant,
    pub(crate) sent_at: Option<Instant>,
    record_timings: bool,
    listener: Box<dyn ResponseListener>,
}

impl PendingRequest {
    pub(crate) fn new(
        info: RequestInfo,
        header: Bytes,
        payload: Bytes,
        record_timings: bool,
        listener: Box<dyn ResponseListener>,
    ) -> Self {
        Self {
            info,
            header,
            payload,
            queued_at: Instant::now(),
            sent_at: None,
            record_timings,
            listener,
        }
    }

    /// Length of the record body (call header plus payload).
    pub(crate) fn body_len(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    /// Whether the request outlived `timeout` at `now`.
    pub(crate) fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        self.queued_at + timeout < now
    }

    pub(crate) fn mark_sent(&mut self) {
        if self.record_timings {
            self.sent_at = Some(Instant::now());
        }
    }

    fn timings(&self) -> RequestTimings {
        RequestTimings {
            queued_at: self.queued_at,
            sent_at: self.sent_at,
            completed_at: self.record_timings.then(Instant::now),
        }
    }

    /// Deliver `error` to the listener.
    pub(crate) fn fail(self, error: RpcError) {
        self.listener.request_failed(self.info, error);
    }

    /// Deliver a reply whose header carried `status`.
    ///
    /// Returns the timings of a successful round trip.
    pub(crate) fn complete(
        self,
        status: AcceptStatus,
        fragments: Vec<PooledBuffer>,
        resolver: &ExceptionResolver,
    ) -> Option<RequestTimings> {
        match status {
            AcceptStatus::Success => {
                let timings = self.timings();
                self.listener
                    .response_available(Response::new(self.info, timings, fragments));
                Some(timings)
            }
            AcceptStatus::Application(code) => {
                let body = fragments
                    .first()
                    .map(|f| &f[RESPONSE_HEADER_SIZE.min(f.len())..])
                    .unwrap_or(&[]);
                match resolver.resolve(code, body) {
                    RpcError::RemoteException { status, exception } => {
                        self.listener
                            .remote_exception_thrown(self.info, status, exception);
                    }
                    other => self.listener.request_failed(self.info, other),
                }
                None
            }
            protocol => {
                self.listener
                    .request_failed(self.info, RpcError::Protocol(protocol));
                None
            }
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("xid", &self.info.xid)
            .field("target", &self.info.target)
            .field("body_len", &self.body_len())
            .finish()
    }
}
