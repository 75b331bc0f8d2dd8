//! Write path: transmit queued requests over a non-blocking channel.
//!
//! Each request goes out as one record with a single last-flagged fragment:
//!
//! ```text
//! ┌────────────────┬─────────────┬─────────┐
//! │ fragment hdr 4 │ call header │ payload │
//! └────────────────┴─────────────┴─────────┘
//! ```
//!
//! A partial write leaves the cursor where the channel stopped; the next
//! writable event resumes from there without re-encoding the header.

use std::fmt;

use crate::error::{Result, RpcError};
use crate::protocol::{FragmentHeader, FRAGMENT_HEADER_SIZE, MAX_FRAGMENT_LENGTH};
use crate::request::PendingRequest;
use crate::transport::{Channel, Transfer};

/// Fragment header for a request body sent as one fragment.
fn record_header(body_len: usize) -> Result<FragmentHeader> {
    match u32::try_from(body_len) {
        Ok(len) if len <= MAX_FRAGMENT_LENGTH => FragmentHeader::single(len),
        _ => Err(RpcError::RequestTooLarge(format!(
            "request body of {} bytes does not fit in one fragment",
            body_len
        ))),
    }
}

/// Transmission state of one request.
pub(crate) struct SendCursor {
    request: PendingRequest,
    fragment_header: [u8; FRAGMENT_HEADER_SIZE],
    written: usize,
}

impl SendCursor {
    /// Encode the fragment header for `request`.
    ///
    /// Hands the request back when its body does not fit in one fragment.
    pub(crate) fn new(
        request: PendingRequest,
    ) -> std::result::Result<Self, (PendingRequest, RpcError)> {
        let header = match record_header(request.body_len()) {
            Ok(header) => header,
            Err(e) => return Err((request, e)),
        };
        Ok(Self {
            request,
            fragment_header: header.encode(),
            written: 0,
        })
    }

    /// Total bytes of this record on the wire.
    pub(crate) fn total_len(&self) -> usize {
        FRAGMENT_HEADER_SIZE + self.request.body_len()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.written >= self.total_len()
    }

    /// The unwritten tail of the first segment that is not drained yet.
    fn remaining_segment(&self) -> &[u8] {
        let segments: [&[u8]; 3] = [
            &self.fragment_header,
            &self.request.header,
            &self.request.payload,
        ];
        let mut skipped = 0;
        for segment in segments {
            let end = skipped + segment.len();
            if self.written < end {
                return &segment[self.written - skipped..];
            }
            skipped = end;
        }
        &[]
    }

    pub(crate) fn into_request(self) -> PendingRequest {
        self.request
    }
}

impl fmt::Debug for SendCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendCursor")
            .field("xid", &self.request.info.xid)
            .field("written", &self.written)
            .field("total", &self.total_len())
            .finish()
    }
}

/// Why [`RequestWriter::flush`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    /// Queue drained and nothing is being transmitted.
    Idle,
    /// The channel accepts no more bytes for now.
    WouldBlock,
    /// The peer closed the connection.
    Eof,
}

/// Per-channel writer holding the request currently on the wire.
#[derive(Debug, Default)]
pub(crate) struct RequestWriter {
    current: Option<SendCursor>,
    sent: u64,
}

impl RequestWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Write queued requests until the queue is empty or the channel blocks.
    ///
    /// `next` pops the head of the send queue; `transmitted` receives each
    /// request once its last byte is written.
    ///
    /// # Errors
    ///
    /// Returns the channel's I/O error. The interrupted request stays in the
    /// writer and is handed out by [`take_current`](Self::take_current).
    pub(crate) fn flush<N, T>(
        &mut self,
        channel: &mut dyn Channel,
        mut next: N,
        mut transmitted: T,
    ) -> Result<FlushOutcome>
    where
        N: FnMut() -> Option<PendingRequest>,
        T: FnMut(PendingRequest),
    {
        loop {
            if self.current.is_none() {
                let Some(request) = next() else {
                    return Ok(FlushOutcome::Idle);
                };
                match SendCursor::new(request) {
                    Ok(cursor) => self.current = Some(cursor),
                    Err((request, e)) => {
                        request.fail(e);
                        continue;
                    }
                }
            }
            let Some(cursor) = self.current.as_mut() else {
                continue;
            };

            while !cursor.is_complete() {
                match channel.write(cursor.remaining_segment())? {
                    Transfer::Bytes(n) => {
                        cursor.written += n;
                        self.sent += n as u64;
                    }
                    Transfer::WouldBlock => return Ok(FlushOutcome::WouldBlock),
                    Transfer::Eof => return Ok(FlushOutcome::Eof),
                }
            }

            if let Some(cursor) = self.current.take() {
                let mut request = cursor.into_request();
                request.mark_sent();
                transmitted(request);
            }
        }
    }

    /// Whether a request is partially transmitted.
    pub(crate) fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Remove the request being transmitted, if any.
    pub(crate) fn take_current(&mut self) -> Option<PendingRequest> {
        self.current.take().map(SendCursor::into_request)
    }

    /// Bytes written since the last call.
    pub(crate) fn take_sent(&mut self) -> u64 {
        std::mem::take(&mut self.sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FutureListener, RequestInfo, ResponseFuture};
    use crate::transport::testing::ScriptedChannel;
    use bytes::Bytes;
    use std::collections::VecDeque;

    fn request(xid: u32, payload: &'static [u8]) -> (PendingRequest, ResponseFuture) {
        let (listener, future) = FutureListener::channel();
        let info = RequestInfo {
            xid,
            target: "127.0.0.1:111".parse().unwrap(),
            program: 1,
            version: 1,
            procedure: 7,
        };
        let header = Bytes::copy_from_slice(&xid.to_be_bytes());
        let request = PendingRequest::new(
            info,
            header,
            Bytes::from_static(payload),
            false,
            Box::new(listener),
        );
        (request, future)
    }

    fn expected_record(xid: u32, payload: &[u8]) -> Vec<u8> {
        let len = 4 + payload.len() as u32;
        let mut out = (0x8000_0000u32 | len).to_be_bytes().to_vec();
        out.extend_from_slice(&xid.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_flush_writes_queue_in_order() {
        let mut queue: VecDeque<_> = [request(1, b"ping"), request(2, b"")]
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        let mut channel = ScriptedChannel::default();
        let mut writer = RequestWriter::new();
        let mut done = Vec::new();

        let outcome = writer
            .flush(&mut channel, || queue.pop_front(), |r| done.push(r.info.xid))
            .unwrap();

        assert_eq!(outcome, FlushOutcome::Idle);
        assert_eq!(done, vec![1, 2]);
        let mut expected = expected_record(1, b"ping");
        expected.extend(expected_record(2, b""));
        assert_eq!(channel.written, expected);
        assert_eq!(writer.take_sent(), expected.len() as u64);
    }

    #[test]
    fn test_partial_write_resumes_without_reencoding() {
        let mut queue: VecDeque<_> = VecDeque::from([request(9, b"payload").0]);
        let mut channel = ScriptedChannel {
            write_budget: Some(2),
            ..Default::default()
        };
        let mut writer = RequestWriter::new();
        let mut done = Vec::new();

        // Header is only half written.
        let outcome = writer
            .flush(&mut channel, || queue.pop_front(), |r| done.push(r.info.xid))
            .unwrap();
        assert_eq!(outcome, FlushOutcome::WouldBlock);
        assert!(writer.is_busy());
        assert!(done.is_empty());

        for budget in [3, 1, 100] {
            channel.write_budget = Some(budget);
            writer
                .flush(&mut channel, || queue.pop_front(), |r| done.push(r.info.xid))
                .unwrap();
        }

        assert_eq!(done, vec![9]);
        assert!(!writer.is_busy());
        assert_eq!(channel.written, expected_record(9, b"payload"));
    }

    #[test]
    fn test_eof_keeps_current_request() {
        let mut queue: VecDeque<_> = VecDeque::from([request(3, b"x").0]);
        let mut channel = ScriptedChannel {
            write_eof: true,
            ..Default::default()
        };
        let mut writer = RequestWriter::new();

        let outcome = writer
            .flush(&mut channel, || queue.pop_front(), |_| panic!("not sent"))
            .unwrap();
        assert_eq!(outcome, FlushOutcome::Eof);
        assert_eq!(writer.take_current().map(|r| r.info.xid), Some(3));
    }

    #[tokio::test]
    async fn test_interrupted_request_can_be_failed() {
        let (req, future) = request(4, b"abc");
        let mut queue = VecDeque::from([req]);
        let mut channel = ScriptedChannel {
            write_budget: Some(1),
            ..Default::default()
        };
        let mut writer = RequestWriter::new();
        writer
            .flush(&mut channel, || queue.pop_front(), |_| {})
            .unwrap();

        if let Some(request) = writer.take_current() {
            request.fail(RpcError::ShutDown);
        }
        assert!(future.await.unwrap_err().is_shutdown());
    }

    #[test]
    fn test_oversized_body_is_a_request_error() {
        assert_eq!(record_header(4).unwrap(), FragmentHeader::single(4).unwrap());

        let too_long = MAX_FRAGMENT_LENGTH as usize + 1;
        let err = record_header(too_long).unwrap_err();
        assert!(matches!(err, RpcError::RequestTooLarge(ref m) if m.contains("one fragment")));
    }
}
