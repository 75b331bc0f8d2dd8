//! Receive-side fragment reassembly.
//!
//! Implements a state machine over non-blocking channel reads:
//! - `Header`: filling the 4-byte fragment header
//! - `Body`: header decoded, filling a pool buffer of exactly that length
//!
//! A record is complete when the body of the fragment flagged "last" has
//! been read. Fragment bodies stay in their pool buffers; the record is
//! handed out as the ordered list of buffers.
//!
//! # Example
//!
//! ```ignore
//! let mut reader = FragmentReader::new(pool, DEFAULT_MAX_FRAGMENT_SIZE);
//! loop {
//!     match reader.read_record(&mut *channel)? {
//!         ReadOutcome::Record(fragments) => deliver(fragments),
//!         ReadOutcome::WouldBlock => break,
//!         ReadOutcome::Eof => return close(),
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use super::wire_format::{FragmentHeader, FRAGMENT_HEADER_SIZE};
use crate::error::Result;
use crate::pool::{BufferPool, PooledBuffer};
use crate::transport::{Channel, Transfer};

/// Result of draining the channel towards the next record.
pub enum ReadOutcome {
    /// A complete record, one buffer per fragment, in arrival order.
    Record(Vec<PooledBuffer>),
    /// The channel has no more bytes right now.
    WouldBlock,
    /// The peer closed the stream.
    Eof,
}

impl fmt::Debug for ReadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadOutcome::Record(fragments) => {
                write!(f, "Record({} fragments)", fragments.len())
            }
            ReadOutcome::WouldBlock => f.write_str("WouldBlock"),
            ReadOutcome::Eof => f.write_str("Eof"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Body { filled: usize, is_last: bool },
}

/// Reassembles records from fragments read off a channel.
pub struct FragmentReader {
    header: [u8; FRAGMENT_HEADER_SIZE],
    header_filled: usize,
    state: State,
    fragments: Vec<PooledBuffer>,
    pool: Arc<dyn BufferPool>,
    max_fragment_size: u32,
    received: u64,
}

impl FragmentReader {
    /// Create a reader taking fragment buffers from `pool`.
    pub fn new(pool: Arc<dyn BufferPool>, max_fragment_size: u32) -> Self {
        Self {
            header: [0u8; FRAGMENT_HEADER_SIZE],
            header_filled: 0,
            state: State::Header,
            fragments: Vec::new(),
            pool,
            max_fragment_size,
            received: 0,
        }
    }

    /// Read from `channel` until a record completes or no bytes remain.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the channel, or `InvalidResponse` when a
    /// fragment header announces more than the configured maximum.
    pub fn read_record(&mut self, channel: &mut dyn Channel) -> Result<ReadOutcome> {
        loop {
            match self.state {
                State::Header => {
                    match channel.read(&mut self.header[self.header_filled..])? {
                        Transfer::Bytes(n) => {
                            self.header_filled += n;
                            self.received += n as u64;
                        }
                        Transfer::WouldBlock => return Ok(ReadOutcome::WouldBlock),
                        Transfer::Eof => return Ok(ReadOutcome::Eof),
                    }
                    if self.header_filled < FRAGMENT_HEADER_SIZE {
                        continue;
                    }

                    let header = FragmentHeader::from_u32(u32::from_be_bytes(self.header));
                    header.validate(self.max_fragment_size)?;

                    self.fragments
                        .push(PooledBuffer::acquire(&self.pool, header.length as usize));
                    self.header_filled = 0;
                    self.state = State::Body {
                        filled: 0,
                        is_last: header.is_last,
                    };
                }

                State::Body { filled, is_last } => {
                    let Some(current) = self.fragments.last_mut() else {
                        self.state = State::Header;
                        continue;
                    };

                    // Zero-length bodies complete without touching the channel.
                    if filled < current.len() {
                        match channel.read(&mut current[filled..])? {
                            Transfer::Bytes(n) => {
                                self.received += n as u64;
                                self.state = State::Body {
                                    filled: filled + n,
                                    is_last,
                                };
                            }
                            Transfer::WouldBlock => return Ok(ReadOutcome::WouldBlock),
                            Transfer::Eof => return Ok(ReadOutcome::Eof),
                        }
                        continue;
                    }

                    self.state = State::Header;
                    if is_last {
                        return Ok(ReadOutcome::Record(std::mem::take(&mut self.fragments)));
                    }
                    // More fragments follow: next header continues this record.
                }
            }
        }
    }

    /// Bytes read since the last call (headers and bodies).
    pub fn take_received(&mut self) -> u64 {
        std::mem::take(&mut self.received)
    }

    /// Number of fragments of the record currently being assembled.
    pub fn pending_fragments(&self) -> usize {
        self.fragments.len()
    }

    /// Drop any partial record, returning its buffers to the pool.
    pub fn reset(&mut self) {
        self.fragments.clear();
        self.header_filled = 0;
        self.state = State::Header;
    }
}

impl fmt::Debug for FragmentReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentReader")
            .field("state", &self.state)
            .field("header_filled", &self.header_filled)
            .field("fragments", &self.fragments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::pool::SizeClassPool;
    use crate::protocol::encode_fragments;
    use crate::transport::testing::ScriptedChannel;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> Arc<dyn BufferPool> {
        Arc::new(SizeClassPool::new())
    }

    fn concat(fragments: &[PooledBuffer]) -> Vec<u8> {
        fragments.iter().flat_map(|f| f.iter().copied()).collect()
    }

    fn expect_record(outcome: ReadOutcome) -> Vec<PooledBuffer> {
        match outcome {
            ReadOutcome::Record(fragments) => fragments,
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[test]
    fn test_single_fragment_record() {
        let wire = encode_fragments(b"pong-body", 1024).unwrap();
        let mut channel = ScriptedChannel::with_chunks([wire]);
        let mut reader = FragmentReader::new(pool(), 1024);

        let fragments = expect_record(reader.read_record(&mut channel).unwrap());
        assert_eq!(fragments.len(), 1);
        assert_eq!(concat(&fragments), b"pong-body");
        assert_eq!(reader.take_received(), 4 + 9);

        assert!(matches!(
            reader.read_record(&mut channel).unwrap(),
            ReadOutcome::WouldBlock
        ));
    }

    #[test]
    fn test_reassembles_two_and_many_fragments() {
        let body: Vec<u8> = (0..100u8).collect();
        for max_len in [50usize, 7, 1] {
            let wire = encode_fragments(&body, max_len).unwrap();
            let mut channel = ScriptedChannel::with_chunks([wire]);
            let mut reader = FragmentReader::new(pool(), 1024);

            let fragments = expect_record(reader.read_record(&mut channel).unwrap());
            assert_eq!(fragments.len(), (100 + max_len - 1) / max_len);
            assert_eq!(concat(&fragments), body);
        }
    }

    #[test]
    fn test_zero_length_final_fragment() {
        let mut wire = FragmentHeader::new(3, false).unwrap().encode().to_vec();
        wire.extend_from_slice(b"abc");
        wire.extend_from_slice(&FragmentHeader::single(0).unwrap().encode());

        let mut channel = ScriptedChannel::with_chunks([wire]);
        let mut reader = FragmentReader::new(pool(), 1024);

        let fragments = expect_record(reader.read_record(&mut channel).unwrap());
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].len(), 0);
        assert_eq!(concat(&fragments), b"abc");
    }

    #[test]
    fn test_resumes_across_byte_sized_chunks() {
        let wire = encode_fragments(b"hello world", 4).unwrap();
        let chunks: Vec<Vec<u8>> = wire.iter().map(|b| vec![*b]).collect();
        let mut channel = ScriptedChannel::with_chunks(Vec::new());
        let mut reader = FragmentReader::new(pool(), 1024);

        let mut result = None;
        for chunk in chunks {
            channel.chunks.push_back(chunk);
            if let ReadOutcome::Record(fragments) = reader.read_record(&mut channel).unwrap() {
                result = Some(fragments);
            }
        }
        assert_eq!(concat(&result.unwrap()), b"hello world");
    }

    #[test]
    fn test_back_to_back_records() {
        let mut wire = encode_fragments(b"first", 64).unwrap();
        wire.extend(encode_fragments(b"second", 3).unwrap());
        let mut channel = ScriptedChannel::with_chunks([wire]);
        let mut reader = FragmentReader::new(pool(), 1024);

        let a = expect_record(reader.read_record(&mut channel).unwrap());
        let b = expect_record(reader.read_record(&mut channel).unwrap());
        assert_eq!(concat(&a), b"first");
        assert_eq!(concat(&b), b"second");
    }

    #[test]
    fn test_oversized_fragment_rejected() {
        let wire = FragmentHeader::single(2048).unwrap().encode().to_vec();
        let mut channel = ScriptedChannel::with_chunks([wire]);
        let mut reader = FragmentReader::new(pool(), 1024);

        let err = reader.read_record(&mut channel).unwrap_err();
        assert!(matches!(err, RpcError::InvalidResponse(ref m) if m.contains("exceeds maximum")));
    }

    #[test]
    fn test_eof_mid_record() {
        let mut wire = FragmentHeader::single(10).unwrap().encode().to_vec();
        wire.extend_from_slice(b"abc");
        let mut channel = ScriptedChannel::with_chunks([wire]);
        channel.eof = true;
        let mut reader = FragmentReader::new(pool(), 1024);

        assert!(matches!(
            reader.read_record(&mut channel).unwrap(),
            ReadOutcome::Eof
        ));
        assert_eq!(reader.pending_fragments(), 1);
    }

    struct CountingPool {
        inner: SizeClassPool,
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl BufferPool for CountingPool {
        fn acquire(&self, size: usize) -> BytesMut {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            self.inner.acquire(size)
        }

        fn release(&self, buf: BytesMut) {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.inner.release(buf);
        }
    }

    #[test]
    fn test_partial_record_released_on_reset() {
        let counting = Arc::new(CountingPool {
            inner: SizeClassPool::new(),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        });
        let mut wire = FragmentHeader::new(2, false).unwrap().encode().to_vec();
        wire.extend_from_slice(b"ab");
        wire.extend_from_slice(&FragmentHeader::single(5).unwrap().encode());
        wire.extend_from_slice(b"c");

        let mut channel = ScriptedChannel::with_chunks([wire]);
        let mut reader = FragmentReader::new(counting.clone(), 1024);
        assert!(matches!(
            reader.read_record(&mut channel).unwrap(),
            ReadOutcome::WouldBlock
        ));
        assert_eq!(counting.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(counting.released.load(Ordering::SeqCst), 0);

        reader.reset();
        assert_eq!(counting.released.load(Ordering::SeqCst), 2);
        assert_eq!(reader.pending_fragments(), 0);
    }
}
