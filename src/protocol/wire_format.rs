//! Record marking wire format.
//!
//! Every request and response body travels as one or more fragments, each
//! preceded by a 4-byte fragment header:
//! ```text
//! ┌───┬──────────────────────────────┐
//! │ L │ Fragment length              │
//! │ 1b│ 31 bits                      │
//! └───┴──────────────────────────────┘
//! ```
//! `L` marks the last fragment of a record. Big Endian on the wire.

use crate::error::{RpcError, Result};

/// Fragment header size in bytes (fixed, exactly 4).
pub const FRAGMENT_HEADER_SIZE: usize = 4;

/// Bit 31: last fragment of the record.
pub const LAST_FRAGMENT_FLAG: u32 = 0x8000_0000;

/// Bits 30..0: fragment body length.
pub const FRAGMENT_LENGTH_MASK: u32 = 0x7FFF_FFFF;

/// Largest length a fragment header can carry.
pub const MAX_FRAGMENT_LENGTH: u32 = FRAGMENT_LENGTH_MASK;

/// Default upper bound accepted for a single received fragment (1 GB).
pub const DEFAULT_MAX_FRAGMENT_SIZE: u32 = 1_073_741_824;

/// Decoded fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Length of the fragment body in bytes.
    pub length: u32,
    /// Whether this fragment completes the record.
    pub is_last: bool,
}

impl FragmentHeader {
    /// Create a new header.
    ///
    /// # Errors
    ///
    /// Returns an error if `length` does not fit in 31 bits.
    pub fn new(length: u32, is_last: bool) -> Result<Self> {
        if length > MAX_FRAGMENT_LENGTH {
            return Err(RpcError::InvalidResponse(format!(
                "fragment length {} exceeds the 31-bit maximum",
                length
            )));
        }
        Ok(Self { length, is_last })
    }

    /// Header for a single-fragment record of `length` bytes.
    pub fn single(length: u32) -> Result<Self> {
        Self::new(length, true)
    }

    /// Pack into the 32-bit wire value.
    #[inline]
    pub fn to_u32(&self) -> u32 {
        let flag = if self.is_last { LAST_FRAGMENT_FLAG } else { 0 };
        flag | (self.length & FRAGMENT_LENGTH_MASK)
    }

    /// Unpack from the 32-bit wire value.
    #[inline]
    pub fn from_u32(raw: u32) -> Self {
        Self {
            length: raw & FRAGMENT_LENGTH_MASK,
            is_last: raw & LAST_FRAGMENT_FLAG != 0,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use oncrpc_client::protocol::FragmentHeader;
    ///
    /// let header = FragmentHeader::single(5).unwrap();
    /// assert_eq!(header.encode(), [0x80, 0, 0, 5]);
    /// ```
    pub fn encode(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        self.to_u32().to_be_bytes()
    }

    /// Encode header into an existing buffer.
    pub fn encode_into(&self, buf: &mut [u8; FRAGMENT_HEADER_SIZE]) {
        *buf = self.encode();
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return None;
        }
        Some(Self::from_u32(u32::from_be_bytes([
            buf[0], buf[1], buf[2], buf[3],
        ])))
    }

    /// Validate the fragment length against a receive limit.
    pub fn validate(&self, max_fragment_size: u32) -> Result<()> {
        if self.length > max_fragment_size {
            return Err(RpcError::InvalidResponse(format!(
                "fragment size {} exceeds maximum {}",
                self.length, max_fragment_size
            )));
        }
        Ok(())
    }
}

/// Split `body` into fragments of at most `max_len` bytes and encode them.
///
/// The final fragment carries the last flag; an empty body becomes one empty
/// last fragment.
pub fn encode_fragments(body: &[u8], max_len: usize) -> Result<Vec<u8>> {
    let max_len = max_len.clamp(1, MAX_FRAGMENT_LENGTH as usize);
    let mut out = Vec::with_capacity(body.len() + FRAGMENT_HEADER_SIZE);
    let mut chunks = body.chunks(max_len).peekable();
    if chunks.peek().is_none() {
        out.extend_from_slice(&FragmentHeader::single(0)?.encode());
        return Ok(out);
    }
    while let Some(chunk) = chunks.next() {
        let header = FragmentHeader::new(chunk.len() as u32, chunks.peek().is_none())?;
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(chunk);
    }
    Ok(out)
}
