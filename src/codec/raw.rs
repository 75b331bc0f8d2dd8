//! Raw message - pass-through for pre-serialized payloads.
//!
//! Used when the payload was produced by generated stub code or is opaque
//! bytes. The payload is held as `bytes::Bytes`, so cloning is cheap.
//!
//! # Example
//!
//! ```
//! use oncrpc_client::codec::{Message, RawMessage};
//! use bytes::{Bytes, BytesMut};
//!
//! let msg = RawMessage::new(Bytes::from_static(b"binary payload"));
//! let mut buf = BytesMut::new();
//! msg.serialize_into(&mut buf);
//! assert_eq!(&buf[..], b"binary payload");
//! ```

use bytes::{Bytes, BytesMut};

use super::Message;

/// Message whose serialized form is exactly its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    tag: u32,
    bytes: Bytes,
}

impl RawMessage {
    /// Raw payload with type tag 0.
    #[inline]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self::with_tag(0, bytes)
    }

    /// Raw payload with an explicit type tag.
    #[inline]
    pub fn with_tag(tag: u32, bytes: impl Into<Bytes>) -> Self {
        Self {
            tag,
            bytes: bytes.into(),
        }
    }

    /// An empty payload (procedures without arguments).
    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }

    /// Borrow the payload bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl Message for RawMessage {
    fn type_tag(&self) -> u32 {
        self.tag
    }

    fn size_in_bytes(&self) -> usize {
        self.bytes.len()
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.bytes);
    }
}

impl Message for Bytes {
    fn type_tag(&self) -> u32 {
        0
    }

    fn size_in_bytes(&self) -> usize {
        self.len()
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_appends_bytes() {
        let msg = RawMessage::new(&b"hello world"[..]);
        let mut buf = BytesMut::from(&b">"[..]);
        msg.serialize_into(&mut buf);
        assert_eq!(&buf[..], b">hello world");
        assert_eq!(msg.size_in_bytes(), 11);
    }

    #[test]
    fn test_empty_payload() {
        let msg = RawMessage::empty();
        assert_eq!(msg.size_in_bytes(), 0);
        assert_eq!(msg.type_tag(), 0);
    }

    #[test]
    fn test_type_tag_preserved() {
        let msg = RawMessage::with_tag(0x2000_0001, Bytes::new());
        assert_eq!(msg.type_tag(), 0x2000_0001);
    }

    #[test]
    fn test_to_bytes_zero_copy() {
        let original = Bytes::from_static(b"static data");
        let msg = RawMessage::new(original.clone());
        assert_eq!(msg.to_bytes().as_ptr(), original.as_ptr());
    }

    #[test]
    fn test_binary_data_preserved() {
        let all_bytes: Vec<u8> = (0..=255).collect();
        let msg = RawMessage::new(all_bytes.clone());
        let mut buf = BytesMut::new();
        msg.serialize_into(&mut buf);
        assert_eq!(&buf[..], &all_bytes[..]);
    }
}
