//! Codec module - request payloads and reply body decoding.
//!
//! The transport treats request messages as opaque payloads through the
//! [`Message`] capability: a numeric type tag, an exact size and a
//! serializer into a byte buffer. Two implementations are provided:
//!
//! - [`RawMessage`] - pre-serialized bytes (zero-copy via `bytes::Bytes`)
//! - [`MsgPackCodec`] - serde values encoded with `rmp-serde` (`to_vec_named`)
//!
//! # Example
//!
//! ```
//! use oncrpc_client::codec::{Message, MsgPackCodec, RawMessage};
//!
//! let ping = RawMessage::new(&b"ping"[..]);
//! assert_eq!(ping.size_in_bytes(), 4);
//!
//! let msg = MsgPackCodec::message(7, &"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(msg.as_bytes()).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;
mod raw;

use bytes::BytesMut;

pub use msgpack::MsgPackCodec;
pub use raw::RawMessage;

/// A serializable request payload (or credential block).
///
/// `size_in_bytes` must equal the number of bytes `serialize_into` appends.
pub trait Message: Send + Sync {
    /// Numeric type tag (credential flavor when used as credentials).
    fn type_tag(&self) -> u32;

    /// Exact serialized size.
    fn size_in_bytes(&self) -> usize;

    /// Append the serialized form to `buf`.
    fn serialize_into(&self, buf: &mut BytesMut);
}
