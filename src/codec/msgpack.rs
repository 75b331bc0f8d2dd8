//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written with `to_vec_named` (struct-as-map) so that field
//! order changes on either side do not break decoding.
//!
//! # Example
//!
//! ```
//! use oncrpc_client::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Lookup {
//!     volume: String,
//!     inode: u64,
//! }
//!
//! let msg = Lookup { volume: "vol1".to_string(), inode: 42 };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Lookup = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use super::RawMessage;
use crate::error::Result;

/// MessagePack codec for structured payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encode a value into a request payload with the given type tag.
    pub fn message<T: serde::Serialize>(tag: u32, value: &T) -> Result<RawMessage> {
        Ok(RawMessage::with_tag(tag, Self::encode(value)?))
    }
}
