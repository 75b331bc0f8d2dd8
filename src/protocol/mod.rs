//! Protocol module - record marking, headers, and reassembly.
//!
//! This module implements the binary protocol of the transport:
//! - 4-byte fragment header encoding/decoding
//! - ONC-RPC call header encoding and reply header decoding
//! - Fragment reader reassembling records from partial reads

mod fragment_buffer;
mod frame;
mod wire_format;

pub use fragment_buffer::{FragmentReader, ReadOutcome};
pub use frame::{
    AcceptStatus, CallHeader, ResponseHeader, AUTH_NONE, MSG_TYPE_CALL, RESPONSE_HEADER_SIZE,
    RPC_VERSION, SYSTEM_ERR_MAX,
};
pub use wire_format::{
    encode_fragments, FragmentHeader, DEFAULT_MAX_FRAGMENT_SIZE, FRAGMENT_HEADER_SIZE,
    FRAGMENT_LENGTH_MASK, LAST_FRAGMENT_FLAG, MAX_FRAGMENT_LENGTH,
};
