//! Call and reply headers carried inside the record body.
//!
//! A request record starts with the ONC-RPC call header (XDR encoded):
//! ```text
//! xid | CALL | rpcvers=2 | prog | vers | proc | cred(flavor, opaque) | verf(AUTH_NONE)
//! ```
//! A response record starts with the reply header:
//! ```text
//! ┌──────────┬───────────────┐
//! │ XID      │ Accept status │
//! │ int32 BE │ int32 BE      │
//! └──────────┴───────────────┘
//! ```
//! followed by the reply body (success) or a serialized exception.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::codec::Message;
use crate::error::{RpcError, Result};

/// Reply header size in bytes.
pub const RESPONSE_HEADER_SIZE: usize = 8;

/// Message type of a call.
pub const MSG_TYPE_CALL: u32 = 0;

/// ONC-RPC protocol version.
pub const RPC_VERSION: u32 = 2;

/// Credential/verifier flavor meaning "no authentication".
pub const AUTH_NONE: u32 = 0;

/// Highest accept status in the protocol-error range.
pub const SYSTEM_ERR_MAX: i32 = 5;

/// Outcome code of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStatus {
    /// The call succeeded, the reply body follows.
    Success,
    /// Remote has not exported the program.
    ProgUnavail,
    /// Remote cannot support the program version.
    ProgMismatch,
    /// Program cannot support the procedure.
    ProcUnavail,
    /// Procedure could not decode its arguments.
    GarbageArgs,
    /// Remote system error (memory allocation failure etc).
    SystemErr,
    /// Any other status in the protocol-error range (negative values).
    OtherProtocol(i32),
    /// Application exception id, resolved through the exception parsers.
    Application(i32),
}

impl AcceptStatus {
    /// Classify a raw accept status.
    pub fn from_i32(raw: i32) -> Self {
        match raw {
            0 => AcceptStatus::Success,
            1 => AcceptStatus::ProgUnavail,
            2 => AcceptStatus::ProgMismatch,
            3 => AcceptStatus::ProcUnavail,
            4 => AcceptStatus::GarbageArgs,
            5 => AcceptStatus::SystemErr,
            n if n > SYSTEM_ERR_MAX => AcceptStatus::Application(n),
            n => AcceptStatus::OtherProtocol(n),
        }
    }

    /// Raw wire value.
    pub fn as_i32(&self) -> i32 {
        match *self {
            AcceptStatus::Success => 0,
            AcceptStatus::ProgUnavail => 1,
            AcceptStatus::ProgMismatch => 2,
            AcceptStatus::ProcUnavail => 3,
            AcceptStatus::GarbageArgs => 4,
            AcceptStatus::SystemErr => 5,
            AcceptStatus::OtherProtocol(n) | AcceptStatus::Application(n) => n,
        }
    }

    /// True if the status is in the protocol-error range.
    pub fn is_protocol_error(&self) -> bool {
        !matches!(self, AcceptStatus::Success | AcceptStatus::Application(_))
    }
}

impl fmt::Display for AcceptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptStatus::Success => f.write_str("SUCCESS"),
            AcceptStatus::ProgUnavail => f.write_str("program unavailable (PROG_UNAVAIL)"),
            AcceptStatus::ProgMismatch => f.write_str("program version mismatch (PROG_MISMATCH)"),
            AcceptStatus::ProcUnavail => f.write_str("procedure unavailable (PROC_UNAVAIL)"),
            AcceptStatus::GarbageArgs => f.write_str("garbage arguments (GARBAGE_ARGS)"),
            AcceptStatus::SystemErr => f.write_str("system error (SYSTEM_ERR)"),
            AcceptStatus::OtherProtocol(n) => write!(f, "protocol error status {}", n),
            AcceptStatus::Application(n) => write!(f, "application status {}", n),
        }
    }
}

/// Decoded reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Transaction id echoed by the server.
    pub xid: u32,
    /// Raw accept status.
    pub accept_status: i32,
}

impl ResponseHeader {
    /// Create a new reply header.
    pub fn new(xid: u32, accept_status: i32) -> Self {
        Self { xid, accept_status }
    }

    /// Classified accept status.
    pub fn status(&self) -> AcceptStatus {
        AcceptStatus::from_i32(self.accept_status)
    }

    /// Encode header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut buf = [0u8; RESPONSE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.xid.to_be_bytes());
        buf[4..8].copy_from_slice(&self.accept_status.to_be_bytes());
        buf
    }

    /// Decode the reply header from the start of the first fragment.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than 8 bytes are available.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Err(RpcError::InvalidResponse(format!(
                "response header needs {} bytes, got {}",
                RESPONSE_HEADER_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            xid: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            accept_status: i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// ONC-RPC call header preceding every request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

impl CallHeader {
    /// Create a new call header.
    pub fn new(xid: u32, program: u32, version: u32, procedure: u32) -> Self {
        Self {
            xid,
            program,
            version,
            procedure,
        }
    }

    /// Encoded size of this header with the given credentials.
    pub fn encoded_len(credentials: Option<&dyn Message>) -> usize {
        let cred_body = credentials.map(|c| xdr_padded(c.size_in_bytes())).unwrap_or(0);
        // 6 fixed words + cred flavor + cred length + body + verifier (2 words)
        6 * 4 + 8 + cred_body + 8
    }

    /// Serialize the header (and credentials) into `buf`.
    ///
    /// # Errors
    ///
    /// `RequestTooLarge` when the credential body exceeds the 32-bit opaque
    /// length. Nothing is written in that case.
    pub fn encode_into(
        &self,
        buf: &mut BytesMut,
        credentials: Option<&dyn Message>,
    ) -> Result<()> {
        let cred_len = match credentials {
            Some(cred) => Some(u32::try_from(cred.size_in_bytes()).map_err(|_| {
                RpcError::RequestTooLarge(format!(
                    "credentials of {} bytes exceed the opaque length limit",
                    cred.size_in_bytes()
                ))
            })?),
            None => None,
        };

        buf.reserve(Self::encoded_len(credentials));
        buf.put_u32(self.xid);
        buf.put_u32(MSG_TYPE_CALL);
        buf.put_u32(RPC_VERSION);
        buf.put_u32(self.program);
        buf.put_u32(self.version);
        buf.put_u32(self.procedure);

        match credentials.zip(cred_len) {
            Some((cred, wire_len)) => {
                let len = cred.size_in_bytes();
                buf.put_u32(cred.type_tag());
                buf.put_u32(wire_len);
                let start = buf.len();
                cred.serialize_into(buf);
                debug_assert_eq!(buf.len() - start, len, "credential size mismatch");
                buf.put_bytes(0, xdr_padded(len) - len);
            }
            None => {
                buf.put_u32(AUTH_NONE);
                buf.put_u32(0);
            }
        }

        // verifier
        buf.put_u32(AUTH_NONE);
        buf.put_u32(0);
        Ok(())
    }
}

/// Round up to the XDR 4-byte unit.
#[inline]
fn xdr_padded(len: usize) -> usize {
    (len + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawMessage;

    #[test]
    fn test_accept_status_ranges() {
        assert_eq!(AcceptStatus::from_i32(0), AcceptStatus::Success);
        assert_eq!(AcceptStatus::from_i32(3), AcceptStatus::ProcUnavail);
        assert_eq!(AcceptStatus::from_i32(5), AcceptStatus::SystemErr);
        assert_eq!(AcceptStatus::from_i32(6), AcceptStatus::Application(6));
        assert_eq!(AcceptStatus::from_i32(150), AcceptStatus::Application(150));
        assert_eq!(AcceptStatus::from_i32(-1), AcceptStatus::OtherProtocol(-1));

        assert!(AcceptStatus::GarbageArgs.is_protocol_error());
        assert!(AcceptStatus::OtherProtocol(-7).is_protocol_error());
        assert!(!AcceptStatus::Success.is_protocol_error());
        assert!(!AcceptStatus::Application(150).is_protocol_error());
    }

    #[test]
    fn test_accept_status_raw_value() {
        for raw in [-3, 0, 1, 2, 3, 4, 5, 6, 1000] {
            assert_eq!(AcceptStatus::from_i32(raw).as_i32(), raw);
        }
    }

    #[test]
    fn test_response_header_big_endian() {
        let header = ResponseHeader::new(0x0102_0304, 150);
        let bytes = header.encode();
        assert_eq!(bytes, [0x01, 0x02, 0x03, 0x04, 0, 0, 0, 150]);
        assert_eq!(ResponseHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_response_header_too_short() {
        let err = ResponseHeader::decode(&[0, 0, 0, 1, 0, 0]).unwrap_err();
        assert!(matches!(err, RpcError::InvalidResponse(_)));
    }

    #[test]
    fn test_call_header_without_credentials() {
        let mut buf = BytesMut::new();
        CallHeader::new(42, 1, 1, 7).encode_into(&mut buf, None).unwrap();

        assert_eq!(buf.len(), CallHeader::encoded_len(None));
        let words: Vec<u32> = buf
            .chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words, vec![42, MSG_TYPE_CALL, RPC_VERSION, 1, 1, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn test_call_header_credentials_are_padded() {
        let cred = RawMessage::with_tag(9, &b"abcde"[..]);
        let mut buf = BytesMut::new();
        CallHeader::new(1, 2, 3, 4).encode_into(&mut buf, Some(&cred)).unwrap();

        assert_eq!(buf.len(), CallHeader::encoded_len(Some(&cred)));
        assert_eq!(buf.len() % 4, 0);
        // flavor and opaque length follow the six fixed words
        assert_eq!(&buf[24..28], &9u32.to_be_bytes());
        assert_eq!(&buf[28..32], &5u32.to_be_bytes());
        assert_eq!(&buf[32..37], b"abcde");
        assert_eq!(&buf[37..40], &[0, 0, 0]);
    }

    struct HugeCredentials;

    impl Message for HugeCredentials {
        fn type_tag(&self) -> u32 {
            1
        }

        fn size_in_bytes(&self) -> usize {
            usize::MAX
        }

        fn serialize_into(&self, _buf: &mut BytesMut) {
            panic!("oversized credentials must not be serialized");
        }
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_oversized_credentials_rejected() {
        let mut buf = BytesMut::new();
        let err = CallHeader::new(1, 2, 3, 4)
            .encode_into(&mut buf, Some(&HugeCredentials))
            .unwrap_err();

        assert!(matches!(err, RpcError::RequestTooLarge(ref m) if m.contains("credentials")));
        assert!(buf.is_empty());
    }
}
