//! # oncrpc-client
//!
//! Asynchronous ONC-RPC transport client.
//!
//! Callers on any thread submit calls addressed to a server; a single loop
//! thread multiplexes them over one TCP channel per destination, frames them
//! with record marking, correlates replies by transaction id (XID) and
//! delivers every outcome exactly once.
//!
//! ## Architecture
//!
//! - **Record marking**: 4-byte fragment headers, records reassembled from
//!   partial reads into pooled buffers
//! - **Connections**: lazily established, pipelined, evicted when idle,
//!   guarded by a bounded reconnect allowance
//! - **Timeouts**: a periodic sweep fails overdue requests
//!
//! ## Example
//!
//! ```ignore
//! use oncrpc_client::{Client, RawMessage};
//!
//! let client = Client::builder().start()?;
//! let response = client
//!     .send_request(server, 1, 1, 7, &RawMessage::new(&b"ping"[..]), None)
//!     .wait()?;
//! println!("{} bytes", response.body_len());
//! client.shutdown();
//! client.wait_for_shutdown();
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod exception;
pub mod pool;
pub mod protocol;
pub mod request;
pub mod stats;
pub mod transport;
pub mod xid;

mod client;
mod connection;
mod event_loop;
mod writer;

pub use client::{Client, ClientBuilder, LOOP_THREAD_NAME};
pub use codec::{Message, MsgPackCodec, RawMessage};
pub use config::ClientSettings;
pub use error::{CloseReason, Result, RpcError};
pub use exception::{ExceptionParser, ExceptionResolver, RemoteException};
pub use pool::{BufferPool, PooledBuffer, SizeClassPool};
pub use request::{RequestInfo, RequestTimings, Response, ResponseFuture, ResponseListener};
pub use stats::TransferStats;
