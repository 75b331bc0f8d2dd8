//! Scripted in-memory channel for unit tests.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use tokio::io::{Interest, Ready};

use super::{BoxFuture, Channel, Handshake, Transfer};

/// Channel that replays scripted reads and records writes.
///
/// Reads hand out the queued chunks (split to the caller's buffer); once the
/// script is exhausted reads return `WouldBlock`, or `Eof` when `eof` is set.
/// Writes accept at most `write_budget` bytes per call before `WouldBlock`.
#[derive(Default)]
pub(crate) struct ScriptedChannel {
    pub chunks: VecDeque<Vec<u8>>,
    pub eof: bool,
    pub written: Vec<u8>,
    pub write_budget: Option<usize>,
    pub write_eof: bool,
    pub closed: bool,
}

impl ScriptedChannel {
    pub fn with_chunks<I: IntoIterator<Item = Vec<u8>>>(chunks: I) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
            ..Default::default()
        }
    }
}

impl Channel for ScriptedChannel {
    fn connect(&mut self, _addr: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    fn is_connection_pending(&self) -> bool {
        false
    }

    fn finish_connect(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn is_shutdown_in_progress(&self) -> bool {
        false
    }

    fn ready(&self, _interest: Interest) -> BoxFuture<'_, io::Result<Ready>> {
        Box::pin(async { Ok(Ready::READABLE | Ready::WRITABLE) })
    }

    fn do_handshake(&mut self, _ready: Ready) -> io::Result<Handshake> {
        Ok(Handshake::Done)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<Transfer> {
        assert!(!buf.is_empty(), "read called with an empty buffer");
        let Some(chunk) = self.chunks.front_mut() else {
            return Ok(if self.eof {
                Transfer::Eof
            } else {
                Transfer::WouldBlock
            });
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.chunks.pop_front();
        }
        Ok(Transfer::Bytes(n))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<Transfer> {
        if self.write_eof {
            return Ok(Transfer::Eof);
        }
        let n = match self.write_budget.as_mut() {
            Some(0) => return Ok(Transfer::WouldBlock),
            Some(budget) => {
                let n = buf.len().min(*budget);
                *budget -= n;
                n
            }
            None => buf.len(),
        };
        self.written.extend_from_slice(&buf[..n]);
        Ok(Transfer::Bytes(n))
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
