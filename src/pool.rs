//! Reusable byte buffers for response fragments.
//!
//! Fragment bodies are acquired from a [`BufferPool`] with the exact length
//! announced by the fragment header and handed back exactly once. The
//! [`PooledBuffer`] handle owns the buffer and releases it on drop, so every
//! code path (delivery, unknown XID, connection closed mid-assembly) returns
//! the buffer without explicit bookkeeping.
//!
//! # Design
//!
//! The default [`SizeClassPool`] keeps one free list per exact length:
//! - At most `max_per_class` buffers are retained per length
//! - Buffers larger than `max_pooled_size` are never retained
//! - One `parking_lot::Mutex` guards all free lists

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Default number of retained buffers per length.
pub const DEFAULT_MAX_PER_CLASS: usize = 16;

/// Default largest buffer length that is retained for reuse (1 MB).
pub const DEFAULT_MAX_POOLED_SIZE: usize = 1024 * 1024;

/// Acquire/release capability for fragment buffers.
pub trait BufferPool: Send + Sync {
    /// Hand out a buffer whose length is exactly `size`.
    ///
    /// The contents are unspecified.
    fn acquire(&self, size: usize) -> BytesMut;

    /// Take a buffer back. Called exactly once per acquired buffer.
    fn release(&self, buf: BytesMut);
}

/// Pool with one free list per exact buffer length.
pub struct SizeClassPool {
    classes: Mutex<HashMap<usize, Vec<BytesMut>>>,
    max_per_class: usize,
    max_pooled_size: usize,
}

impl SizeClassPool {
    /// Create a pool with default limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_PER_CLASS, DEFAULT_MAX_POOLED_SIZE)
    }

    /// Create a pool with custom retention limits.
    pub fn with_limits(max_per_class: usize, max_pooled_size: usize) -> Self {
        Self {
            classes: Mutex::new(HashMap::new()),
            max_per_class,
            max_pooled_size,
        }
    }

    /// Number of buffers currently retained.
    pub fn pooled_count(&self) -> usize {
        self.classes.lock().values().map(Vec::len).sum()
    }
}

impl Default for SizeClassPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SizeClassPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeClassPool")
            .field("pooled", &self.pooled_count())
            .field("max_per_class", &self.max_per_class)
            .finish()
    }
}

impl BufferPool for SizeClassPool {
    fn acquire(&self, size: usize) -> BytesMut {
        if let Some(buf) = self
            .classes
            .lock()
            .get_mut(&size)
            .and_then(|list| list.pop())
        {
            return buf;
        }
        BytesMut::zeroed(size)
    }

    fn release(&self, buf: BytesMut) {
        let size = buf.len();
        if size == 0 || size > self.max_pooled_size {
            return;
        }
        let mut classes = self.classes.lock();
        let list = classes.entry(size).or_default();
        if list.len() < self.max_per_class {
            list.push(buf);
        }
    }
}

/// A buffer borrowed from a pool, released when dropped.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<dyn BufferPool>,
}

impl PooledBuffer {
    /// Acquire a buffer of exactly `size` bytes from `pool`.
    pub fn acquire(pool: &Arc<dyn BufferPool>, size: usize) -> Self {
        let buf = pool.acquire(size);
        debug_assert_eq!(buf.len(), size, "pool returned a buffer of the wrong length");
        Self {
            buf: Some(buf),
            pool: Arc::clone(pool),
        }
    }

    fn inner(&self) -> &BytesMut {
        // Only `Drop` takes the buffer out.
        match &self.buf {
            Some(buf) => buf,
            None => unreachable!("pooled buffer used after release"),
        }
    }

    fn inner_mut(&mut self) -> &mut BytesMut {
        match &mut self.buf {
            Some(buf) => buf,
            None => unreachable!("pooled buffer used after release"),
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.inner()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.inner_mut()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
