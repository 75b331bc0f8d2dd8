//! Transaction id generation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic XID counter, wrapping on 32-bit overflow.
///
/// Uniqueness only matters among requests in flight to one destination; a
/// single counter per client covers every destination.
#[derive(Debug)]
pub struct XidGenerator {
    next: AtomicU32,
}

impl XidGenerator {
    /// Counter seeded from the clock and process id.
    pub fn new() -> Self {
        Self::starting_at(seed())
    }

    /// Counter whose first id is `first`.
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Take the next id.
    #[inline]
    pub fn next_xid(&self) -> u32 {
        // fetch_add wraps on overflow
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for XidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Pseudo-random seed in `1..=1_000_000`.
fn seed() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    let mixed = nanos.wrapping_mul(0x517c_c1b7_2722_0a95) ^ pid;
    (mixed % 1_000_000) as u32 + 1
}
