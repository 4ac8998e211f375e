//! Per-user speed allocation
//!
//! A user's aggregate rate ceiling is split equally among their active
//! transfers. The registry pushes each new share into the transfers
//! through [`RateShare`] cells, which running downloads read on every chunk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-task rate for `active_count` transfers sharing `user_ceiling` bytes/sec.
///
/// A ceiling of 0 means unthrottled and stays 0. With no active transfers
/// the result is irrelevant and reported as 0.
pub fn allocate(active_count: usize, user_ceiling: u64) -> u64 {
    if active_count == 0 || user_ceiling == 0 {
        return 0;
    }
    user_ceiling / active_count as u64
}

/// Interpret a signed configured ceiling: zero or negative is unthrottled.
pub fn ceiling_from_signed(value: i64) -> u64 {
    if value <= 0 {
        0
    } else {
        value as u64
    }
}

/// Shared, live bytes-per-second allocation of one transfer (0 = unthrottled)
#[derive(Debug, Clone, Default)]
pub struct RateShare(Arc<AtomicU64>);

impl RateShare {
    pub fn new(bytes_per_second: u64) -> Self {
        Self(Arc::new(AtomicU64::new(bytes_per_second)))
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, bytes_per_second: u64) {
        self.0.store(bytes_per_second, Ordering::Release);
    }
}
