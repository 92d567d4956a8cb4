//! Correlation id generation.
//!
//! Ids are seeded from the wall clock in milliseconds, so they read like
//! submission timestamps on the wire, but each id is strictly greater than the
//! previous one. Two requests issued within the same millisecond, from any
//! thread, still get distinct ids.

use std::sync::atomic::{AtomicU64, Ordering};

use frames::CorrelationId;

#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id: `max(now_ms, last + 1)`.
    pub fn next(&self) -> CorrelationId {
        let now = u64::try_from(frames::now_ms()).unwrap_or(0);
        self.next_at(now)
    }

    fn next_at(&self, now: u64) -> CorrelationId {
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return CorrelationId(candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
#[path = "correlation_test.rs"]
mod tests;
