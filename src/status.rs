//! Time-bounded cache of the instrument status word.
//!
//! The heater and gas-flow auto flags share one status field, and pollers
//! read them back to back. Serving both from one `X` round trip keeps the pair
//! consistent and bounds the command traffic to the instrument.
use crate::protocol::StatusWord;
use std::time::{Duration, Instant};

/// Last known good status word and when it was fetched.
///
/// The cache is only filled by a successful fetch. A failed fetch leaves the
/// previous value in place.
#[derive(Debug, Clone)]
pub struct StatusCache {
    value: Option<StatusWord>,
    fetched_at: Option<Instant>,
    max_age: Duration,
}

impl StatusCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            value: None,
            fetched_at: None,
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// The cached word if it was fetched less than `max_age` before `now`.
    pub fn fresh_at(&self, now: Instant) -> Option<StatusWord> {
        let fetched_at = self.fetched_at?;
        if now.saturating_duration_since(fetched_at) < self.max_age {
            self.value
        } else {
            None
        }
    }

    pub fn fresh(&self) -> Option<StatusWord> {
        self.fresh_at(Instant::now())
    }

    /// The cached word regardless of its age.
    pub fn last_known(&self) -> Option<StatusWord> {
        self.value
    }

    pub fn store_at(&mut self, word: StatusWord, now: Instant) {
        self.value = Some(word);
        self.fetched_at = Some(now);
    }

    pub fn store(&mut self, word: StatusWord) {
        self.store_at(word, Instant::now());
    }

    /// Forces the next read to fetch, keeping the last known value.
    pub fn invalidate(&mut self) {
        self.fetched_at = None;
    }

    pub fn clear(&mut self) {
        self.value = None;
        self.fetched_at = None;
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(crate::protocol::STATUS_MAX_AGE)
    }
}
