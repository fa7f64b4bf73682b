//! Bookkeeping for paged history reads.
//!
//! The loader itself is an external capability; this tracks the read
//! frontier, the single outstanding read, and the backoff after a failed
//! read.

use std::time::{Duration, Instant};

pub struct HistoryReader {
    next_read_from: u64,
    batch_size: usize,
    backoff: Duration,
    outstanding: Option<u64>,
    backoff_until: Option<Instant>,
}

impl HistoryReader {
    pub fn new(batch_size: usize, backoff: Duration) -> Self {
        Self {
            next_read_from: 0,
            batch_size,
            backoff,
            outstanding: None,
            backoff_until: None,
        }
    }

    /// Reposition the frontier, e.g. after the checkpoint loads or when
    /// falling back from live.
    pub fn start_at(&mut self, from: u64) {
        self.next_read_from = from;
    }

    pub fn next_read_from(&self) -> u64 {
        self.next_read_from
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Claim the next read if none is outstanding, there is buffer room,
    /// and any failure backoff has lapsed. Returns `(start, count)` for
    /// the loader call.
    pub fn begin(&mut self, room: usize, now: Instant) -> Option<(u64, usize)> {
        if self.outstanding.is_some() || room == 0 {
            return None;
        }
        if let Some(until) = self.backoff_until {
            if now < until {
                return None;
            }
            self.backoff_until = None;
        }
        let start = self.next_read_from;
        self.outstanding = Some(start);
        Some((start, self.batch_size.min(room)))
    }

    /// The outstanding read finished; `next` is the loader's next number
    /// to read from (`None` once the live tail was reached).
    pub fn completed(&mut self, next: Option<u64>) {
        self.outstanding = None;
        if let Some(next) = next {
            self.next_read_from = next;
        }
    }

    /// The outstanding read failed; retry no earlier than the backoff.
    pub fn failed(&mut self, now: Instant) {
        self.outstanding = None;
        self.backoff_until = Some(now + self.backoff);
    }
}
