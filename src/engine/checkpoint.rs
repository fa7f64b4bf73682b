//! Contiguous-ack checkpoint tracking and durable-write scheduling.
//!
//! `last_acked` is the highest event number below which everything has
//! been acknowledged; acks above a gap wait in a set until the gap fills.
//! Durable writes are debounced (every `interval` acks or after
//! `max_delay` of unpersisted progress) and serialized: one write
//! outstanding, newer values supersede.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

pub struct Checkpointer {
    last_acked: Option<u64>,
    /// Acked numbers above `last_acked`, pending contiguity.
    acked_above: BTreeSet<u64>,
    /// Where contiguity begins while no ack has landed yet.
    start_number: u64,
    interval: u64,
    max_delay: Duration,
    persisted: Option<u64>,
    in_flight: Option<u64>,
    dirty_since: Option<Instant>,
}

impl Checkpointer {
    pub fn new(interval: u64, max_delay: Duration) -> Self {
        Self {
            last_acked: None,
            acked_above: BTreeSet::new(),
            start_number: 0,
            interval,
            max_delay,
            persisted: None,
            in_flight: None,
            dirty_since: None,
        }
    }

    /// Adopt the durably-loaded checkpoint (or the configured start when
    /// none was persisted).
    pub fn loaded(&mut self, checkpoint: Option<u64>, start_number: u64) {
        self.last_acked = checkpoint;
        self.persisted = checkpoint;
        self.start_number = start_number;
    }

    /// Move the contiguity origin; used when the start position is only
    /// discovered at runtime (start-from-current pins on the first live
    /// event).
    pub fn set_start_number(&mut self, start_number: u64) {
        self.start_number = start_number;
    }

    pub fn last_acked(&self) -> Option<u64> {
        self.last_acked
    }

    pub fn persisted(&self) -> Option<u64> {
        self.persisted
    }

    /// Record an acknowledged event number. Returns how far `last_acked`
    /// advanced (0 for duplicates and acks above a gap).
    pub fn ack(&mut self, event_number: u64, now: Instant) -> u64 {
        if let Some(last) = self.last_acked
            && event_number <= last
        {
            return 0;
        }
        if event_number < self.start_number {
            return 0;
        }
        self.acked_above.insert(event_number);

        let mut advanced = 0u64;
        loop {
            let expected = match self.last_acked {
                Some(last) => last + 1,
                None => self.start_number,
            };
            if !self.acked_above.remove(&expected) {
                break;
            }
            self.last_acked = Some(expected);
            advanced += 1;
        }

        if advanced > 0 && self.last_acked > self.persisted && self.dirty_since.is_none() {
            self.dirty_since = Some(now);
        }
        advanced
    }

    /// Value to write now, honoring the debounce and the single
    /// outstanding write.
    pub fn should_write(&self, now: Instant) -> Option<u64> {
        if self.in_flight.is_some() {
            return None;
        }
        let value = self.last_acked?;
        if Some(value) <= self.persisted {
            return None;
        }
        let unpersisted = match self.persisted {
            Some(persisted) => value - persisted,
            None => value - self.start_number + 1,
        };
        if unpersisted >= self.interval {
            return Some(value);
        }
        match self.dirty_since {
            Some(since) if now.duration_since(since) >= self.max_delay => Some(value),
            _ => None,
        }
    }

    pub fn write_started(&mut self, value: u64) {
        self.in_flight = Some(value);
        self.dirty_since = None;
    }

    /// Completion of the outstanding write. On failure the progress stays
    /// dirty and the delay window restarts, which spaces retries out.
    pub fn write_completed(&mut self, ok: bool, now: Instant) {
        let value = self.in_flight.take();
        if ok && value > self.persisted {
            self.persisted = value;
        }
        if self.last_acked > self.persisted && self.dirty_since.is_none() {
            self.dirty_since = Some(now);
        }
    }

    pub fn write_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Latest unpersisted value, ignoring the debounce; for the final
    /// write attempt at shutdown.
    pub fn unpersisted_value(&self) -> Option<u64> {
        let value = self.last_acked?;
        if Some(value) > self.persisted {
            Some(value)
        } else {
            None
        }
    }
}
