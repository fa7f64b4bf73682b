//! Time-ordered index of in-flight deadlines.
//!
//! The heap is lazily invalidated: entries are cheap to insert and a popped
//! entry only fires if the owning client still holds that event in-flight
//! with the same dispatch instant. Ack, nak, and redispatch therefore never
//! have to search the heap.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::core::{CorrelationId, EventId};

/// A candidate timeout. The engine validates it against the registry
/// before acting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DueEntry {
    pub correlation_id: CorrelationId,
    pub event_id: EventId,
    /// Dispatch instant the deadline was armed for; a mismatch with the
    /// client's current entry means the event was redispatched since.
    pub dispatched_at: Instant,
}

#[derive(Default)]
pub struct RetryTracker {
    heap: BinaryHeap<Reverse<(Instant, CorrelationId, EventId, Instant)>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(
        &mut self,
        correlation_id: CorrelationId,
        event_id: EventId,
        dispatched_at: Instant,
        deadline: Instant,
    ) {
        self.heap
            .push(Reverse((deadline, correlation_id, event_id, dispatched_at)));
    }

    /// Earliest armed deadline, stale entries included.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, ..))| *deadline)
    }

    /// Pop every entry whose deadline has passed.
    pub fn drain_due(&mut self, now: Instant) -> Vec<DueEntry> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, ..))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, correlation_id, event_id, dispatched_at))) = self.heap.pop()
            else {
                break;
            };
            due.push(DueEntry {
                correlation_id,
                event_id,
                dispatched_at,
            });
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
