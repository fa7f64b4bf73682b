//! Bounded event buffer: retry, history, and live segments.
//!
//! Dispatch drains the retry segment first (lowest event number), then
//! history, then live, so redeliveries and paged-in events always precede
//! the push feed. Intake is deduplicated against the dispatch frontier and
//! the live segment head so the catch-up/live cutover neither gaps nor
//! duplicates.

use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;

use crate::core::{BufferedEvent, EventSource, StreamEvent};

/// Outcome of offering a live event to the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveIntake {
    Buffered,
    /// Live segment at capacity; the reader re-fetches the dropped range.
    Dropped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// History intake exceeded the room the engine sized the read for.
    /// Internal invariant: fatal, the engine stops.
    #[error("history intake of {attempted} events exceeds remaining room {room}")]
    Overflow { attempted: usize, room: usize },
}

pub struct EventBuffer {
    /// Requeued in-flight events, keyed by event number. Always admitted:
    /// dropping one would break at-least-once delivery, and the segment is
    /// bounded by the total allowed outstanding across clients.
    retry: BTreeMap<u64, BufferedEvent>,
    history: VecDeque<BufferedEvent>,
    live: VecDeque<BufferedEvent>,
    parked: Vec<BufferedEvent>,
    /// Highest event number handed to dispatch from the history/live path.
    last_dequeued: Option<u64>,
    live_buffer_size: usize,
    history_buffer_size: usize,
}

impl EventBuffer {
    pub fn new(history_buffer_size: usize, live_buffer_size: usize) -> Self {
        Self {
            retry: BTreeMap::new(),
            history: VecDeque::new(),
            live: VecDeque::new(),
            parked: Vec::new(),
            last_dequeued: None,
            live_buffer_size,
            history_buffer_size,
        }
    }

    /// Append a history batch, skipping events already dispatched and
    /// events the live segment will serve. Returns how many entered.
    pub fn enqueue_history(&mut self, events: Vec<StreamEvent>) -> Result<usize, BufferError> {
        let cutoff = self.first_live_number();
        let mut accepted = 0usize;
        let room = self.history_room();
        for event in events {
            if let Some(last) = self.last_dequeued
                && event.event_number <= last
            {
                continue;
            }
            if let Some(cut) = cutoff
                && event.event_number >= cut
            {
                continue;
            }
            if accepted >= room {
                return Err(BufferError::Overflow {
                    attempted: accepted + 1,
                    room,
                });
            }
            self.history
                .push_back(BufferedEvent::new(event, EventSource::History));
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Offer a live event. Contiguity is the engine's concern; the buffer
    /// only enforces the live cap.
    pub fn enqueue_live(&mut self, event: StreamEvent) -> LiveIntake {
        if self.live.len() >= self.live_buffer_size {
            return LiveIntake::Dropped;
        }
        self.live
            .push_back(BufferedEvent::new(event, EventSource::Live));
        LiveIntake::Buffered
    }

    pub fn peek(&self) -> Option<&BufferedEvent> {
        if let Some((_, buffered)) = self.retry.first_key_value() {
            return Some(buffered);
        }
        self.history.front().or_else(|| self.live.front())
    }

    pub fn pop(&mut self) -> Option<BufferedEvent> {
        let buffered = if let Some((_, buffered)) = self.retry.pop_first() {
            buffered
        } else if let Some(buffered) = self.history.pop_front() {
            buffered
        } else {
            self.live.pop_front()?
        };
        let number = buffered.event_number();
        self.last_dequeued = Some(match self.last_dequeued {
            Some(last) => last.max(number),
            None => number,
        });
        Some(buffered)
    }

    /// Readmit an in-flight event for redelivery, preserving its event
    /// number against other pending entries.
    pub fn requeue(&mut self, buffered: BufferedEvent) {
        self.retry.insert(buffered.event_number(), buffered);
    }

    /// Remove from active dispatch, retain in memory for operator action.
    pub fn park(&mut self, buffered: BufferedEvent) {
        self.parked.push(buffered);
    }

    /// Fold the live segment into the history segment. Used when falling
    /// back from live to catching up: pending live events precede anything
    /// the reader will page in, so they must drain with history priority.
    pub fn demote_live_to_history(&mut self) {
        self.history.append(&mut self.live);
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    pub fn take_parked(&mut self) -> Vec<BufferedEvent> {
        std::mem::take(&mut self.parked)
    }

    /// Free capacity for the next history read. Requeued entries count
    /// against the history segment so reads shrink while redeliveries are
    /// pending.
    pub fn history_room(&self) -> usize {
        self.history_buffer_size
            .saturating_sub(self.history.len() + self.retry.len())
    }

    pub fn first_live_number(&self) -> Option<u64> {
        self.live.front().map(BufferedEvent::event_number)
    }

    pub fn last_live_number(&self) -> Option<u64> {
        self.live.back().map(BufferedEvent::event_number)
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len() + self.retry.len()
    }

    pub fn len(&self) -> usize {
        self.retry.len() + self.history.len() + self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
