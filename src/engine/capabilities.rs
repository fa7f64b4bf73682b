//! Capability seams to the engine's external collaborators.
//!
//! All capabilities are fire-and-forget: the engine never blocks on a
//! collaborator, and completions are posted back by the owner through the
//! engine's `handle_*` entry points, never through synchronous callbacks.

use std::sync::Arc;

use crossbeam::channel::{Sender, TrySendError};

use crate::core::{StreamEvent, SubscriptionId};

/// Pages events out of the stored log.
///
/// At most one `begin_load` is outstanding per subscription; the owner
/// completes it via `handle_read_completed` (events in ascending
/// `event_number` order plus the next number to read, `None` once the live
/// tail is reached) or `handle_read_failed`.
pub trait EventLoader: Send + Sync {
    fn begin_load(
        &self,
        subscription: &SubscriptionId,
        start_event_number: u64,
        count_to_load: usize,
        resolve_link_tos: bool,
    );
}

/// Loads the persisted checkpoint at startup.
///
/// The owner completes the load exactly once via
/// `handle_checkpoint_loaded`.
pub trait CheckpointReader: Send + Sync {
    fn begin_load_state(&self, subscription: &SubscriptionId);
}

/// Persists checkpoint values. Calls are serialized by the engine (at most
/// one outstanding write); the owner reports completion via
/// `handle_checkpoint_written`. Writes are best-effort: a failure is
/// retried with the latest value on the next schedule.
pub trait CheckpointWriter: Send + Sync {
    fn begin_write_state(&self, subscription: &SubscriptionId, checkpoint: u64);
}

/// Delivers a dispatched event to one client. Must not block; delivery
/// acknowledgement comes back as ack/nak messages.
pub trait ReplySink: Send + Sync {
    fn send(&self, event: &StreamEvent, retry_count: u32);
}

/// An event as handed to a client, with its delivery attempt count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchedEvent {
    pub event: StreamEvent,
    pub retry_count: u32,
}

/// Reply sink backed by a bounded crossbeam channel.
///
/// A full or disconnected channel drops the delivery; the in-flight entry
/// stays tracked and the retry loop redelivers after the timeout.
pub struct ChannelReplySink {
    sender: Sender<DispatchedEvent>,
}

impl ChannelReplySink {
    pub fn new(sender: Sender<DispatchedEvent>) -> Arc<Self> {
        Arc::new(Self { sender })
    }
}

impl ReplySink for ChannelReplySink {
    fn send(&self, event: &StreamEvent, retry_count: u32) {
        let dispatched = DispatchedEvent {
            event: event.clone(),
            retry_count,
        };
        match self.sender.try_send(dispatched) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(
                    event_number = event.event_number,
                    "reply channel full, delivery deferred to retry"
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(
                    event_number = event.event_number,
                    "reply channel disconnected"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use uuid::Uuid;

    use super::*;
    use crate::core::{EventId, Position};

    fn event(number: u64) -> StreamEvent {
        StreamEvent::new(
            number,
            EventId::new(Uuid::from_u128(number as u128 + 1)),
            "test",
            Bytes::new(),
            Bytes::new(),
            Position::new(number),
        )
    }

    #[test]
    fn channel_sink_delivers() {
        let (tx, rx) = crossbeam::channel::bounded(2);
        let sink = ChannelReplySink::new(tx);
        sink.send(&event(3), 0);
        let got = rx.try_recv().unwrap();
        assert_eq!(got.event.event_number, 3);
        assert_eq!(got.retry_count, 0);
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let sink = ChannelReplySink::new(tx);
        sink.send(&event(0), 0);
        sink.send(&event(1), 0);
        assert_eq!(rx.try_recv().unwrap().event.event_number, 0);
        assert!(rx.try_recv().is_err());
    }
}
