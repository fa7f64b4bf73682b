//! Stream event records and their buffered form.

use bytes::Bytes;

use super::identity::EventId;

/// Opaque position token identifying a point in the live push feed.
///
/// Positions are only compared for ordering; the log assigns them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u64);

impl Position {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Debug for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Position({})", self.0)
    }
}

/// An immutable event read from the log or pushed from the live tail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEvent {
    /// Dense non-negative sequence number within the stream.
    pub event_number: u64,
    pub event_id: EventId,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    pub position: Position,
}

impl StreamEvent {
    pub fn new(
        event_number: u64,
        event_id: EventId,
        event_type: impl Into<String>,
        data: Bytes,
        metadata: Bytes,
        position: Position,
    ) -> Self {
        Self {
            event_number,
            event_id,
            event_type: event_type.into(),
            data,
            metadata,
            position,
        }
    }
}

/// Where a buffered event came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSource {
    /// Paged in from the stored log.
    History,
    /// Pushed from the current-tail feed.
    Live,
}

/// An event held by the subscription between intake and acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferedEvent {
    pub event: StreamEvent,
    pub source: EventSource,
    /// Delivery attempts that ended in timeout or nak. Exceeding the
    /// configured retry cap parks the event.
    pub retry_count: u32,
}

impl BufferedEvent {
    pub fn new(event: StreamEvent, source: EventSource) -> Self {
        Self {
            event,
            source,
            retry_count: 0,
        }
    }

    pub fn event_number(&self) -> u64 {
        self.event.event_number
    }

    pub fn event_id(&self) -> EventId {
        self.event.event_id
    }
}
