//! Connected clients of a group and their in-flight tables.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::core::{BufferedEvent, ConnectionId, CorrelationId, EventId};
use crate::engine::capabilities::ReplySink;

/// An event dispatched to a client whose ack, nak, or timeout is pending.
pub struct InFlightEntry {
    pub event: BufferedEvent,
    pub dispatched_at: Instant,
}

/// One member of the consumer group.
pub struct Client {
    pub connection_id: ConnectionId,
    pub correlation_id: CorrelationId,
    reply_to: Arc<dyn ReplySink>,
    pub allowed_outstanding: usize,
    pub from: String,
    pub user: String,
    in_flight: HashMap<EventId, InFlightEntry>,
}

impl Client {
    pub fn free_capacity(&self) -> usize {
        self.allowed_outstanding.saturating_sub(self.in_flight.len())
    }

    pub fn has_capacity(&self) -> bool {
        self.free_capacity() > 0
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_entry(&self, event_id: &EventId) -> Option<&InFlightEntry> {
        self.in_flight.get(event_id)
    }

    /// Record the pairing and deliver to the client's sink. A client at
    /// capacity refuses and hands the event back.
    pub fn dispatch(&mut self, buffered: BufferedEvent, now: Instant) -> Result<(), BufferedEvent> {
        if !self.has_capacity() {
            return Err(buffered);
        }
        self.reply_to.send(&buffered.event, buffered.retry_count);
        self.in_flight.insert(
            buffered.event_id(),
            InFlightEntry {
                event: buffered,
                dispatched_at: now,
            },
        );
        Ok(())
    }

    /// Remove a completed (acked, nak'd, or timed-out) in-flight entry.
    pub fn complete(&mut self, event_id: &EventId) -> Option<InFlightEntry> {
        self.in_flight.remove(event_id)
    }

    /// Drain every in-flight event, as on disconnect.
    pub fn drain_in_flight(&mut self) -> Vec<BufferedEvent> {
        self.in_flight
            .drain()
            .map(|(_, entry)| entry.event)
            .collect()
    }
}

/// Ordered set of clients sharing one subscription.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Vec<Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a client in insertion order. Idempotent by
    /// `(connection_id, correlation_id)`: a repeated join is a no-op and
    /// returns false.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        connection_id: ConnectionId,
        correlation_id: CorrelationId,
        reply_to: Arc<dyn ReplySink>,
        allowed_outstanding: usize,
        from: impl Into<String>,
        user: impl Into<String>,
    ) -> bool {
        let already = self.clients.iter().any(|client| {
            client.connection_id == connection_id && client.correlation_id == correlation_id
        });
        if already {
            return false;
        }
        self.clients.push(Client {
            connection_id,
            correlation_id,
            reply_to,
            allowed_outstanding,
            from: from.into(),
            user: user.into(),
            in_flight: HashMap::new(),
        });
        true
    }

    /// Remove one client, returning its in-flight events for requeue.
    pub fn remove(&mut self, correlation_id: CorrelationId) -> Option<Vec<BufferedEvent>> {
        let index = self
            .clients
            .iter()
            .position(|client| client.correlation_id == correlation_id)?;
        let mut client = self.clients.remove(index);
        Some(client.drain_in_flight())
    }

    /// Remove every membership carried by one connection (a connection may
    /// join a group more than once), returning all in-flight events.
    pub fn remove_by_connection(&mut self, connection_id: ConnectionId) -> Vec<BufferedEvent> {
        let mut recovered = Vec::new();
        let mut index = 0;
        while index < self.clients.len() {
            if self.clients[index].connection_id == connection_id {
                let mut client = self.clients.remove(index);
                recovered.append(&mut client.drain_in_flight());
            } else {
                index += 1;
            }
        }
        recovered
    }

    pub fn get_mut(&mut self, correlation_id: CorrelationId) -> Option<&mut Client> {
        self.clients
            .iter_mut()
            .find(|client| client.correlation_id == correlation_id)
    }

    pub fn at(&self, index: usize) -> Option<&Client> {
        self.clients.get(index)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut Client> {
        self.clients.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn any_capacity(&self) -> bool {
        self.clients.iter().any(Client::has_capacity)
    }

    pub fn total_in_flight(&self) -> usize {
        self.clients.iter().map(Client::in_flight_len).sum()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use uuid::Uuid;

    use super::*;
    use crate::core::{EventSource, EventId, Position, StreamEvent};

    struct NullSink;

    impl ReplySink for NullSink {
        fn send(&self, _event: &StreamEvent, _retry_count: u32) {}
    }

    fn buffered(number: u64) -> BufferedEvent {
        BufferedEvent::new(
            StreamEvent::new(
                number,
                EventId::new(Uuid::from_u128(number as u128 + 1)),
                "test",
                Bytes::new(),
                Bytes::new(),
                Position::new(number),
            ),
            EventSource::History,
        )
    }

    fn connection(seed: u128) -> ConnectionId {
        ConnectionId::new(Uuid::from_u128(seed))
    }

    fn correlation(seed: u128) -> CorrelationId {
        CorrelationId::new(Uuid::from_u128(seed))
    }

    fn registry_with_one(allowed: usize) -> (ClientRegistry, CorrelationId) {
        let mut registry = ClientRegistry::new();
        let corr = correlation(1);
        registry.add(connection(1), corr, Arc::new(NullSink), allowed, "host", "user");
        (registry, corr)
    }

    #[test]
    fn add_is_idempotent_by_connection_and_correlation() {
        let mut registry = ClientRegistry::new();
        let sink: Arc<dyn ReplySink> = Arc::new(NullSink);
        assert!(registry.add(connection(1), correlation(1), Arc::clone(&sink), 10, "a", "u"));
        assert!(!registry.add(connection(1), correlation(1), Arc::clone(&sink), 10, "a", "u"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn dispatch_respects_allowed_outstanding() {
        let (mut registry, corr) = registry_with_one(2);
        let now = Instant::now();
        let client = registry.get_mut(corr).unwrap();

        assert!(client.dispatch(buffered(0), now).is_ok());
        assert!(client.dispatch(buffered(1), now).is_ok());
        let rejected = client.dispatch(buffered(2), now).unwrap_err();
        assert_eq!(rejected.event_number(), 2);
        assert_eq!(client.in_flight_len(), 2);
    }

    #[test]
    fn remove_returns_in_flight_for_requeue() {
        let (mut registry, corr) = registry_with_one(5);
        let now = Instant::now();
        let client = registry.get_mut(corr).unwrap();
        client.dispatch(buffered(0), now).unwrap();
        client.dispatch(buffered(1), now).unwrap();

        let recovered = registry.remove(corr).unwrap();
        assert_eq!(recovered.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.remove(corr).is_none());
    }

    #[test]
    fn remove_by_connection_takes_all_memberships() {
        let mut registry = ClientRegistry::new();
        let sink: Arc<dyn ReplySink> = Arc::new(NullSink);
        registry.add(connection(1), correlation(1), Arc::clone(&sink), 5, "a", "u");
        registry.add(connection(1), correlation(2), Arc::clone(&sink), 5, "a", "u");
        registry.add(connection(2), correlation(3), Arc::clone(&sink), 5, "b", "u");

        let now = Instant::now();
        registry.get_mut(correlation(1)).unwrap().dispatch(buffered(0), now).unwrap();
        registry.get_mut(correlation(2)).unwrap().dispatch(buffered(1), now).unwrap();

        let recovered = registry.remove_by_connection(connection(1));
        assert_eq!(recovered.len(), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.at(0).unwrap().correlation_id, correlation(3));
    }

    #[test]
    fn complete_frees_capacity() {
        let (mut registry, corr) = registry_with_one(1);
        let now = Instant::now();
        let client = registry.get_mut(corr).unwrap();
        let event = buffered(0);
        let id = event.event_id();
        client.dispatch(event, now).unwrap();
        assert!(!client.has_capacity());

        assert!(client.complete(&id).is_some());
        assert!(client.complete(&id).is_none());
        assert!(client.has_capacity());
    }
}
