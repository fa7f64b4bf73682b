//! Fake collaborators for engine scenario tests.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use crossbeam::channel::{Receiver, unbounded};
use uuid::Uuid;

use spool::engine::ChannelReplySink;
use spool::{
    CheckpointReader, CheckpointWriter, ConnectionId, CorrelationId, DispatchedEvent, EventId,
    EventLoader, PersistentSubscription, Position, ReplySink, StreamEvent, StreamId,
    SubscriptionId, SubscriptionParams, SubscriptionSettings,
};

/// Records `begin_load` calls; the test completes them by hand.
#[derive(Default)]
pub struct RecordingLoader {
    calls: Mutex<Vec<(u64, usize)>>,
}

impl EventLoader for RecordingLoader {
    fn begin_load(
        &self,
        _subscription: &SubscriptionId,
        start_event_number: u64,
        count_to_load: usize,
        _resolve_link_tos: bool,
    ) {
        self.calls
            .lock()
            .unwrap()
            .push((start_event_number, count_to_load));
    }
}

impl RecordingLoader {
    pub fn last_call(&self) -> Option<(u64, usize)> {
        self.calls.lock().unwrap().last().copied()
    }
}

/// Records that the load was requested; the test posts the completion.
#[derive(Default)]
pub struct RecordingCheckpointReader {
    requests: Mutex<usize>,
}

impl CheckpointReader for RecordingCheckpointReader {
    fn begin_load_state(&self, _subscription: &SubscriptionId) {
        *self.requests.lock().unwrap() += 1;
    }
}

impl RecordingCheckpointReader {
    pub fn request_count(&self) -> usize {
        *self.requests.lock().unwrap()
    }
}

#[derive(Default)]
pub struct RecordingCheckpointWriter {
    writes: Mutex<Vec<u64>>,
}

impl CheckpointWriter for RecordingCheckpointWriter {
    fn begin_write_state(&self, _subscription: &SubscriptionId, checkpoint: u64) {
        self.writes.lock().unwrap().push(checkpoint);
    }
}

impl RecordingCheckpointWriter {
    pub fn writes(&self) -> Vec<u64> {
        self.writes.lock().unwrap().clone()
    }
}

/// One consumer: a channel-backed sink plus the receiving end.
pub struct TestClient {
    pub correlation_id: CorrelationId,
    pub connection_id: ConnectionId,
    pub sink: Arc<ChannelReplySink>,
    pub inbox: Receiver<DispatchedEvent>,
}

impl TestClient {
    pub fn new(seed: u128) -> Self {
        let (tx, rx) = unbounded();
        Self {
            correlation_id: CorrelationId::new(Uuid::from_u128(seed)),
            connection_id: ConnectionId::new(Uuid::from_u128(seed | 0x1000)),
            sink: ChannelReplySink::new(tx),
            inbox: rx,
        }
    }

    pub fn join(&self, engine: &mut PersistentSubscription, allowed: usize, now: Instant) {
        engine
            .add_client(
                self.connection_id,
                self.correlation_id,
                Arc::clone(&self.sink) as Arc<dyn ReplySink>,
                allowed,
                "127.0.0.1:5000",
                "test-user",
                now,
            )
            .expect("add client");
    }

    pub fn received(&self) -> Vec<DispatchedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inbox.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn received_numbers(&self) -> Vec<u64> {
        self.received()
            .into_iter()
            .map(|d| d.event.event_number)
            .collect()
    }
}

pub fn event(number: u64) -> StreamEvent {
    StreamEvent::new(
        number,
        EventId::new(Uuid::from_u128(0xE000 + number as u128)),
        "order-placed",
        Bytes::from_static(b"{}"),
        Bytes::new(),
        Position::new(number),
    )
}

pub struct EngineFixture {
    pub engine: PersistentSubscription,
    pub loader: Arc<RecordingLoader>,
    pub checkpoint_reader: Arc<RecordingCheckpointReader>,
    pub checkpoint_writer: Arc<RecordingCheckpointWriter>,
}

impl EngineFixture {
    pub fn new(settings: SubscriptionSettings) -> Self {
        Self::named("streamName", "groupName", settings)
    }

    pub fn named(stream: &str, group: &str, settings: SubscriptionSettings) -> Self {
        let loader = Arc::new(RecordingLoader::default());
        let checkpoint_reader = Arc::new(RecordingCheckpointReader::default());
        let checkpoint_writer = Arc::new(RecordingCheckpointWriter::default());
        let engine = PersistentSubscription::new(SubscriptionParams {
            stream: StreamId::new(stream).expect("stream id"),
            group: spool::GroupName::new(group).expect("group name"),
            settings,
            loader: Arc::clone(&loader) as Arc<dyn EventLoader>,
            checkpoint_reader: Arc::clone(&checkpoint_reader) as Arc<dyn CheckpointReader>,
            checkpoint_writer: Arc::clone(&checkpoint_writer) as Arc<dyn CheckpointWriter>,
        })
        .expect("engine");
        Self {
            engine,
            loader,
            checkpoint_reader,
            checkpoint_writer,
        }
    }
}
