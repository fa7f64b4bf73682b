//! The persistent subscription engine.
//!
//! A single-owner state machine: the caller serializes every entry point,
//! collaborator completions re-enter through the `handle_*` methods, and
//! all time-dependent operations take an explicit `now`. The engine owns
//! the buffer, the client registry, the retry index, and checkpoint
//! progress; collaborators are reached only through capability handles.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::core::{
    BufferedEvent, ConnectionId, CoreError, CorrelationId, EventId, GroupName, InvalidSetting,
    NakAction, StartFrom, StreamEvent, StreamId, SubscriptionId, SubscriptionSettings,
};
use crate::engine::buffer::{BufferError, EventBuffer, LiveIntake};
use crate::engine::capabilities::{CheckpointReader, CheckpointWriter, EventLoader, ReplySink};
use crate::engine::checkpoint::Checkpointer;
use crate::engine::clients::ClientRegistry;
use crate::engine::dispatch::DispatchCursor;
use crate::engine::reader::HistoryReader;
use crate::engine::retries::RetryTracker;
use crate::engine::stats::{SubscriptionStats, SubscriptionStatistics};

/// Lifecycle of the two-phase cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for the persisted checkpoint to load.
    Initializing,
    /// Paging history out of the log until it reaches the live tail.
    CatchingUp,
    /// Fed by the live push stream.
    Live,
    Stopped,
}

/// Why a live event was not buffered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveDropReason {
    /// Checkpoint not loaded yet; the reader will page the event in.
    NotReady,
    Stopped,
    /// At or below an already-buffered or dispatched number.
    Duplicate,
    /// Not contiguous; the engine falls back to (or stays in) catch-up
    /// and re-fetches the range.
    Gap,
    /// Live segment at capacity; same recovery as a gap.
    Overflow,
}

/// Outcome of offering a live event to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveDecision {
    Accepted,
    Dropped(LiveDropReason),
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription {subscription_id} is stopped")]
    Stopped { subscription_id: SubscriptionId },
    /// Ack or nak for a correlation id not in the group. Informational:
    /// state is untouched.
    #[error("unknown client {correlation_id} on {subscription_id}")]
    ClientUnknown {
        subscription_id: SubscriptionId,
        correlation_id: CorrelationId,
    },
    /// Ack or nak named an event id the client does not hold in flight.
    /// Informational: every event id that was in flight has still been
    /// processed.
    #[error("event {event_id} not in flight for client {correlation_id}")]
    EventUnknown {
        correlation_id: CorrelationId,
        event_id: EventId,
    },
    #[error(transparent)]
    InvalidArgument(#[from] CoreError),
    /// Internal invariant violation; the engine has already stopped.
    #[error(transparent)]
    BufferOverflow(#[from] BufferError),
}

/// Everything the engine needs at construction. Capability handles are
/// non-null by construction; identity and settings are validated before
/// the engine starts.
pub struct SubscriptionParams {
    pub stream: StreamId,
    pub group: GroupName,
    pub settings: SubscriptionSettings,
    pub loader: Arc<dyn EventLoader>,
    pub checkpoint_reader: Arc<dyn CheckpointReader>,
    pub checkpoint_writer: Arc<dyn CheckpointWriter>,
}

pub struct PersistentSubscription {
    subscription_id: SubscriptionId,
    stream: StreamId,
    group: GroupName,
    settings: SubscriptionSettings,
    state: SubscriptionState,
    buffer: EventBuffer,
    registry: ClientRegistry,
    cursor: DispatchCursor,
    retries: RetryTracker,
    checkpoint: Checkpointer,
    reader: HistoryReader,
    stats: SubscriptionStats,
    loader: Arc<dyn EventLoader>,
    checkpoint_writer: Arc<dyn CheckpointWriter>,
    /// Next live event number the push feed owes us; unpinned until the
    /// first accepted event when starting from the current tail.
    expected_next: Option<u64>,
}

impl PersistentSubscription {
    /// Validates the parameters, then immediately asks the checkpoint
    /// reader for the persisted position. The engine stays `Initializing`
    /// until `handle_checkpoint_loaded` arrives.
    pub fn new(params: SubscriptionParams) -> Result<Self, SubscriptionError> {
        params.settings.validate()?;
        let subscription_id = SubscriptionId::new(&params.stream, &params.group);
        params.checkpoint_reader.begin_load_state(&subscription_id);

        Ok(Self {
            subscription_id,
            stream: params.stream,
            group: params.group,
            buffer: EventBuffer::new(
                params.settings.history_buffer_size,
                params.settings.live_buffer_size,
            ),
            registry: ClientRegistry::new(),
            cursor: DispatchCursor::new(params.settings.policy),
            retries: RetryTracker::new(),
            checkpoint: Checkpointer::new(
                params.settings.checkpoint_interval,
                params.settings.checkpoint_max_delay,
            ),
            reader: HistoryReader::new(
                params.settings.read_batch_size,
                params.settings.read_backoff,
            ),
            stats: SubscriptionStats::new(params.settings.latency_statistics),
            state: SubscriptionState::Initializing,
            loader: params.loader,
            checkpoint_writer: params.checkpoint_writer,
            expected_next: None,
            settings: params.settings,
        })
    }

    pub fn subscription_id(&self) -> &SubscriptionId {
        &self.subscription_id
    }

    pub fn event_stream_id(&self) -> &StreamId {
        &self.stream
    }

    pub fn group_name(&self) -> &GroupName {
        &self.group
    }

    pub fn has_clients(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn last_acked(&self) -> Option<u64> {
        self.checkpoint.last_acked()
    }

    /// Register a client and trigger dispatch. Idempotent by
    /// `(connection_id, correlation_id)`; returns whether the client was
    /// newly added.
    #[allow(clippy::too_many_arguments)]
    pub fn add_client(
        &mut self,
        connection_id: ConnectionId,
        correlation_id: CorrelationId,
        reply_to: Arc<dyn ReplySink>,
        allowed_outstanding: usize,
        from: impl Into<String>,
        user: impl Into<String>,
        now: Instant,
    ) -> Result<bool, SubscriptionError> {
        if self.state == SubscriptionState::Stopped {
            return Err(SubscriptionError::Stopped {
                subscription_id: self.subscription_id.clone(),
            });
        }
        if allowed_outstanding == 0 {
            return Err(CoreError::from(InvalidSetting {
                field: "allowed_outstanding",
                reason: "must be > 0".to_string(),
            })
            .into());
        }
        let added = self.registry.add(
            connection_id,
            correlation_id,
            reply_to,
            allowed_outstanding,
            from,
            user,
        );
        self.try_dispatch(now);
        Ok(added)
    }

    /// Deregister one client; its in-flight events are requeued as if
    /// nak'd for retry.
    pub fn remove_client(&mut self, correlation_id: CorrelationId, now: Instant) {
        let index = self
            .registry
            .iter()
            .position(|client| client.correlation_id == correlation_id);
        let Some(index) = index else {
            tracing::warn!(
                subscription = %self.subscription_id,
                correlation = %correlation_id,
                "remove for unknown client"
            );
            return;
        };
        let recovered = self.registry.remove(correlation_id).unwrap_or_default();
        self.cursor.client_removed(index, self.registry.len());
        self.readmit(recovered);
        self.try_dispatch(now);
    }

    /// Deregister every membership of a dropped connection.
    pub fn remove_client_by_connection(&mut self, connection_id: ConnectionId, now: Instant) {
        let recovered = self.registry.remove_by_connection(connection_id);
        // Indices shifted arbitrarily; clamp rather than chase them.
        self.cursor.client_removed(0, self.registry.len());
        self.readmit(recovered);
        self.try_dispatch(now);
    }

    /// Positive acknowledgement: removes in-flight entries and feeds the
    /// checkpointer. Unknown correlation or event ids are logged and
    /// reported back as information; state is never corrupted and every
    /// known event id is still processed.
    pub fn ack(
        &mut self,
        correlation_id: CorrelationId,
        event_ids: &[EventId],
        now: Instant,
    ) -> Result<(), SubscriptionError> {
        if self.state == SubscriptionState::Stopped {
            return Ok(());
        }
        let Some(client) = self.registry.get_mut(correlation_id) else {
            tracing::warn!(
                subscription = %self.subscription_id,
                correlation = %correlation_id,
                "ack from unknown client"
            );
            return Err(SubscriptionError::ClientUnknown {
                subscription_id: self.subscription_id.clone(),
                correlation_id,
            });
        };
        let mut acked = Vec::new();
        let mut unknown = None;
        for event_id in event_ids {
            match client.complete(event_id) {
                Some(entry) => acked.push(entry),
                None => {
                    tracing::debug!(
                        subscription = %self.subscription_id,
                        event = %event_id,
                        "ack for event not in flight"
                    );
                    unknown.get_or_insert(*event_id);
                }
            }
        }
        for entry in acked {
            self.stats.record_ack(entry.dispatched_at, now);
            self.checkpoint.ack(entry.event.event_number(), now);
        }
        self.maybe_write_checkpoint(now);
        self.try_dispatch(now);
        match unknown {
            Some(event_id) => Err(SubscriptionError::EventUnknown {
                correlation_id,
                event_id,
            }),
            None => Ok(()),
        }
    }

    /// Negative acknowledgement with an explicit disposition. Unknown ids
    /// are reported the same way as for `ack`.
    pub fn nak(
        &mut self,
        correlation_id: CorrelationId,
        event_ids: &[EventId],
        action: NakAction,
        now: Instant,
    ) -> Result<(), SubscriptionError> {
        if self.state == SubscriptionState::Stopped {
            return Ok(());
        }
        let Some(client) = self.registry.get_mut(correlation_id) else {
            tracing::warn!(
                subscription = %self.subscription_id,
                correlation = %correlation_id,
                "nak from unknown client"
            );
            return Err(SubscriptionError::ClientUnknown {
                subscription_id: self.subscription_id.clone(),
                correlation_id,
            });
        };
        let mut completed = Vec::new();
        let mut unknown = None;
        for event_id in event_ids {
            match client.complete(event_id) {
                Some(entry) => completed.push(entry),
                None => {
                    tracing::debug!(
                        subscription = %self.subscription_id,
                        event = %event_id,
                        "nak for event not in flight"
                    );
                    unknown.get_or_insert(*event_id);
                }
            }
        }
        for entry in completed {
            match action {
                NakAction::Park => {
                    self.stats.parked += 1;
                    self.buffer.park(entry.event);
                }
                NakAction::Skip => {
                    self.stats.skipped += 1;
                    self.checkpoint.ack(entry.event.event_number(), now);
                }
                NakAction::Retry => {
                    self.retry_or_park(entry.event);
                }
            }
        }
        self.maybe_write_checkpoint(now);
        self.try_dispatch(now);
        match unknown {
            Some(event_id) => Err(SubscriptionError::EventUnknown {
                correlation_id,
                event_id,
            }),
            None => Ok(()),
        }
    }

    /// Offer an event from the live push feed.
    pub fn notify_live_event(&mut self, event: StreamEvent, now: Instant) -> LiveDecision {
        match self.state {
            SubscriptionState::Stopped => LiveDecision::Dropped(LiveDropReason::Stopped),
            SubscriptionState::Initializing => {
                LiveDecision::Dropped(LiveDropReason::NotReady)
            }
            SubscriptionState::CatchingUp => self.live_while_catching_up(event, now),
            SubscriptionState::Live => self.live_while_live(event, now),
        }
    }

    /// Completion of the outstanding history read. `next_read` is the
    /// loader's next number to read from, `None` once the live tail was
    /// reached.
    pub fn handle_read_completed(
        &mut self,
        events: Vec<StreamEvent>,
        next_read: Option<u64>,
        now: Instant,
    ) -> Result<(), SubscriptionError> {
        if self.state != SubscriptionState::CatchingUp || !self.reader.has_outstanding() {
            tracing::debug!(
                subscription = %self.subscription_id,
                state = ?self.state,
                "ignoring stale read completion"
            );
            return Ok(());
        }

        let past_batch = events.last().map(|event| event.event_number + 1);
        if let Err(overflow) = self.buffer.enqueue_history(events) {
            tracing::error!(
                subscription = %self.subscription_id,
                error = %overflow,
                "history intake overflowed the buffer"
            );
            self.state = SubscriptionState::Stopped;
            return Err(overflow.into());
        }
        self.reader.completed(next_read.or(past_batch));

        let caught_up_to_live = self
            .buffer
            .first_live_number()
            .is_some_and(|first| self.reader.next_read_from() >= first);
        if next_read.is_none() || caught_up_to_live {
            self.go_live();
        } else {
            self.maybe_read(now);
        }
        self.try_dispatch(now);
        Ok(())
    }

    /// The outstanding history read failed; stay catching up and retry
    /// after the configured backoff.
    pub fn handle_read_failed(&mut self, now: Instant) {
        if self.state != SubscriptionState::CatchingUp {
            return;
        }
        tracing::warn!(
            subscription = %self.subscription_id,
            from = self.reader.next_read_from(),
            "history read failed, backing off"
        );
        self.reader.failed(now);
    }

    /// Completion of the persisted-checkpoint load; arrives exactly once.
    pub fn handle_checkpoint_loaded(&mut self, checkpoint: Option<u64>, now: Instant) {
        if self.state != SubscriptionState::Initializing {
            tracing::debug!(
                subscription = %self.subscription_id,
                state = ?self.state,
                "ignoring checkpoint load in non-initializing state"
            );
            return;
        }
        let start = match (checkpoint, self.settings.start_from) {
            (Some(last_acked), _) => {
                self.checkpoint.loaded(Some(last_acked), 0);
                Some(last_acked + 1)
            }
            (None, StartFrom::Beginning) => {
                self.checkpoint.loaded(None, 0);
                Some(0)
            }
            (None, StartFrom::Explicit(number)) => {
                self.checkpoint.loaded(None, number);
                Some(number)
            }
            (None, StartFrom::Current) => {
                self.checkpoint.loaded(None, 0);
                None
            }
        };
        match start {
            Some(from) => {
                self.reader.start_at(from);
                self.state = SubscriptionState::CatchingUp;
                self.maybe_read(now);
            }
            None => {
                // Straight to the tail; the first accepted live event pins
                // the expected number and the checkpoint origin.
                self.state = SubscriptionState::Live;
                self.expected_next = None;
            }
        }
        self.try_dispatch(now);
    }

    /// Completion of the outstanding checkpoint write.
    pub fn handle_checkpoint_written(&mut self, ok: bool, now: Instant) {
        if !ok {
            tracing::warn!(
                subscription = %self.subscription_id,
                "checkpoint write failed, will retry with latest value"
            );
        }
        self.checkpoint.write_completed(ok, now);
        if self.state == SubscriptionState::Stopped {
            // Drain: one final attempt with whatever is still unpersisted.
            if let Some(value) = self.checkpoint.unpersisted_value() {
                self.checkpoint.write_started(value);
                self.checkpoint_writer
                    .begin_write_state(&self.subscription_id, value);
            }
            return;
        }
        self.maybe_write_checkpoint(now);
    }

    /// Drive timeouts, read retries, and delayed checkpoint flushes.
    /// Callers should tick at a resolution of at most `timeout / 10`.
    pub fn tick(&mut self, now: Instant) {
        if self.state == SubscriptionState::Stopped {
            return;
        }
        for due in self.retries.drain_due(now) {
            let Some(client) = self.registry.get_mut(due.correlation_id) else {
                continue;
            };
            let current = client
                .in_flight_entry(&due.event_id)
                .is_some_and(|entry| entry.dispatched_at == due.dispatched_at);
            if !current {
                continue;
            }
            let Some(entry) = client.complete(&due.event_id) else {
                continue;
            };
            self.stats.timeouts += 1;
            self.retry_or_park(entry.event);
        }
        if self.state == SubscriptionState::CatchingUp {
            self.maybe_read(now);
        }
        self.maybe_write_checkpoint(now);
        self.try_dispatch(now);
    }

    /// Operator action: move every parked event back into dispatch with a
    /// fresh retry budget.
    pub fn replay_parked(&mut self, now: Instant) {
        if self.state == SubscriptionState::Stopped {
            return;
        }
        for mut buffered in self.buffer.take_parked() {
            buffered.retry_count = 0;
            self.buffer.requeue(buffered);
        }
        self.try_dispatch(now);
    }

    /// Shut down: refuse further clients, ignore pending read
    /// completions, attempt a final checkpoint write.
    pub fn stop(&mut self, _now: Instant) {
        if self.state == SubscriptionState::Stopped {
            return;
        }
        self.state = SubscriptionState::Stopped;
        if let Some(value) = self.checkpoint.unpersisted_value()
            && !self.checkpoint.write_in_flight()
        {
            self.checkpoint.write_started(value);
            self.checkpoint_writer
                .begin_write_state(&self.subscription_id, value);
        }
    }

    pub fn statistics(&self) -> SubscriptionStatistics {
        SubscriptionStatistics {
            client_count: self.registry.len(),
            buffered: self.buffer.len(),
            in_flight: self.registry.total_in_flight(),
            parked: self.buffer.parked_len(),
            last_acked: self.checkpoint.last_acked(),
            last_persisted: self.checkpoint.persisted(),
            dispatched: self.stats.dispatched,
            acked: self.stats.acked,
            skipped: self.stats.skipped,
            parked_total: self.stats.parked,
            timeouts: self.stats.timeouts,
            live_dropped: self.stats.live_dropped,
            latency: self.stats.latency(),
        }
    }

    fn live_while_catching_up(&mut self, event: StreamEvent, now: Instant) -> LiveDecision {
        let number = event.event_number;
        if let Some(last) = self.buffer.last_live_number() {
            if number <= last {
                return LiveDecision::Dropped(LiveDropReason::Duplicate);
            }
            if number != last + 1 {
                return LiveDecision::Dropped(LiveDropReason::Gap);
            }
        } else {
            // The live segment only starts at the exact read frontier and
            // only while no read is outstanding; anything else is covered
            // by the reader.
            let frontier = self.reader.next_read_from();
            if number < frontier {
                return LiveDecision::Dropped(LiveDropReason::Duplicate);
            }
            if self.reader.has_outstanding() || number != frontier {
                return LiveDecision::Dropped(LiveDropReason::Gap);
            }
        }
        match self.buffer.enqueue_live(event) {
            LiveIntake::Buffered => {
                self.try_dispatch(now);
                LiveDecision::Accepted
            }
            LiveIntake::Dropped => {
                self.stats.live_dropped += 1;
                LiveDecision::Dropped(LiveDropReason::Overflow)
            }
        }
    }

    fn live_while_live(&mut self, event: StreamEvent, now: Instant) -> LiveDecision {
        let number = event.event_number;
        match self.expected_next {
            None => {
                // Start-from-current: the first pushed event defines the
                // subscription's origin.
                self.checkpoint.set_start_number(number);
                match self.buffer.enqueue_live(event) {
                    LiveIntake::Buffered => {
                        self.expected_next = Some(number + 1);
                        self.try_dispatch(now);
                        LiveDecision::Accepted
                    }
                    LiveIntake::Dropped => {
                        self.stats.live_dropped += 1;
                        LiveDecision::Dropped(LiveDropReason::Overflow)
                    }
                }
            }
            Some(expected) if number < expected => {
                LiveDecision::Dropped(LiveDropReason::Duplicate)
            }
            Some(expected) if number > expected => {
                self.stats.live_dropped += 1;
                self.fall_back_to_catch_up(expected, now);
                LiveDecision::Dropped(LiveDropReason::Gap)
            }
            Some(expected) => match self.buffer.enqueue_live(event) {
                LiveIntake::Buffered => {
                    self.expected_next = Some(expected + 1);
                    self.try_dispatch(now);
                    LiveDecision::Accepted
                }
                LiveIntake::Dropped => {
                    self.stats.live_dropped += 1;
                    self.fall_back_to_catch_up(expected, now);
                    LiveDecision::Dropped(LiveDropReason::Overflow)
                }
            },
        }
    }

    /// The push feed got ahead of us (gap or overflow): page the missing
    /// range back in. Pending live events keep their place ahead of the
    /// reads.
    fn fall_back_to_catch_up(&mut self, from: u64, now: Instant) {
        tracing::debug!(
            subscription = %self.subscription_id,
            from,
            "live feed ran ahead, falling back to catch-up"
        );
        self.buffer.demote_live_to_history();
        self.state = SubscriptionState::CatchingUp;
        self.reader.start_at(from);
        self.maybe_read(now);
    }

    fn go_live(&mut self) {
        let expected = match self.buffer.last_live_number() {
            Some(last) => last + 1,
            None => self.reader.next_read_from(),
        };
        self.expected_next = Some(expected);
        self.state = SubscriptionState::Live;
    }

    fn maybe_read(&mut self, now: Instant) {
        let room = self.buffer.history_room();
        if let Some((from, count)) = self.reader.begin(room, now) {
            self.loader.begin_load(
                &self.subscription_id,
                from,
                count,
                self.settings.resolve_link_tos,
            );
        }
    }

    fn maybe_write_checkpoint(&mut self, now: Instant) {
        if let Some(value) = self.checkpoint.should_write(now) {
            self.checkpoint.write_started(value);
            self.checkpoint_writer
                .begin_write_state(&self.subscription_id, value);
        }
    }

    fn retry_or_park(&mut self, mut buffered: BufferedEvent) {
        buffered.retry_count += 1;
        if buffered.retry_count > self.settings.max_retry_count {
            tracing::warn!(
                subscription = %self.subscription_id,
                event_number = buffered.event_number(),
                retries = buffered.retry_count,
                "retry cap exceeded, parking event"
            );
            self.stats.parked += 1;
            self.buffer.park(buffered);
        } else {
            self.buffer.requeue(buffered);
        }
    }

    fn readmit(&mut self, recovered: Vec<BufferedEvent>) {
        for buffered in recovered {
            self.retry_or_park(buffered);
        }
    }

    fn try_dispatch(&mut self, now: Instant) {
        if !matches!(
            self.state,
            SubscriptionState::CatchingUp | SubscriptionState::Live
        ) {
            return;
        }
        while !self.buffer.is_empty() && self.registry.any_capacity() {
            let Some(index) = self.cursor.select(&self.registry) else {
                break;
            };
            let Some(buffered) = self.buffer.pop() else {
                break;
            };
            let event_id = buffered.event_id();
            let Some(client) = self.registry.at_mut(index) else {
                break;
            };
            let correlation_id = client.correlation_id;
            if let Err(rejected) = client.dispatch(buffered, now) {
                self.buffer.requeue(rejected);
                break;
            }
            self.retries
                .track(correlation_id, event_id, now, now + self.settings.timeout);
            self.stats.dispatched += 1;
        }
        if self.state == SubscriptionState::CatchingUp {
            // Dispatch freed history room; keep the pages coming.
            self.maybe_read(now);
        }
    }
}
