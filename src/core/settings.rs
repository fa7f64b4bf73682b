//! Subscription configuration (normative defaults).
//!
//! The engine consumes a finalized immutable settings value; there is no
//! builder. Values are explicit about their units.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidSetting};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_RETRY_COUNT: u32 = 10;
const DEFAULT_LIVE_BUFFER_SIZE: usize = 500;
const DEFAULT_HISTORY_BUFFER_SIZE: usize = 20;
const DEFAULT_READ_BATCH_SIZE: usize = 500;
const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;
const DEFAULT_CHECKPOINT_MAX_DELAY_MS: u64 = 2_000;
const DEFAULT_READ_BACKOFF_MS: u64 = 500;

/// Where dispatch begins when no checkpoint has been persisted yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// Event number 0.
    Beginning,
    /// The current live tail; history is skipped entirely.
    Current,
    /// An explicit event number.
    Explicit(u64),
}

impl StartFrom {
    /// Decode the wire convention: `-1` current tail, `0` beginning,
    /// `n > 0` explicit.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            -1 => StartFrom::Current,
            0 => StartFrom::Beginning,
            n => StartFrom::Explicit(n as u64),
        }
    }
}

/// How the dispatcher picks a client for the next event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Rotate over clients, skipping those at capacity.
    #[default]
    RoundRobin,
    /// Pin one client until it disconnects or saturates.
    DispatchToSingle,
}

/// What a client asks the engine to do with a negatively-acknowledged
/// event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NakAction {
    /// Remove from active dispatch, retain for operator action.
    Park,
    /// Requeue for redelivery, subject to the retry cap.
    Retry,
    /// Treat as acknowledged for checkpointing purposes.
    Skip,
}

/// Per-subscription settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Ask the loader to resolve link events to their targets.
    pub resolve_link_tos: bool,
    pub start_from: StartFrom,
    /// In-flight ack deadline.
    pub timeout: Duration,
    /// Delivery attempts before an event is parked.
    pub max_retry_count: u32,
    /// Cap on the live segment of the buffer.
    pub live_buffer_size: usize,
    /// Cap on the history segment of the buffer.
    pub history_buffer_size: usize,
    /// Events requested per history read.
    pub read_batch_size: usize,
    pub policy: DispatchPolicy,
    /// Record dispatch-to-ack latency in the statistics snapshot.
    pub latency_statistics: bool,
    /// Acks between durable checkpoint writes.
    pub checkpoint_interval: u64,
    /// Longest unpersisted progress may age before a write is forced.
    pub checkpoint_max_delay: Duration,
    /// Pause before retrying a failed history read.
    pub read_backoff: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: StartFrom::Beginning,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            live_buffer_size: DEFAULT_LIVE_BUFFER_SIZE,
            history_buffer_size: DEFAULT_HISTORY_BUFFER_SIZE,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            policy: DispatchPolicy::default(),
            latency_statistics: false,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            checkpoint_max_delay: Duration::from_millis(DEFAULT_CHECKPOINT_MAX_DELAY_MS),
            read_backoff: Duration::from_millis(DEFAULT_READ_BACKOFF_MS),
        }
    }
}

impl SubscriptionSettings {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.timeout.is_zero() {
            return Err(invalid("timeout", "must be > 0"));
        }
        if self.live_buffer_size == 0 {
            return Err(invalid("live_buffer_size", "must be > 0"));
        }
        if self.history_buffer_size == 0 {
            return Err(invalid("history_buffer_size", "must be > 0"));
        }
        if self.read_batch_size == 0 {
            return Err(invalid("read_batch_size", "must be > 0"));
        }
        if self.checkpoint_interval == 0 {
            return Err(invalid("checkpoint_interval", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> CoreError {
    InvalidSetting {
        field,
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SubscriptionSettings::default().validate().unwrap();
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let mut settings = SubscriptionSettings::default();
        settings.live_buffer_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = SubscriptionSettings::default();
        settings.read_batch_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = SubscriptionSettings::default();
        settings.timeout = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn start_from_decodes_wire_convention() {
        assert_eq!(StartFrom::from_raw(-1), StartFrom::Current);
        assert_eq!(StartFrom::from_raw(0), StartFrom::Beginning);
        assert_eq!(StartFrom::from_raw(42), StartFrom::Explicit(42));
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = SubscriptionSettings {
            start_from: StartFrom::Explicit(7),
            policy: DispatchPolicy::DispatchToSingle,
            ..SubscriptionSettings::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        let back: SubscriptionSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }
}
