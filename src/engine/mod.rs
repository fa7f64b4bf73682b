//! The persistent subscription engine and its parts.
//!
//! Provides:
//! - capability seams to the log, checkpoint store, and clients
//! - the bounded event buffer spanning history pages and live pushes
//! - the client registry with per-client in-flight tables
//! - dispatch policies, retry tracking, and checkpoint scheduling
//! - the engine state machine tying them together

pub mod buffer;
pub mod capabilities;
pub mod checkpoint;
pub mod clients;
pub mod dispatch;
pub mod reader;
pub mod retries;
pub mod stats;
pub mod subscription;

pub use buffer::{BufferError, EventBuffer, LiveIntake};
pub use capabilities::{
    ChannelReplySink, CheckpointReader, CheckpointWriter, DispatchedEvent, EventLoader, ReplySink,
};
pub use checkpoint::Checkpointer;
pub use clients::{Client, ClientRegistry, InFlightEntry};
pub use dispatch::DispatchCursor;
pub use reader::HistoryReader;
pub use retries::{DueEntry, RetryTracker};
pub use stats::{LatencySnapshot, SubscriptionStatistics, SubscriptionStats};
pub use subscription::{
    LiveDecision, LiveDropReason, PersistentSubscription, SubscriptionError, SubscriptionParams,
    SubscriptionState,
};
