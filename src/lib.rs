#![forbid(unsafe_code)]

pub mod core;
pub mod engine;
pub mod error;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    BufferedEvent, ConnectionId, CoreError, CorrelationId, DispatchPolicy, EventId, EventSource,
    GroupName, NakAction, Position, StartFrom, StreamEvent, StreamId, SubscriptionId,
    SubscriptionSettings,
};
pub use crate::engine::{
    ChannelReplySink, CheckpointReader, CheckpointWriter, DispatchedEvent, EventLoader,
    LiveDecision, LiveDropReason, PersistentSubscription, ReplySink, SubscriptionError,
    SubscriptionParams, SubscriptionState, SubscriptionStatistics,
};
