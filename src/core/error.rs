//! Core capability errors (identity and settings validation).
//!
//! These are bounded and stable: core errors represent refusal states at
//! construction time, not implementation details.

use thiserror::Error;

/// Invalid identifier.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("stream id `{raw}` is invalid: {reason}")]
    Stream { raw: String, reason: String },
    #[error("group name `{raw}` is invalid: {reason}")]
    Group { raw: String, reason: String },
}

/// Invalid configuration value.
#[derive(Debug, Error, Clone)]
#[error("setting `{field}` is invalid: {reason}")]
pub struct InvalidSetting {
    pub field: &'static str,
    pub reason: String,
}

/// Canonical error enum for core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    InvalidSetting(#[from] InvalidSetting),
}
