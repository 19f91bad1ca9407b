//! Caller-facing error type.
//!
//! Environmental failures (disk, network) never surface here; they degrade to a cache miss inside
//! the component that hit them. Only programmer errors do.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A configuration value was rejected; the previous value stays in effect.
    #[error("invalid value for {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// The cache is bound to an owner thread and was called from a different one.
    #[error("invalid cross-thread access to the image cache")]
    CrossContextAccess,

    /// Background work needs a tokio runtime and none was available at construction.
    #[error("image cache must be constructed inside a tokio runtime")]
    NoRuntime,
}

impl CacheError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument { name, reason: reason.into() }
    }
}
