use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::compression::CodecError;
use super::store::StoreError;

/// A failure reported by a speech synthesizer.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SynthesisError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl SynthesisError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an underlying transport or provider error.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An error returned to callers of the clip cache.
///
/// One fetch can have many waiters, so the error is cheaply cloneable and every waiter
/// observes the same value.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The request was rejected before touching the store or the synthesizer.
    #[error("invalid request: {0}")]
    Validation(&'static str),
    /// The store could not be read or written.
    #[error("clip store failed")]
    Store(#[source] Arc<StoreError>),
    /// A stored clip exists but its payload cannot be decoded.
    #[error("stored clip is unreadable")]
    Unreadable(#[source] Arc<CodecError>),
    /// The synthesizer failed.
    #[error("synthesis failed: {0}")]
    Upstream(Arc<SynthesisError>),
    /// The synthesizer did not answer in time.
    #[error("synthesis timed out after {0:?}")]
    Timeout(Duration),
    /// The fetch was abandoned, typically because the cache is shutting down.
    #[error("fetch was cancelled")]
    Cancelled,
}

impl CacheError {
    /// Whether repeating the same request might succeed.
    ///
    /// Failures of the synthesizer are transient from the cache's point of view. Invalid
    /// requests and a broken store are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Timeout(_) | Self::Cancelled)
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Codec(err) => Self::Unreadable(Arc::new(err)),
            err => Self::Store(Arc::new(err)),
        }
    }
}

impl From<CodecError> for CacheError {
    fn from(err: CodecError) -> Self {
        Self::Unreadable(Arc::new(err))
    }
}

impl From<SynthesisError> for CacheError {
    fn from(err: SynthesisError) -> Self {
        Self::Upstream(Arc::new(err))
    }
}
