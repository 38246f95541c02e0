//! Errors delivered to image request callers.

use thiserror::Error;

/// Image request error variants.
///
/// Cloneable because a single failure is fanned out to every waiter of a
/// coalesced request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum ImageError {
    #[error("no image format named {name:?} is registered")]
    FormatUnresolved { name: String },

    #[error("image source rejected {key}: {reason}")]
    SourceRejected { key: String, reason: String },

    #[error("entry of {size} bytes exceeds disk capacity of {capacity} bytes")]
    CapacityExceeded { size: u64, capacity: u64 },

    #[error("{key} not found")]
    NotFound { key: String },

    #[error("request for {key} was cancelled")]
    Cancelled { key: String },

    #[error("failed to decode image for {key}: {message}")]
    Decode { key: String, message: String },

    #[error("invalid manager options: {message}")]
    InvalidOptions { message: String },

    #[error("io error: {message}")]
    Io { message: String },
}

impl ImageError {
    /// Creates source rejected error.
    #[must_use]
    pub fn rejected(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::SourceRejected {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates cancelled error.
    #[must_use]
    pub fn cancelled(key: impl ToString) -> Self {
        Self::Cancelled {
            key: key.to_string(),
        }
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(key: impl ToString, message: impl Into<String>) -> Self {
        Self::Decode {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Creates invalid options error.
    #[must_use]
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            message: message.into(),
        }
    }

    /// Creates io error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Returns whether the failure came from the image source.
    #[must_use]
    pub const fn is_source_failure(&self) -> bool {
        matches!(self, Self::SourceRejected { .. })
    }

    /// Returns whether a retry by the caller could succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SourceRejected { .. } | Self::Cancelled { .. } | Self::Io { .. }
        )
    }
}
