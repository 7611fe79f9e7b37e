//! Loader Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! Kinds are `Clone` because a failed [`LoadRequest`](crate::LoadRequest)
//! hands the same error to every poll.

use crate::BundleKey;
use derive_more::{Display, Error};
use std::time::Duration;

/// A loader error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for loader operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Clone, PartialEq, Display, Error)]
pub enum ErrorKind {
    /// A bundle was requested before any manifest was installed. This is a
    /// setup mistake, not something that happens at random.
    #[display("no manifest installed; download or install one first")]
    ManifestUninitialized,
    /// The bundle (or one of its dependencies) could not be fetched. Stays
    /// this way until the error is cleared.
    #[display("failed to fetch bundle {key}: {reason}")]
    Transport { key: BundleKey, reason: String },
    /// Nothing moved for too long; the download was left running.
    #[display("no progress after {}s, stopped waiting", _0.as_secs_f64())]
    TimeoutAbandoned(#[error(not(source))] Duration),
    /// Nothing moved for too long; the download was cancelled.
    #[display("no progress after {}s, download cancelled", _0.as_secs_f64())]
    TimeoutCancelled(#[error(not(source))] Duration),
    /// The extraction worker died before producing a result.
    #[display("asset extraction failed: {_0}")]
    Extraction(#[error(not(source))] String),
    #[display("must be called from within a tokio runtime")]
    Runtime,
    #[display("storage backend could not be set up")]
    Storage,
    #[display("invalid loader configuration")]
    Config,
    #[display("loader has been shut down")]
    Shutdown,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    ///
    /// Transport failures only become retryable once the key's error has been
    /// cleared with [`Loader::clear_error`](crate::Loader::clear_error).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::TimeoutAbandoned(_) | Self::TimeoutCancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ErrorKind::Transport { key: BundleKey::new("cube2"), reason: "404".to_string() };
        assert_eq!(err.to_string(), "failed to fetch bundle cube2: 404");
        assert_eq!(
            ErrorKind::TimeoutAbandoned(Duration::from_millis(2500)).to_string(),
            "no progress after 2.5s, stopped waiting"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::TimeoutCancelled(Duration::from_secs(5)).is_retryable());
        assert!(!ErrorKind::ManifestUninitialized.is_retryable());
        assert!(!ErrorKind::Shutdown.is_retryable());
    }
}
