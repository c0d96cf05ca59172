//! Request-scoped failures returned by the store and the admission controller.
//!
//! None of these terminate the serving process. Missing, malformed and expired
//! locators all collapse into [`StashError::NotFound`] so callers cannot tell
//! them apart.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to the caller of a store or admission operation.
#[derive(Debug, Error)]
pub enum StashError {
    /// The request itself is unacceptable (empty upload, bad expiry selector).
    #[error("invalid request: {0}")]
    Validation(String),

    /// No object is reachable under this locator.
    #[error("not found")]
    NotFound,

    /// The admission controller denied the request.
    #[error("rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// The upload stream failed before it was fully read.
    #[error("upload interrupted: {0}")]
    Upload(#[source] io::Error),

    /// Backing-store I/O failed.
    #[error("storage error: {context} ({path}): {source}")]
    Storage {
        context: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    /// A policy record could not be decoded and strict metadata is enabled.
    #[error("corrupt policy record {path}: {source}")]
    Metadata {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A policy record could not be encoded.
    #[error("failed to encode policy record: {0}")]
    Encode(#[from] serde_json::Error),

    /// Every candidate locator collided with an existing entry.
    #[error("could not allocate a unique locator after {attempts} attempts")]
    Exhausted { attempts: usize },
}

impl StashError {
    pub(crate) fn storage(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            context,
            path: path.into(),
            source,
        }
    }

    /// Whether this failure stems from the backing store rather than the request.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Metadata { .. } | Self::Encode(_) | Self::Exhausted { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StashError>;

/// Extension for mapping `io::Result` into a [`StashError::Storage`].
pub(crate) trait IoContext<T> {
    fn storage(self, context: &'static str, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn storage(self, context: &'static str, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| StashError::storage(context, path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_kinds() {
        let io_err = StashError::storage("failed to write", "/tmp/x", io::Error::other("disk"));
        assert!(io_err.is_storage());
        assert!(StashError::Exhausted { attempts: 8 }.is_storage());
        assert!(!StashError::NotFound.is_storage());
        assert!(!StashError::Validation("empty".into()).is_storage());
    }

    #[test]
    fn test_display_includes_context() {
        let err = StashError::storage("failed to create staging file", "/data/.staging/ab", io::Error::other("boom"));
        let msg = err.to_string();
        assert!(msg.contains("failed to create staging file"));
        assert!(msg.contains("/data/.staging/ab"));
    }

    #[test]
    fn test_rate_limited_display() {
        let err = StashError::RateLimited {
            retry_after: Duration::from_millis(4500),
        };
        assert_eq!(err.to_string(), "rate limited, retry after 4500ms");
    }
}
