//! Error types for the throttling core
//!
//! Provides unified error handling using thiserror. The mutex and rate limiter
//! never fail; only cache snapshots (decoding and persistence) can.

use thiserror::Error;

// == Cache Error Enum ==
/// Errors raised while loading or persisting cache snapshots.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Snapshot could not be decoded or encoded
    #[error("Invalid snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// Snapshot file could not be read or written
    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

// == Result Type Alias ==
/// Convenience Result type for cache snapshot operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_error_from_serde() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CacheError = err.into();
        assert!(matches!(err, CacheError::Snapshot(_)));
        assert!(err.to_string().starts_with("Invalid snapshot"));
    }

    #[test]
    fn test_io_error_from_std() {
        let err: CacheError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, CacheError::Io(_)));
    }
}
