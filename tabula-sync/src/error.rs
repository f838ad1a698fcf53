//! Error taxonomy for the sync core.
//!
//! Every failure that can reach a submitting client maps onto a numeric
//! wire code via [`SyncError::code`], which is what ends up inside a
//! `WireError` on `error` / `submitResponse` messages.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Missing operation, missing collection/document id, malformed payload.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Path segment does not match the container it addresses.
    #[error("invalid path at segment {index}: {reason}")]
    InvalidPath { index: usize, reason: String },

    #[error("unknown OT type: {0}")]
    UnknownType(String),

    #[error("commit failed for {collection}/{id}: {reason}")]
    Commit {
        collection: String,
        id: String,
        reason: String,
    },

    #[error("version conflict on {collection}/{id}: expected v{expected}, got v{actual}")]
    VersionConflict {
        collection: String,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// The pipeline, fanout or collaborator has been closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("operation timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn invalid_path(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            index,
            reason: reason.into(),
        }
    }

    /// Numeric code carried by wire-level error payloads.
    pub fn code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::InvalidPath { .. } | Self::Protocol(_) => 400,
            Self::NotFound { .. } => 404,
            Self::Timeout => 408,
            Self::VersionConflict { .. } => 409,
            Self::UnknownType(_) => 422,
            Self::Commit { .. } | Self::Transport(_) => 500,
            Self::Closed(_) => 503,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SyncError::validation("x").code(), 400);
        assert_eq!(SyncError::invalid_path(0, "bad").code(), 400);
        assert_eq!(SyncError::UnknownType("rich-text".into()).code(), 422);
        assert_eq!(SyncError::Closed("pub/sub service").code(), 503);
        assert_eq!(SyncError::Timeout.code(), 408);
        assert_eq!(
            SyncError::VersionConflict {
                collection: "record_t".into(),
                id: "r".into(),
                expected: 2,
                actual: 5,
            }
            .code(),
            409
        );
    }

    #[test]
    fn test_closed_message() {
        let e = SyncError::Closed("pub/sub service");
        assert_eq!(e.to_string(), "pub/sub service is closed");
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let e: SyncError = err.into();
        assert!(matches!(e, SyncError::Protocol(_)));
    }
}
