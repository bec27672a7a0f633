//! Sync attempt outcomes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use musichub_common::Error;

/// Why a sync attempt did not succeed.
///
/// These are expected conditions and travel as data inside
/// [`SyncResult`]. Anything else is returned as an error by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SyncFailure {
    #[error("Device is offline")]
    Offline,

    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    #[error("Sync already in progress")]
    AlreadySyncing,

    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("Server rejected request ({status}): {message}")]
    ServerRejected { status: u16, message: String },

    #[error("Validation conflict: {0}")]
    ValidationConflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The server answered with something that could not be decoded.
    #[error("Malformed server response: {0}")]
    Protocol(String),
}

impl SyncFailure {
    /// Classify an error raised during a sync attempt.
    ///
    /// Returns the error back when it is not an expected sync condition
    /// (local storage or I/O failures).
    pub fn classify(error: Error) -> Result<Self, Error> {
        let failure = match error {
            Error::Offline => SyncFailure::Offline,
            Error::Unauthenticated(reason) => SyncFailure::Unauthenticated(reason),
            Error::ServerUnreachable(reason) => SyncFailure::ServerUnreachable(reason),
            Error::ServerRejected { status, message } => {
                SyncFailure::ServerRejected { status, message }
            }
            Error::ValidationConflict(reason) => SyncFailure::ValidationConflict(reason),
            Error::InvalidInput(reason) => SyncFailure::InvalidRequest(reason),
            Error::Serialization(reason) => SyncFailure::Protocol(reason),
            other => return Err(other),
        };
        Ok(failure)
    }

    /// Transient failures that the next trigger may clear on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncFailure::Offline
                | SyncFailure::AlreadySyncing
                | SyncFailure::ServerUnreachable(_)
        ) || matches!(self, SyncFailure::ServerRejected { status, .. } if *status >= 500)
    }
}

/// Outcome of one sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub error: Option<SyncFailure>,
    pub completed_at: DateTime<Utc>,
    /// Created plus updated records received.
    pub pulled: usize,
    /// Created, updated and deleted records sent.
    pub pushed: usize,
}

impl SyncResult {
    pub fn succeeded(completed_at: DateTime<Utc>, pulled: usize, pushed: usize) -> Self {
        Self {
            success: true,
            error: None,
            completed_at,
            pulled,
            pushed,
        }
    }

    pub fn failed(error: SyncFailure, completed_at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            error: Some(error),
            completed_at,
            pulled: 0,
            pushed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_expected_errors() {
        assert_eq!(
            SyncFailure::classify(Error::Offline).unwrap().to_string(),
            "Device is offline"
        );
        assert_eq!(
            SyncFailure::classify(Error::ServerRejected {
                status: 500,
                message: "boom".to_string()
            })
            .unwrap(),
            SyncFailure::ServerRejected {
                status: 500,
                message: "boom".to_string()
            }
        );
        assert!(matches!(
            SyncFailure::classify(Error::Serialization("bad".to_string())),
            Ok(SyncFailure::Protocol(_))
        ));
    }

    #[test]
    fn test_classify_passes_local_failures_through() {
        let err = SyncFailure::classify(Error::Storage("disk full".to_string())).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_transient() {
        assert!(SyncFailure::Offline.is_transient());
        assert!(SyncFailure::ServerRejected {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!SyncFailure::ValidationConflict("dup".to_string()).is_transient());
        assert_eq!(SyncFailure::AlreadySyncing.to_string(), "Sync already in progress");
    }
}
