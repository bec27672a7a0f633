//! Common error types for the MusicHub core.

use thiserror::Error;

/// Top-level error type for MusicHub core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device has no network connectivity.
    #[error("Device is offline")]
    Offline,

    /// No usable session exists.
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    /// A request could not reach the server (transport failure or 5xx).
    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),

    /// The server answered with a non-success status.
    #[error("Server rejected request ({status}): {message}")]
    ServerRejected { status: u16, message: String },

    /// The server refused pushed changes as invalid or conflicting.
    #[error("Validation conflict: {0}")]
    ValidationConflict(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// True for a 401 answer, which callers may resolve with a token refresh.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Error::ServerRejected { status: 401, .. })
    }

    /// True when the server could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::ServerUnreachable(_) | Error::Offline)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_rejection_only_for_401() {
        let unauthorized = Error::ServerRejected {
            status: 401,
            message: "expired".to_string(),
        };
        let forbidden = Error::ServerRejected {
            status: 403,
            message: "nope".to_string(),
        };

        assert!(unauthorized.is_auth_rejection());
        assert!(!forbidden.is_auth_rejection());
        assert!(!Error::Offline.is_auth_rejection());
    }

    #[test]
    fn test_offline_message() {
        assert_eq!(Error::Offline.to_string(), "Device is offline");
        assert!(Error::ServerUnreachable("timeout".into()).is_unreachable());
    }
}
