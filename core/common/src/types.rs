//! Common types used throughout the MusicHub core.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Bearer credential that zeroizes on drop.
///
/// Access and refresh tokens move through the session cache, the key-value
/// store and the HTTP layer. Holding them in this wrapper keeps them out of
/// `Debug` output and wipes the buffer when the last copy goes away.
#[derive(Clone, PartialEq, Eq, Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
#[serde(transparent)]
pub struct SecretToken(String);

impl SecretToken {
    /// Wrap a token value.
    ///
    /// # Errors
    /// - Returns error if the token is empty
    pub fn new(token: impl Into<String>) -> crate::Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Token cannot be empty".to_string(),
            ));
        }
        Ok(Self(token))
    }

    /// Expose the raw token, e.g. to build an `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretToken([REDACTED; {} chars])", self.0.len())
    }
}

/// Identifier sent to the server in the `X-Client-Platform` header.
pub fn client_platform() -> &'static str {
    std::env::consts::OS
}
