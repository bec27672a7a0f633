//! Session material.
//!
//! A session holds the bearer tokens and the signed-in user. Tokens are
//! wrapped in [`SecretToken`] and zeroized when the session is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use musichub_common::SecretToken;

/// Role a MusicHub account signed up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Musician,
    Venue,
    Fan,
}

/// The signed-in user as returned by the auth API and cached on device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub has_completed_onboarding: bool,
    /// Local bookkeeping: end of the last successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl AuthUser {
    /// Case-insensitive email comparison, ignoring surrounding whitespace.
    pub fn matches_email(&self, email: &str) -> bool {
        self.email.trim().eq_ignore_ascii_case(email.trim())
    }
}

/// An established session.
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: SecretToken,
    pub refresh_token: Option<SecretToken>,
    pub user: AuthUser,
    /// Last time the server confirmed these credentials.
    pub last_successful_auth_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_wire_format() {
        let json = r#"{
            "id": "u1",
            "email": "Ana@Example.com",
            "name": "Ana",
            "role": "musician",
            "avatarUrl": "https://cdn/a.png",
            "createdAt": "2024-01-01T00:00:00Z",
            "hasCompletedOnboarding": true
        }"#;
        let user: AuthUser = serde_json::from_str(json).unwrap();

        assert_eq!(user.role, UserRole::Musician);
        assert_eq!(user.avatar_url.as_deref(), Some("https://cdn/a.png"));
        assert!(user.has_completed_onboarding);
        assert!(user.matches_email(" ana@example.com"));
        assert!(!user.matches_email("bob@example.com"));
    }
}
