//! Persisted credentials.
//!
//! Tokens are written as raw strings, the user and timestamps as JSON. All
//! keys share the [`KEY_PREFIX`] namespace so they can be cleared together.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use musichub_common::{Result, SecretToken};
use musichub_platform::{KeyValueStore, KeyValueStoreExt};

use crate::policy::AuthState;
use crate::session::{AuthUser, Session};

/// Namespace shared by every credential key.
pub const KEY_PREFIX: &str = "musichub_auth_";
pub const ACCESS_TOKEN_KEY: &str = "musichub_auth_access_token";
pub const REFRESH_TOKEN_KEY: &str = "musichub_auth_refresh_token";
pub const USER_INFO_KEY: &str = "musichub_auth_user_info";
pub const AUTH_STATE_KEY: &str = "musichub_auth_auth_state";
pub const LAST_LOGIN_KEY: &str = "musichub_auth_last_login";

/// Everything read back from storage at cold start.
#[derive(Debug, Clone, Default)]
pub struct StoredCredentials {
    pub access_token: Option<SecretToken>,
    pub refresh_token: Option<SecretToken>,
    pub user: Option<AuthUser>,
    pub last_login: Option<DateTime<Utc>>,
}

impl StoredCredentials {
    /// Both an access token and a user are present.
    pub fn is_complete(&self) -> bool {
        self.access_token.is_some() && self.user.is_some()
    }

    /// Assemble a session, falling back to the epoch when no login time was
    /// ever recorded so that the grace window is already closed.
    pub fn into_session(self) -> Option<Session> {
        let StoredCredentials {
            access_token,
            refresh_token,
            user,
            last_login,
        } = self;
        Some(Session {
            access_token: access_token?,
            refresh_token,
            user: user?,
            last_successful_auth_at: last_login.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        })
    }
}

/// Credential persistence on top of a [`KeyValueStore`].
#[derive(Clone)]
pub struct CredentialStore {
    kv: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Read all credentials.
    ///
    /// A corrupt user record is treated as missing rather than failing the
    /// cold start.
    pub async fn load(&self) -> Result<StoredCredentials> {
        let access_token = self.token(ACCESS_TOKEN_KEY).await?;
        let refresh_token = self.token(REFRESH_TOKEN_KEY).await?;

        let user = match self.kv.get_item::<AuthUser>(USER_INFO_KEY).await {
            Ok(user) => user,
            Err(e) => {
                warn!("Discarding unreadable user record: {}", e);
                None
            }
        };

        let last_login = self.last_login().await?;

        Ok(StoredCredentials {
            access_token,
            refresh_token,
            user,
            last_login,
        })
    }

    /// Persist a full session including its login time.
    pub async fn save_session(&self, session: &Session) -> Result<()> {
        self.save_tokens(&session.access_token, session.refresh_token.as_ref())
            .await?;
        self.save_user(&session.user).await?;
        self.set_last_login(session.last_successful_auth_at).await
    }

    /// Replace the stored tokens. A `None` refresh token leaves the previous
    /// one in place.
    pub async fn save_tokens(
        &self,
        access: &SecretToken,
        refresh: Option<&SecretToken>,
    ) -> Result<()> {
        self.kv.set_string(ACCESS_TOKEN_KEY, access.expose()).await?;
        if let Some(refresh) = refresh {
            self.kv
                .set_string(REFRESH_TOKEN_KEY, refresh.expose())
                .await?;
        }
        Ok(())
    }

    pub async fn save_user(&self, user: &AuthUser) -> Result<()> {
        self.kv.set_item(USER_INFO_KEY, user).await
    }

    pub async fn set_last_login(&self, at: DateTime<Utc>) -> Result<()> {
        self.kv.set_item(LAST_LOGIN_KEY, &at).await
    }

    pub async fn last_login(&self) -> Result<Option<DateTime<Utc>>> {
        match self.kv.get_item::<DateTime<Utc>>(LAST_LOGIN_KEY).await {
            Ok(at) => Ok(at),
            Err(e) => {
                warn!("Discarding unreadable login timestamp: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn save_state(&self, state: AuthState) -> Result<()> {
        self.kv.set_string(AUTH_STATE_KEY, state.as_str()).await
    }

    /// Remove tokens, user and state. The last login time is kept.
    pub async fn clear(&self) -> Result<()> {
        self.kv
            .remove_all(&[
                ACCESS_TOKEN_KEY,
                REFRESH_TOKEN_KEY,
                USER_INFO_KEY,
                AUTH_STATE_KEY,
            ])
            .await
    }

    async fn token(&self, key: &str) -> Result<Option<SecretToken>> {
        Ok(self
            .kv
            .get_string(key)
            .await?
            .and_then(|raw| SecretToken::new(raw).ok()))
    }
}
