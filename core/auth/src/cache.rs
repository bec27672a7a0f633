//! Session cache.
//!
//! Owns the in-memory [`Session`] and keeps it consistent with the persisted
//! credentials. No lock is held across a network call. Every sign-out or
//! new sign-in bumps a generation counter, and a refresh that finishes under
//! a different generation is discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use musichub_common::{Clock, Error, Result, SecretToken, SystemClock};
use musichub_platform::{Connectivity, KeyValueStore};

use crate::api::{AuthApi, AuthResponse};
use crate::credentials::CredentialStore;
use crate::policy::{AuthState, ColdStartEvent, ColdStartOutcome, ColdStartPhase, OfflineAuthPolicy};
use crate::provider::{OAuthProvider, ProviderAuthorization, ProviderConfig, ProviderGrant};
use crate::session::{AuthUser, Session};

/// Session cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub offline_policy: OfflineAuthPolicy,
    #[serde(default)]
    pub google: Option<ProviderConfig>,
    #[serde(default)]
    pub apple: Option<ProviderConfig>,
}

impl AuthConfig {
    pub fn with_offline_policy(mut self, policy: OfflineAuthPolicy) -> Self {
        self.offline_policy = policy;
        self
    }

    pub fn with_provider(mut self, provider: OAuthProvider, config: ProviderConfig) -> Self {
        match provider {
            OAuthProvider::Google => self.google = Some(config),
            OAuthProvider::Apple => self.apple = Some(config),
        }
        self
    }

    pub fn provider(&self, provider: OAuthProvider) -> Option<&ProviderConfig> {
        match provider {
            OAuthProvider::Google => self.google.as_ref(),
            OAuthProvider::Apple => self.apple.as_ref(),
        }
    }
}

/// Read-only view for UI collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthSnapshot {
    pub state: AuthState,
    pub is_loaded: bool,
    pub is_signed_in: bool,
    pub is_offline_authenticated: bool,
    pub user: Option<AuthUser>,
    /// Last time the server confirmed the credentials.
    pub last_synced_auth_at: Option<DateTime<Utc>>,
    pub has_completed_onboarding: bool,
    /// Set only while in offline grace.
    pub offline_access_expires_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: AuthState,
    loaded: bool,
    session: Option<Session>,
    generation: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: AuthState::Unauthenticated,
            loaded: false,
            session: None,
            generation: 0,
        }
    }

    fn sign_out(&mut self) {
        self.state = AuthState::Unauthenticated;
        self.loaded = true;
        self.session = None;
        self.generation += 1;
    }
}

/// Offline-tolerant session owner.
pub struct SessionCache {
    api: Arc<dyn AuthApi>,
    credentials: CredentialStore,
    connectivity: Arc<dyn Connectivity>,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
    inner: RwLock<Inner>,
}

impl SessionCache {
    pub fn new(
        api: Arc<dyn AuthApi>,
        kv: Arc<dyn KeyValueStore>,
        connectivity: Arc<dyn Connectivity>,
        config: AuthConfig,
    ) -> Self {
        Self {
            api,
            credentials: CredentialStore::new(kv),
            connectivity,
            clock: Arc::new(SystemClock),
            config,
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    fn policy(&self) -> &OfflineAuthPolicy {
        &self.config.offline_policy
    }

    /// Decide the session state from persisted credentials.
    ///
    /// # Postconditions
    /// - `snapshot().is_loaded` is true, whatever the outcome
    /// - When signed out, credentials are cleared except the last login time
    ///
    /// # Errors
    /// - Key-value store failures
    pub async fn load_auth_state(&self) -> Result<AuthState> {
        let generation = {
            let mut inner = self.inner.write().await;
            inner.state = AuthState::Authenticating;
            inner.generation
        };

        let result = self.run_cold_start(generation).await;
        if result.is_err() {
            let mut inner = self.inner.write().await;
            if inner.generation == generation {
                inner.sign_out();
            }
        }
        result
    }

    async fn run_cold_start(&self, generation: u64) -> Result<AuthState> {
        let stored = self.credentials.load().await?;
        let last_login = stored.last_login;
        let has_credentials = stored.is_complete();
        let online = has_credentials && self.connectivity.is_online().await;
        let mut session = stored.into_session();

        let mut phase = ColdStartPhase::Loading.next(ColdStartEvent::Loaded {
            has_credentials,
            online,
        })?;
        debug!("Cold start: {:?}", phase);

        let outcome = loop {
            let event = match phase {
                ColdStartPhase::Finished(outcome) => break outcome,
                ColdStartPhase::Validating => {
                    let current = require(session.as_ref())?;
                    match self.api.validate(&current.access_token).await {
                        Ok(true) => ColdStartEvent::TokenValid,
                        Ok(false) => ColdStartEvent::TokenRejected {
                            has_refresh_token: current.refresh_token.is_some(),
                        },
                        Err(e) => {
                            warn!("Token validation failed, checking offline grace: {}", e);
                            ColdStartEvent::ValidationFailed
                        }
                    }
                }
                ColdStartPhase::Refreshing => {
                    let current = require(session.as_mut())?;
                    match self.exchange_refresh(current).await {
                        Ok(()) => ColdStartEvent::RefreshSucceeded,
                        Err(e) => {
                            warn!("Token refresh during cold start failed: {}", e);
                            ColdStartEvent::RefreshFailed
                        }
                    }
                }
                ColdStartPhase::CheckingGrace => {
                    let now = self.clock.now();
                    ColdStartEvent::GraceChecked {
                        within_window: last_login
                            .is_some_and(|at| self.policy().within_grace(at, now)),
                    }
                }
                ColdStartPhase::Loading => {
                    return Err(Error::InvalidState(
                        "Cold start did not leave the loading phase".to_string(),
                    ))
                }
            };
            phase = phase.next(event)?;
            debug!("Cold start: {:?}", phase);
        };

        let state = outcome.state();
        match (outcome, session) {
            (ColdStartOutcome::Online, Some(mut session)) => {
                session.last_successful_auth_at = self.clock.now();
                self.commit(generation, state, session).await?;
            }
            (ColdStartOutcome::OfflineGrace, Some(session)) => {
                self.commit(generation, state, session).await?;
            }
            _ => self.expire_generation(generation).await?,
        }

        info!("Auth state loaded: {}", state.as_str());
        Ok(state)
    }

    /// Sign in with email and password.
    ///
    /// Offline, a cached session for the same email is continued without
    /// extending its grace window. The password is not checked in that case.
    ///
    /// # Errors
    /// - `Unauthenticated` offline when no cached session matches
    /// - `ServerRejected` for bad credentials
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser> {
        if !self.connectivity.is_online().await {
            return self.continue_offline(email).await;
        }

        let previous = self.begin_authenticating().await;
        let response = self.api.login(email, password).await;
        self.finish_exchange(previous, response).await
    }

    /// Register a new account. Online only.
    pub async fn sign_up(&self, email: &str, password: &str, name: &str) -> Result<AuthUser> {
        self.require_online().await?;
        let previous = self.begin_authenticating().await;
        let response = self.api.register(email, password, name).await;
        self.finish_exchange(previous, response).await
    }

    /// Authorization URL for a provider sign-in.
    ///
    /// # Errors
    /// - `InvalidInput` when the provider has no client configured
    pub fn provider_authorization(&self, provider: OAuthProvider) -> Result<ProviderAuthorization> {
        self.config
            .provider(provider)
            .ok_or_else(|| {
                Error::InvalidInput(format!("No {} client configured", provider))
            })?
            .authorize(provider)
    }

    /// Complete a provider sign-in with the code from the redirect. Online only.
    pub async fn sign_in_with_provider(
        &self,
        provider: OAuthProvider,
        grant: &ProviderGrant,
    ) -> Result<AuthUser> {
        self.require_online().await?;
        let previous = self.begin_authenticating().await;
        let response = self.api.provider_sign_in(provider, grant).await;
        self.finish_exchange(previous, response).await
    }

    /// Sign out locally; tell the server when reachable.
    pub async fn sign_out(&self) -> Result<()> {
        let token = self.current_token().await;
        if let Some(token) = token {
            if self.connectivity.is_online().await {
                if let Err(e) = self.api.logout(&token).await {
                    warn!("Could not contact server for logout: {}", e);
                }
            }
        }

        self.expire().await?;
        info!("Signed out");
        Ok(())
    }

    /// Current access token.
    ///
    /// An offline-grace session whose window has passed is expired here and
    /// `None` is returned.
    pub async fn get_access_token(&self) -> Result<Option<SecretToken>> {
        let expired = {
            let inner = self.inner.read().await;
            match (&inner.session, inner.state) {
                (Some(session), AuthState::AuthenticatedOfflineGrace) => !self
                    .policy()
                    .within_grace(session.last_successful_auth_at, self.clock.now()),
                (Some(session), _) => return Ok(Some(session.access_token.clone())),
                (None, _) => return Ok(None),
            }
        };

        if expired {
            info!("Offline access window elapsed; signing out");
            self.expire().await?;
            return Ok(None);
        }
        Ok(self.current_token().await)
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// # Errors
    /// - `Unauthenticated` when there is no session or the server answers the
    ///   refresh with a 4xx; the session is cleared in the latter case
    /// - `Unauthenticated` when the session was signed out or replaced while
    ///   the refresh was in flight; nothing from the answer is kept
    /// - Transport failures are returned unchanged and keep the session
    pub async fn refresh_access_token(&self) -> Result<SecretToken> {
        let (generation, mut session) = {
            let inner = self.inner.read().await;
            let session = inner
                .session
                .clone()
                .ok_or_else(|| Error::Unauthenticated("Not signed in".to_string()))?;
            (inner.generation, session)
        };

        match self.exchange_refresh(&mut session).await {
            Ok(()) => {
                session.last_successful_auth_at = self.clock.now();
                let token = session.access_token.clone();
                self.commit(generation, AuthState::AuthenticatedOnline, session)
                    .await?;
                debug!("Access token refreshed");
                Ok(token)
            }
            Err(
                e @ (Error::ServerRejected {
                    status: 400..=499,
                    ..
                }
                | Error::Unauthenticated(_)),
            ) => {
                warn!("Refresh rejected, clearing session: {}", e);
                self.expire_generation(generation).await?;
                Err(Error::Unauthenticated("Session expired".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Mark onboarding complete locally and notify the server when online.
    pub async fn complete_onboarding(&self) -> Result<AuthUser> {
        let (user, token) = {
            let mut inner = self.inner.write().await;
            let session = inner
                .session
                .as_mut()
                .ok_or_else(|| Error::Unauthenticated("Not signed in".to_string()))?;
            session.user.has_completed_onboarding = true;
            (session.user.clone(), session.access_token.clone())
        };
        self.credentials.save_user(&user).await?;

        if self.connectivity.is_online().await {
            if let Err(e) = self.api.complete_onboarding(&token).await {
                warn!("Could not update onboarding on server: {}", e);
            }
        }
        Ok(user)
    }

    /// Request a password reset email. Online only.
    pub async fn reset_password(&self, email: &str) -> Result<()> {
        self.require_online().await?;
        self.api.reset_password(email).await
    }

    /// Record the end of a successful sync on the cached user.
    pub async fn record_sync(&self, at: DateTime<Utc>) -> Result<()> {
        let user = {
            let mut inner = self.inner.write().await;
            match inner.session.as_mut() {
                Some(session) => {
                    session.user.last_synced_at = Some(at);
                    session.user.clone()
                }
                None => return Ok(()),
            }
        };
        self.credentials.save_user(&user).await
    }

    pub async fn state(&self) -> AuthState {
        self.inner.read().await.state
    }

    pub async fn user(&self) -> Option<AuthUser> {
        self.inner
            .read()
            .await
            .session
            .as_ref()
            .map(|s| s.user.clone())
    }

    pub async fn snapshot(&self) -> AuthSnapshot {
        let inner = self.inner.read().await;
        let session = inner.session.as_ref();
        let offline = inner.state == AuthState::AuthenticatedOfflineGrace;
        AuthSnapshot {
            state: inner.state,
            is_loaded: inner.loaded,
            is_signed_in: inner.state.is_authenticated(),
            is_offline_authenticated: offline,
            user: session.map(|s| s.user.clone()),
            last_synced_auth_at: session.map(|s| s.last_successful_auth_at),
            has_completed_onboarding: session.is_some_and(|s| s.user.has_completed_onboarding),
            offline_access_expires_at: session
                .filter(|_| offline)
                .map(|s| self.policy().expires_at(s.last_successful_auth_at)),
        }
    }

    async fn continue_offline(&self, email: &str) -> Result<AuthUser> {
        let offline_error = || Error::Unauthenticated("Cannot sign in while offline".to_string());

        let stored = self.credentials.load().await?;
        let matches = stored.user.as_ref().is_some_and(|u| u.matches_email(email));
        let Some(last_login) = stored.last_login else {
            return Err(offline_error());
        };
        if !matches || !self.policy().within_grace(last_login, self.clock.now()) {
            return Err(offline_error());
        }

        let session = stored.into_session().ok_or_else(offline_error)?;
        let user = session.user.clone();
        self.install(AuthState::AuthenticatedOfflineGrace, session)
            .await?;
        info!("Continuing cached session offline");
        Ok(user)
    }

    async fn begin_authenticating(&self) -> AuthState {
        let mut inner = self.inner.write().await;
        let previous = inner.state;
        inner.state = AuthState::Authenticating;
        previous
    }

    async fn finish_exchange(
        &self,
        previous: AuthState,
        response: Result<AuthResponse>,
    ) -> Result<AuthUser> {
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.inner.write().await.state = previous;
                return Err(e);
            }
        };

        let session = Session {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            user: response.user,
            last_successful_auth_at: self.clock.now(),
        };
        let user = session.user.clone();
        self.credentials.save_session(&session).await?;
        self.install(AuthState::AuthenticatedOnline, session).await?;
        info!("Signed in as {}", user.id);
        Ok(user)
    }

    async fn exchange_refresh(&self, session: &mut Session) -> Result<()> {
        let refresh = session
            .refresh_token
            .clone()
            .ok_or_else(|| Error::Unauthenticated("No refresh token".to_string()))?;
        let response = self.api.refresh(&refresh).await?;
        session.access_token = response.access_token;
        if let Some(rotated) = response.refresh_token {
            session.refresh_token = Some(rotated);
        }
        Ok(())
    }

    /// Replace the session. In-flight refreshes of the previous one are
    /// discarded when they return.
    async fn install(&self, state: AuthState, session: Session) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.credentials.save_state(state).await?;
        inner.state = state;
        inner.loaded = true;
        inner.session = Some(session);
        inner.generation += 1;
        Ok(())
    }

    /// Persist and install a session derived from the one current at
    /// `generation`.
    ///
    /// # Errors
    /// - `Unauthenticated` when the session was signed out or replaced since
    async fn commit(&self, generation: u64, state: AuthState, session: Session) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.generation != generation {
            debug!("Session changed during refresh; discarding result");
            return Err(Error::Unauthenticated(
                "Signed out during refresh".to_string(),
            ));
        }

        self.credentials
            .save_tokens(&session.access_token, session.refresh_token.as_ref())
            .await?;
        if state == AuthState::AuthenticatedOnline {
            self.credentials
                .set_last_login(session.last_successful_auth_at)
                .await?;
        }
        self.credentials.save_state(state).await?;
        inner.state = state;
        inner.loaded = true;
        inner.session = Some(session);
        Ok(())
    }

    async fn expire(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.sign_out();
        self.credentials.clear().await
    }

    /// Sign out only if the session is still the one current at `generation`.
    async fn expire_generation(&self, generation: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.generation != generation {
            return Ok(());
        }
        inner.sign_out();
        self.credentials.clear().await
    }

    async fn current_token(&self) -> Option<SecretToken> {
        self.inner
            .read()
            .await
            .session
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    async fn require_online(&self) -> Result<()> {
        if self.connectivity.is_online().await {
            Ok(())
        } else {
            Err(Error::Offline)
        }
    }
}

fn require<T>(session: Option<T>) -> Result<T> {
    session.ok_or_else(|| Error::InvalidState("Cold start lost its session".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ACCESS_TOKEN_KEY, LAST_LOGIN_KEY, REFRESH_TOKEN_KEY};
    use crate::session::UserRole;
    use chrono::{Duration, TimeZone};
    use musichub_common::FixedClock;
    use musichub_platform::{MemoryKeyValueStore, StaticConnectivity};

    struct Fixture {
        api: Arc<crate::stub::StubAuthApi>,
        kv: MemoryKeyValueStore,
        net: Arc<StaticConnectivity>,
        clock: Arc<FixedClock>,
        cache: SessionCache,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn user() -> AuthUser {
        AuthUser {
            id: "u1".to_string(),
            email: "ana@example.com".to_string(),
            name: "Ana".to_string(),
            username: Some("ana".to_string()),
            role: UserRole::Musician,
            avatar_url: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
            has_completed_onboarding: false,
            last_synced_at: None,
        }
    }

    fn fixture(online: bool) -> Fixture {
        let config = AuthConfig::default().with_provider(
            OAuthProvider::Google,
            ProviderConfig::new("client", "musichub://oauth/callback"),
        );
        fixture_with(online, config)
    }

    fn fixture_with(online: bool, config: AuthConfig) -> Fixture {
        let api = Arc::new(
            crate::stub::StubAuthApi::new()
                .with_account("secret", user())
                .with_provider_user(OAuthProvider::Google, user()),
        );
        let kv = MemoryKeyValueStore::new();
        let net = Arc::new(StaticConnectivity::new(online));
        let clock = Arc::new(FixedClock::new(now()));
        let cache = SessionCache::new(api.clone(), Arc::new(kv.clone()), net.clone(), config)
            .with_clock(clock.clone());
        Fixture {
            api,
            kv,
            net,
            clock,
            cache,
        }
    }

    /// Persist a session issued by the stub, last confirmed `age` ago.
    async fn seed(f: &Fixture, age: Duration) -> SecretToken {
        let (access, refresh) = f.api.issue_tokens("u1").unwrap();
        let session = Session {
            access_token: access.clone(),
            refresh_token: Some(refresh),
            user: user(),
            last_successful_auth_at: now() - age,
        };
        CredentialStore::new(Arc::new(f.kv.clone()))
            .save_session(&session)
            .await
            .unwrap();
        access
    }

    async fn stored(f: &Fixture, key: &str) -> Option<String> {
        f.kv.get_string(key).await.unwrap()
    }

    #[tokio::test]
    async fn test_cold_start_without_token_makes_no_calls() {
        let f = fixture(true);

        let state = f.cache.load_auth_state().await.unwrap();

        assert_eq!(state, AuthState::Unauthenticated);
        assert!(f.api.calls().is_empty());
        let snapshot = f.cache.snapshot().await;
        assert!(snapshot.is_loaded);
        assert!(!snapshot.is_signed_in);
    }

    #[tokio::test]
    async fn test_offline_grace_expired_after_thirty_days() {
        let f = fixture(false);
        seed(&f, Duration::days(30) + Duration::seconds(1)).await;

        let state = f.cache.load_auth_state().await.unwrap();

        assert_eq!(state, AuthState::Unauthenticated);
        assert!(stored(&f, ACCESS_TOKEN_KEY).await.is_none());
        assert!(stored(&f, LAST_LOGIN_KEY).await.is_some());
        assert!(f.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_offline_grace_within_window() {
        let f = fixture(false);
        seed(&f, Duration::days(29)).await;

        let state = f.cache.load_auth_state().await.unwrap();

        assert_eq!(state, AuthState::AuthenticatedOfflineGrace);
        let snapshot = f.cache.snapshot().await;
        assert!(snapshot.is_offline_authenticated);
        assert_eq!(snapshot.user.unwrap().id, "u1");
        assert_eq!(
            snapshot.offline_access_expires_at,
            Some(now() - Duration::days(29) + Duration::days(30))
        );
    }

    #[tokio::test]
    async fn test_online_valid_token_refreshes_last_login() {
        let f = fixture(true);
        seed(&f, Duration::days(3)).await;

        let state = f.cache.load_auth_state().await.unwrap();

        assert_eq!(state, AuthState::AuthenticatedOnline);
        assert_eq!(f.api.calls(), vec!["validate"]);
        let snapshot = f.cache.snapshot().await;
        assert_eq!(snapshot.last_synced_auth_at, Some(now()));
        let last_login = CredentialStore::new(Arc::new(f.kv.clone()))
            .last_login()
            .await
            .unwrap();
        assert_eq!(last_login, Some(now()));
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed() {
        let f = fixture(true);
        let old = seed(&f, Duration::days(3)).await;
        f.api.revoke_all();

        let state = f.cache.load_auth_state().await.unwrap();

        assert_eq!(state, AuthState::AuthenticatedOnline);
        assert_eq!(f.api.calls(), vec!["validate", "refresh"]);
        let token = f.cache.get_access_token().await.unwrap().unwrap();
        assert_ne!(token, old);
        assert_eq!(stored(&f, ACCESS_TOKEN_KEY).await.as_deref(), Some(token.expose()));
    }

    #[tokio::test]
    async fn test_rejected_token_and_refresh_signs_out() {
        let f = fixture(true);
        seed(&f, Duration::days(3)).await;
        f.api.revoke_all();
        f.api.revoke_refresh_tokens();

        let state = f.cache.load_auth_state().await.unwrap();

        assert_eq!(state, AuthState::Unauthenticated);
        assert!(stored(&f, ACCESS_TOKEN_KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_falls_back_to_grace() {
        let f = fixture(true);
        seed(&f, Duration::days(10)).await;
        f.api.set_reachable(false);

        let state = f.cache.load_auth_state().await.unwrap();

        assert_eq!(state, AuthState::AuthenticatedOfflineGrace);
        assert_eq!(f.api.calls(), vec!["validate"]);
    }

    #[tokio::test]
    async fn test_offline_sign_in_continues_cached_session() {
        let f = fixture(false);
        seed(&f, Duration::days(10)).await;

        let user = f.cache.sign_in("ANA@example.com ", "anything").await.unwrap();

        assert_eq!(user.id, "u1");
        assert_eq!(f.cache.state().await, AuthState::AuthenticatedOfflineGrace);
        assert!(f.api.calls().is_empty());
        let snapshot = f.cache.snapshot().await;
        assert_eq!(snapshot.last_synced_auth_at, Some(now() - Duration::days(10)));
    }

    #[tokio::test]
    async fn test_offline_sign_in_rejects_other_email() {
        let f = fixture(false);
        seed(&f, Duration::days(10)).await;

        let err = f.cache.sign_in("bob@example.com", "secret").await.unwrap_err();

        assert!(matches!(err, Error::Unauthenticated(_)));
        assert_eq!(f.cache.state().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_offline_sign_in_outside_window_fails() {
        let f = fixture(false);
        seed(&f, Duration::days(31)).await;
        assert!(f.cache.sign_in("ana@example.com", "secret").await.is_err());
    }

    #[tokio::test]
    async fn test_online_sign_in_resets_last_login() {
        let f = fixture(true);
        seed(&f, Duration::days(20)).await;

        f.cache.sign_in("ana@example.com", "secret").await.unwrap();

        assert_eq!(f.cache.state().await, AuthState::AuthenticatedOnline);
        let last_login = CredentialStore::new(Arc::new(f.kv.clone()))
            .last_login()
            .await
            .unwrap();
        assert_eq!(last_login, Some(now()));
    }

    #[tokio::test]
    async fn test_failed_sign_in_restores_state() {
        let f = fixture(true);
        let err = f.cache.sign_in("ana@example.com", "wrong").await.unwrap_err();
        assert!(err.is_auth_rejection());
        assert_eq!(f.cache.state().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_sign_out_keeps_last_login() {
        let f = fixture(true);
        f.cache.sign_in("ana@example.com", "secret").await.unwrap();

        f.cache.sign_out().await.unwrap();

        assert_eq!(f.api.call_count("logout"), 1);
        assert!(stored(&f, ACCESS_TOKEN_KEY).await.is_none());
        assert!(stored(&f, LAST_LOGIN_KEY).await.is_some());
        assert!(f.cache.get_access_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_sign_out_skips_server() {
        let f = fixture(false);
        seed(&f, Duration::days(1)).await;
        f.cache.load_auth_state().await.unwrap();

        f.cache.sign_out().await.unwrap();

        assert_eq!(f.api.call_count("logout"), 0);
        assert_eq!(f.cache.state().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_access_token_expires_with_grace_window() {
        let f = fixture(false);
        seed(&f, Duration::days(29)).await;
        f.cache.load_auth_state().await.unwrap();
        assert!(f.cache.get_access_token().await.unwrap().is_some());

        f.clock.advance(Duration::days(2));

        assert!(f.cache.get_access_token().await.unwrap().is_none());
        assert_eq!(f.cache.state().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_refresh_access_token() {
        let f = fixture(true);
        f.cache.sign_in("ana@example.com", "secret").await.unwrap();
        let old = f.cache.get_access_token().await.unwrap().unwrap();
        f.api.revoke_all();

        let fresh = f.cache.refresh_access_token().await.unwrap();

        assert_ne!(fresh, old);
        assert_eq!(f.cache.get_access_token().await.unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_session() {
        let f = fixture(true);
        f.cache.sign_in("ana@example.com", "secret").await.unwrap();
        f.api.revoke_refresh_tokens();

        let err = f.cache.refresh_access_token().await.unwrap_err();

        assert!(matches!(err, Error::Unauthenticated(_)));
        assert_eq!(f.cache.state().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_unreachable_refresh_keeps_session() {
        let f = fixture(true);
        f.cache.sign_in("ana@example.com", "secret").await.unwrap();
        f.api.set_reachable(false);

        let err = f.cache.refresh_access_token().await.unwrap_err();

        assert!(err.is_unreachable());
        assert_eq!(f.cache.state().await, AuthState::AuthenticatedOnline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_during_refresh_discards_new_tokens() {
        let f = fixture(true);
        f.cache.sign_in("ana@example.com", "secret").await.unwrap();
        f.api.set_refresh_delay(std::time::Duration::from_millis(50));

        let (refreshed, ()) = tokio::join!(f.cache.refresh_access_token(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            f.cache.sign_out().await.unwrap();
        });

        assert!(matches!(refreshed, Err(Error::Unauthenticated(_))));
        assert_eq!(f.api.call_count("refresh"), 1);
        assert_eq!(f.cache.state().await, AuthState::Unauthenticated);
        assert!(f.cache.get_access_token().await.unwrap().is_none());
        assert!(stored(&f, ACCESS_TOKEN_KEY).await.is_none());
        assert!(stored(&f, REFRESH_TOKEN_KEY).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_sign_in_during_refresh_wins() {
        let f = fixture(true);
        f.cache.sign_in("ana@example.com", "secret").await.unwrap();
        f.api.set_refresh_delay(std::time::Duration::from_millis(50));

        let (refreshed, signed_in) = tokio::join!(f.cache.refresh_access_token(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            f.cache.sign_in("ana@example.com", "secret").await
        });

        assert!(refreshed.is_err());
        signed_in.unwrap();
        let token = f.cache.get_access_token().await.unwrap().unwrap();
        assert_eq!(stored(&f, ACCESS_TOKEN_KEY).await.as_deref(), Some(token.expose()));
        assert_eq!(f.cache.state().await, AuthState::AuthenticatedOnline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_refresh_rejection_keeps_new_session() {
        let f = fixture(true);
        f.cache.sign_in("ana@example.com", "secret").await.unwrap();
        f.api.revoke_refresh_tokens();
        f.api.set_refresh_delay(std::time::Duration::from_millis(50));

        let (refreshed, signed_in) = tokio::join!(f.cache.refresh_access_token(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            f.cache.sign_in("ana@example.com", "secret").await
        });

        assert!(matches!(refreshed, Err(Error::Unauthenticated(_))));
        signed_in.unwrap();
        assert_eq!(f.cache.state().await, AuthState::AuthenticatedOnline);
        assert!(stored(&f, ACCESS_TOKEN_KEY).await.is_some());
    }

    #[tokio::test]
    async fn test_complete_onboarding() {
        let f = fixture(true);
        f.cache.sign_in("ana@example.com", "secret").await.unwrap();

        let user = f.cache.complete_onboarding().await.unwrap();

        assert!(user.has_completed_onboarding);
        assert!(f.api.is_onboarded("u1"));
        let stored = CredentialStore::new(Arc::new(f.kv.clone()))
            .load()
            .await
            .unwrap();
        assert!(stored.user.unwrap().has_completed_onboarding);
        assert!(f.cache.snapshot().await.has_completed_onboarding);
    }

    #[tokio::test]
    async fn test_online_only_operations_fail_offline() {
        let f = fixture(false);
        assert!(matches!(
            f.cache.sign_up("new@example.com", "pw", "New").await,
            Err(Error::Offline)
        ));
        assert!(matches!(
            f.cache.reset_password("ana@example.com").await,
            Err(Error::Offline)
        ));

        f.net.set_online(true);
        f.cache.reset_password("ana@example.com").await.unwrap();
        assert_eq!(f.api.reset_requests(), vec!["ana@example.com"]);
    }

    #[tokio::test]
    async fn test_provider_sign_in() {
        let f = fixture(true);
        let authorization = f.cache.provider_authorization(OAuthProvider::Google).unwrap();
        let grant = authorization
            .grant("auth-code", &authorization.csrf_state.clone(), None)
            .unwrap();

        let user = f
            .cache
            .sign_in_with_provider(OAuthProvider::Google, &grant)
            .await
            .unwrap();

        assert_eq!(user.id, "u1");
        assert_eq!(f.api.calls(), vec!["google"]);
        assert!(f.cache.provider_authorization(OAuthProvider::Apple).is_err());
    }

    #[tokio::test]
    async fn test_record_sync_persists_on_user() {
        let f = fixture(true);
        f.cache.sign_in("ana@example.com", "secret").await.unwrap();
        let at = now() + Duration::minutes(5);

        f.cache.record_sync(at).await.unwrap();

        assert_eq!(f.cache.user().await.unwrap().last_synced_at, Some(at));
        let stored = CredentialStore::new(Arc::new(f.kv.clone()))
            .load()
            .await
            .unwrap();
        assert_eq!(stored.user.unwrap().last_synced_at, Some(at));
    }

    #[tokio::test]
    async fn test_custom_offline_window() {
        let config = AuthConfig::default().with_offline_policy(OfflineAuthPolicy::new(7));
        let f = fixture_with(false, config);
        seed(&f, Duration::days(8)).await;
        assert_eq!(
            f.cache.load_auth_state().await.unwrap(),
            AuthState::Unauthenticated
        );
    }
}
