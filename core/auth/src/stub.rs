//! Scriptable in-process [`AuthApi`] for tests and offline development.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use musichub_common::{Error, Result, SecretToken};

use crate::api::{AuthApi, AuthResponse, RefreshResponse};
use crate::provider::{OAuthProvider, ProviderGrant};
use crate::session::{AuthUser, UserRole};

#[derive(Default)]
struct StubState {
    /// Lowercased email -> (password, user).
    accounts: HashMap<String, (String, AuthUser)>,
    provider_users: HashMap<OAuthProvider, AuthUser>,
    /// Token -> user id.
    access_tokens: HashMap<String, String>,
    refresh_tokens: HashMap<String, String>,
    unreachable: bool,
    refresh_delay: Option<Duration>,
    issued: u64,
    calls: Vec<&'static str>,
    reset_requests: Vec<String>,
    onboarded: HashSet<String>,
}

impl StubState {
    fn record(&mut self, call: &'static str) -> Result<()> {
        self.calls.push(call);
        if self.unreachable {
            return Err(Error::ServerUnreachable(format!(
                "{}: connection refused",
                call
            )));
        }
        Ok(())
    }

    fn issue(&mut self, user_id: &str) -> Result<(SecretToken, SecretToken)> {
        self.issued += 1;
        let access = format!("access-{}", self.issued);
        let refresh = format!("refresh-{}", self.issued);
        self.access_tokens.insert(access.clone(), user_id.to_string());
        self.refresh_tokens.insert(refresh.clone(), user_id.to_string());
        Ok((SecretToken::new(access)?, SecretToken::new(refresh)?))
    }

    fn respond(&mut self, user: AuthUser) -> Result<AuthResponse> {
        let (access_token, refresh_token) = self.issue(&user.id)?;
        Ok(AuthResponse {
            access_token,
            refresh_token: Some(refresh_token),
            user,
        })
    }

    fn authorize(&self, token: &SecretToken) -> Result<String> {
        self.access_tokens
            .get(token.expose())
            .cloned()
            .ok_or_else(rejected)
    }
}

fn rejected() -> Error {
    Error::ServerRejected {
        status: 401,
        message: "Invalid token".to_string(),
    }
}

/// Auth server double.
///
/// Tokens are issued as `access-N` / `refresh-N`. Refreshing rotates both.
/// While unreachable every call fails with `ServerUnreachable` but is still
/// recorded in [`calls`](Self::calls).
#[derive(Default)]
pub struct StubAuthApi {
    state: Mutex<StubState>,
}

impl StubAuthApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account that can sign in with `password`.
    pub fn with_account(self, password: &str, user: AuthUser) -> Self {
        self.lock()
            .accounts
            .insert(user.email.to_lowercase(), (password.to_string(), user));
        self
    }

    /// User returned for any grant from `provider`.
    pub fn with_provider_user(self, provider: OAuthProvider, user: AuthUser) -> Self {
        self.lock().provider_users.insert(provider, user);
        self
    }

    /// Issue a valid token pair for `user_id` outside of any call.
    pub fn issue_tokens(&self, user_id: &str) -> Result<(SecretToken, SecretToken)> {
        self.lock().issue(user_id)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Hold every refresh answer back for `delay`.
    pub fn set_refresh_delay(&self, delay: Duration) {
        self.lock().refresh_delay = Some(delay);
    }

    /// Invalidate one access token.
    pub fn revoke(&self, token: &str) {
        self.lock().access_tokens.remove(token);
    }

    /// Invalidate every access token. Refresh tokens stay valid.
    pub fn revoke_all(&self) {
        self.lock().access_tokens.clear();
    }

    /// Invalidate every refresh token.
    pub fn revoke_refresh_tokens(&self) {
        self.lock().refresh_tokens.clear();
    }

    /// Names of the calls received, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    pub fn reset_requests(&self) -> Vec<String> {
        self.lock().reset_requests.clone()
    }

    pub fn is_onboarded(&self, user_id: &str) -> bool {
        self.lock().onboarded.contains(user_id)
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl AuthApi for StubAuthApi {
    async fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let mut state = self.lock();
        state.record("login")?;
        let user = match state.accounts.get(&email.trim().to_lowercase()) {
            Some((expected, user)) if expected == password => user.clone(),
            _ => {
                return Err(Error::ServerRejected {
                    status: 401,
                    message: "Invalid email or password".to_string(),
                })
            }
        };
        state.respond(user)
    }

    async fn register(&self, email: &str, password: &str, name: &str) -> Result<AuthResponse> {
        let mut state = self.lock();
        state.record("register")?;
        let key = email.trim().to_lowercase();
        if state.accounts.contains_key(&key) {
            return Err(Error::ServerRejected {
                status: 409,
                message: "Email already registered".to_string(),
            });
        }

        let user = AuthUser {
            id: format!("user-{}", state.accounts.len() + 1),
            email: email.trim().to_string(),
            name: name.to_string(),
            username: None,
            role: UserRole::Fan,
            avatar_url: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
            has_completed_onboarding: false,
            last_synced_at: None,
        };
        state
            .accounts
            .insert(key, (password.to_string(), user.clone()));
        state.respond(user)
    }

    async fn provider_sign_in(
        &self,
        provider: OAuthProvider,
        grant: &ProviderGrant,
    ) -> Result<AuthResponse> {
        let mut state = self.lock();
        state.record(match provider {
            OAuthProvider::Google => "google",
            OAuthProvider::Apple => "apple",
        })?;
        if grant.code.is_empty() {
            return Err(Error::ServerRejected {
                status: 400,
                message: "Missing authorization code".to_string(),
            });
        }
        let user = state
            .provider_users
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::ServerRejected {
                status: 401,
                message: format!("Failed to authenticate with {}", provider),
            })?;
        state.respond(user)
    }

    async fn validate(&self, access_token: &SecretToken) -> Result<bool> {
        let mut state = self.lock();
        state.record("validate")?;
        Ok(state.access_tokens.contains_key(access_token.expose()))
    }

    async fn refresh(&self, refresh_token: &SecretToken) -> Result<RefreshResponse> {
        let delay = self.lock().refresh_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.record("refresh")?;
        let user_id = state
            .refresh_tokens
            .remove(refresh_token.expose())
            .ok_or_else(rejected)?;
        let (access_token, refresh_token) = state.issue(&user_id)?;
        Ok(RefreshResponse {
            access_token,
            refresh_token: Some(refresh_token),
        })
    }

    async fn logout(&self, access_token: &SecretToken) -> Result<()> {
        let mut state = self.lock();
        state.record("logout")?;
        state.access_tokens.remove(access_token.expose());
        Ok(())
    }

    async fn reset_password(&self, email: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("reset_password")?;
        state.reset_requests.push(email.to_string());
        Ok(())
    }

    async fn complete_onboarding(&self, access_token: &SecretToken) -> Result<()> {
        let mut state = self.lock();
        state.record("complete_onboarding")?;
        let user_id = state.authorize(access_token)?;
        state.onboarded.insert(user_id);
        Ok(())
    }
}
