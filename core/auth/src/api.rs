//! MusicHub auth API client.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use musichub_common::{client_platform, Error, Result, SecretToken};
use musichub_platform::http::{
    build_client, check_status, parse_base_url, read_json, transport_error,
    CLIENT_PLATFORM_HEADER,
};

use crate::provider::{OAuthProvider, ProviderGrant};
use crate::session::AuthUser;

/// Body returned by every credential exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: SecretToken,
    #[serde(default)]
    pub refresh_token: Option<SecretToken>,
    pub user: AuthUser,
}

/// Body returned by `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: SecretToken,
    #[serde(default)]
    pub refresh_token: Option<SecretToken>,
}

/// Remote auth operations used by the session cache.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// `POST /auth/login`.
    async fn login(&self, email: &str, password: &str) -> Result<AuthResponse>;

    /// `POST /auth/register`.
    async fn register(&self, email: &str, password: &str, name: &str) -> Result<AuthResponse>;

    /// `POST /auth/google` or `POST /auth/apple`.
    async fn provider_sign_in(
        &self,
        provider: OAuthProvider,
        grant: &ProviderGrant,
    ) -> Result<AuthResponse>;

    /// `GET /auth/validate`.
    ///
    /// # Postconditions
    /// - `Ok(true)` on 2xx, `Ok(false)` when the server rejects the token
    ///
    /// # Errors
    /// - Transport failures and 5xx, which callers treat as "could not check"
    async fn validate(&self, access_token: &SecretToken) -> Result<bool>;

    /// `POST /auth/refresh`.
    async fn refresh(&self, refresh_token: &SecretToken) -> Result<RefreshResponse>;

    /// `POST /auth/logout`.
    async fn logout(&self, access_token: &SecretToken) -> Result<()>;

    /// `POST /auth/reset-password`.
    async fn reset_password(&self, email: &str) -> Result<()>;

    /// `POST /users/complete-onboarding`.
    async fn complete_onboarding(&self, access_token: &SecretToken) -> Result<()>;
}

/// [`AuthApi`] over HTTPS.
pub struct HttpAuthApi {
    http: Client,
    base_url: Url,
}

impl HttpAuthApi {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a client rooted at `base_url`.
    ///
    /// # Errors
    /// - Invalid base URL
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
            base_url: parse_base_url(base_url)?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint '{}': {}", path, e)))
    }

    fn post(&self, path: &str) -> Result<RequestBuilder> {
        Ok(self
            .http
            .post(self.endpoint(path)?)
            .header(CLIENT_PLATFORM_HEADER, client_platform()))
    }

    async fn send(&self, context: &str, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(context, e))?;
        check_status(response).await
    }

    async fn exchange(&self, context: &str, request: RequestBuilder) -> Result<AuthResponse> {
        let response = self.send(context, request).await?;
        read_json(response).await
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let request = self
            .post("auth/login")?
            .json(&json!({ "email": email, "password": password }));
        self.exchange("Login failed", request).await
    }

    async fn register(&self, email: &str, password: &str, name: &str) -> Result<AuthResponse> {
        let request = self
            .post("auth/register")?
            .json(&json!({ "email": email, "password": password, "name": name }));
        self.exchange("Registration failed", request).await
    }

    async fn provider_sign_in(
        &self,
        provider: OAuthProvider,
        grant: &ProviderGrant,
    ) -> Result<AuthResponse> {
        let request = self
            .post(provider.endpoint())?
            .json(&provider_body(grant));
        self.exchange(&format!("{} sign-in failed", provider), request)
            .await
    }

    async fn validate(&self, access_token: &SecretToken) -> Result<bool> {
        let response = self
            .http
            .get(self.endpoint("auth/validate")?)
            .header(CLIENT_PLATFORM_HEADER, client_platform())
            .bearer_auth(access_token.expose())
            .send()
            .await
            .map_err(|e| transport_error("Token validation failed", e))?;

        let status = response.status();
        debug!("Token validation returned {}", status);
        if status.is_success() {
            Ok(true)
        } else if status.is_server_error() {
            check_status(response).await.map(|_| false)
        } else {
            Ok(false)
        }
    }

    async fn refresh(&self, refresh_token: &SecretToken) -> Result<RefreshResponse> {
        let request = self
            .post("auth/refresh")?
            .json(&json!({ "refreshToken": refresh_token.expose() }));
        let response = self.send("Token refresh failed", request).await?;
        read_json(response).await
    }

    async fn logout(&self, access_token: &SecretToken) -> Result<()> {
        let request = self.post("auth/logout")?.bearer_auth(access_token.expose());
        self.send("Logout failed", request).await.map(|_| ())
    }

    async fn reset_password(&self, email: &str) -> Result<()> {
        let request = self
            .post("auth/reset-password")?
            .json(&json!({ "email": email }));
        self.send("Password reset failed", request).await.map(|_| ())
    }

    async fn complete_onboarding(&self, access_token: &SecretToken) -> Result<()> {
        let request = self
            .post("users/complete-onboarding")?
            .bearer_auth(access_token.expose());
        self.send("Onboarding update failed", request)
            .await
            .map(|_| ())
    }
}

/// JSON body for `POST /auth/{provider}`.
fn provider_body(grant: &ProviderGrant) -> Value {
    let mut body = json!({
        "code": grant.code,
        "redirectUri": grant.redirect_uri,
    });
    if let Some(id_token) = &grant.id_token {
        body["idToken"] = json!(id_token);
    }
    if let Some(verifier) = &grant.code_verifier {
        body["codeVerifier"] = json!(verifier.expose());
    }
    body
}
