//! Third-party sign-in with Google and Apple.
//!
//! The app opens the provider's authorization page, receives an
//! authorization code on its redirect URI and hands that code to the
//! MusicHub API, which performs the token exchange server-side. Only the
//! first leg (building the authorization URL with PKCE and CSRF state)
//! happens here.

use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use musichub_common::{Error, Result, SecretToken};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const APPLE_AUTH_URL: &str = "https://appleid.apple.com/auth/authorize";

/// Supported identity providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    Apple,
}

impl OAuthProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Apple => "apple",
        }
    }

    /// MusicHub API path that accepts this provider's grant.
    pub fn endpoint(self) -> &'static str {
        match self {
            OAuthProvider::Google => "auth/google",
            OAuthProvider::Apple => "auth/apple",
        }
    }

    fn authorize_url(self) -> &'static str {
        match self {
            OAuthProvider::Google => GOOGLE_AUTH_URL,
            OAuthProvider::Apple => APPLE_AUTH_URL,
        }
    }

    fn scopes(self) -> &'static [&'static str] {
        match self {
            OAuthProvider::Google => &["openid", "profile", "email"],
            OAuthProvider::Apple => &["email", "name"],
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OAuthProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(OAuthProvider::Google),
            "apple" => Ok(OAuthProvider::Apple),
            other => Err(Error::InvalidInput(format!(
                "Unknown sign-in provider: {}",
                other
            ))),
        }
    }
}

/// App registration with a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub client_id: String,
    pub redirect_url: String,
}

impl ProviderConfig {
    pub fn new(client_id: impl Into<String>, redirect_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_url: redirect_url.into(),
        }
    }

    /// Build the authorization URL for `provider`.
    ///
    /// # Errors
    /// - `InvalidInput` for a malformed redirect URL
    pub fn authorize(&self, provider: OAuthProvider) -> Result<ProviderAuthorization> {
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(provider.authorize_url().to_string())
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(self.redirect_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            );

        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = client.authorize_url(CsrfToken::new_random);
        for scope in provider.scopes() {
            request = request.add_scope(Scope::new(scope.to_string()));
        }
        if provider == OAuthProvider::Apple {
            // Apple only returns name/email scopes to form_post redirects.
            request = request.add_extra_param("response_mode", "form_post");
        }
        let (url, csrf_state) = request.set_pkce_challenge(challenge).url();

        Ok(ProviderAuthorization {
            provider,
            url: url.to_string(),
            csrf_state: csrf_state.secret().clone(),
            pkce_verifier: SecretToken::new(verifier.secret().clone())?,
            redirect_uri: self.redirect_url.clone(),
        })
    }
}

/// A prepared authorization request.
#[derive(Debug, Clone)]
pub struct ProviderAuthorization {
    pub provider: OAuthProvider,
    /// Page to open in the browser.
    pub url: String,
    /// Must match the `state` parameter on the redirect.
    pub csrf_state: String,
    pub pkce_verifier: SecretToken,
    pub redirect_uri: String,
}

impl ProviderAuthorization {
    /// Turn the code received on the redirect into a grant for the API.
    ///
    /// # Errors
    /// - `InvalidInput` when `state` does not match the request
    pub fn grant(
        &self,
        code: impl Into<String>,
        state: &str,
        id_token: Option<String>,
    ) -> Result<ProviderGrant> {
        if state != self.csrf_state {
            return Err(Error::InvalidInput(
                "Authorization state mismatch".to_string(),
            ));
        }
        Ok(ProviderGrant {
            code: code.into(),
            redirect_uri: self.redirect_uri.clone(),
            id_token,
            code_verifier: Some(self.pkce_verifier.clone()),
        })
    }
}

/// What the API needs to complete a provider sign-in.
#[derive(Debug, Clone)]
pub struct ProviderGrant {
    pub code: String,
    pub redirect_uri: String,
    /// Apple's identity token, when the redirect carried one.
    pub id_token: Option<String>,
    pub code_verifier: Option<SecretToken>,
}

impl ProviderGrant {
    /// A grant obtained outside this crate (e.g. by a native SDK).
    pub fn new(code: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            redirect_uri: redirect_uri.into(),
            id_token: None,
            code_verifier: None,
        }
    }

    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig::new("client-123", "musichub://oauth/callback")
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("Google".parse::<OAuthProvider>().unwrap(), OAuthProvider::Google);
        assert_eq!("apple".parse::<OAuthProvider>().unwrap(), OAuthProvider::Apple);
        assert!("facebook".parse::<OAuthProvider>().is_err());
    }

    #[test]
    fn test_google_authorization_url() {
        let auth = config().authorize(OAuthProvider::Google).unwrap();
        let url = url::Url::parse(&auth.url).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("accounts.google.com"));
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(params["redirect_uri"], "musichub://oauth/callback");
        assert_eq!(params["scope"], "openid profile email");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["state"], auth.csrf_state);
        assert!(!params.contains_key("response_mode"));
    }

    #[test]
    fn test_apple_uses_form_post() {
        let auth = config().authorize(OAuthProvider::Apple).unwrap();
        assert!(auth.url.starts_with(APPLE_AUTH_URL));
        assert!(auth.url.contains("response_mode=form_post"));
    }

    #[test]
    fn test_grant_checks_state() {
        let auth = config().authorize(OAuthProvider::Google).unwrap();
        assert!(auth.grant("code", "forged", None).is_err());

        let grant = auth.grant("code", &auth.csrf_state.clone(), None).unwrap();
        assert_eq!(grant.code, "code");
        assert_eq!(grant.redirect_uri, "musichub://oauth/callback");
        assert_eq!(
            grant.code_verifier.unwrap().expose(),
            auth.pkce_verifier.expose()
        );
    }

    #[test]
    fn test_invalid_redirect_rejected() {
        let bad = ProviderConfig::new("client", "not a url");
        assert!(bad.authorize(OAuthProvider::Google).is_err());
    }
}
