//! Sync endpoint client.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use musichub_common::{client_platform, Error, Result, SecretToken};
use musichub_platform::http::{
    build_client, check_status, parse_base_url, read_json, transport_error,
    CLIENT_PLATFORM_HEADER,
};
use musichub_store::ChangeSet;

/// Body of `POST /sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// `null` asks for everything.
    pub last_pulled_at: Option<i64>,
    pub relations: Vec<String>,
}

/// Answer to `POST /sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(default)]
    pub changes: ChangeSet,
    /// Server time the changes are current as of, in milliseconds.
    pub timestamp: i64,
}

/// Body of `PUT /sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: ChangeSet,
    pub last_pulled_at: Option<i64>,
}

/// The remote half of a sync cycle.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetch changes since `request.last_pulled_at`.
    async fn pull(&self, token: &SecretToken, request: &PullRequest) -> Result<PullResponse>;

    /// Send local changes.
    ///
    /// # Errors
    /// - `ValidationConflict` when the server refuses the change set
    async fn push(&self, token: &SecretToken, request: &PushRequest) -> Result<()>;
}

/// [`SyncTransport`] against the MusicHub `/sync` endpoint.
pub struct HttpSyncTransport {
    http: Client,
    endpoint: Url,
}

impl HttpSyncTransport {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// # Errors
    /// - Invalid base URL
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let endpoint = parse_base_url(base_url)?
            .join("sync")
            .map_err(|e| Error::InvalidInput(format!("Invalid sync endpoint: {}", e)))?;
        Ok(Self {
            http: build_client(timeout)?,
            endpoint,
        })
    }

    fn authorized(&self, request: RequestBuilder, token: &SecretToken) -> RequestBuilder {
        request
            .bearer_auth(token.expose())
            .header(CLIENT_PLATFORM_HEADER, client_platform())
    }

    async fn send(&self, context: &str, request: RequestBuilder) -> Result<Response> {
        request.send().await.map_err(|e| transport_error(context, e))
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn pull(&self, token: &SecretToken, request: &PullRequest) -> Result<PullResponse> {
        debug!("Pulling changes since {:?}", request.last_pulled_at);
        let builder = self.authorized(self.http.post(self.endpoint.clone()), token);
        let response = self.send("Pull failed", builder.json(request)).await?;
        let response = check_status(response).await?;
        read_json(response).await
    }

    async fn push(&self, token: &SecretToken, request: &PushRequest) -> Result<()> {
        debug!("Pushing {} records", request.changes.record_count());
        let builder = self.authorized(self.http.put(self.endpoint.clone()), token);
        let response = self.send("Push failed", builder.json(request)).await?;
        check_status(response)
            .await
            .map(|_| ())
            .map_err(push_rejection)
    }
}

/// 409 and 422 on push mean the change set itself was refused.
pub(crate) fn push_rejection(error: Error) -> Error {
    match error {
        Error::ServerRejected { status, message }
            if status == StatusCode::CONFLICT.as_u16()
                || status == StatusCode::UNPROCESSABLE_ENTITY.as_u16() =>
        {
            Error::ValidationConflict(message)
        }
        other => other,
    }
}
