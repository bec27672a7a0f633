//! Shared HTTP plumbing for the auth and sync clients.

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use musichub_common::{Error, Result};

/// Header identifying the client platform on every API request.
pub const CLIENT_PLATFORM_HEADER: &str = "X-Client-Platform";

/// Build the HTTP client used for API calls.
///
/// # Errors
/// - TLS backend initialization failure
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(concat!("MusicHub/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))
}

/// Parse an API base URL so that relative joins keep its path.
///
/// # Errors
/// - `InvalidInput` for a malformed URL
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url =
        Url::parse(raw).map_err(|e| Error::InvalidInput(format!("Invalid API URL: {}", e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Map a failed send to `ServerUnreachable`.
pub fn transport_error(context: &str, e: reqwest::Error) -> Error {
    Error::ServerUnreachable(format!("{}: {}", context, e))
}

/// Pass through 2xx responses; turn everything else into `ServerRejected`
/// carrying the server's message.
pub async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::ServerRejected {
        status: status.as_u16(),
        message: error_message(status, &body),
    })
}

/// Decode a JSON body.
pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    response.json().await.map_err(|e| {
        if e.is_decode() {
            Error::Serialization(format!("Malformed response: {}", e))
        } else {
            transport_error("Failed to read response", e)
        }
    })
}

/// Prefer `{"error": ..}` or `{"message": ..}` from a JSON body, then the raw
/// body, then the status reason.
pub fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error", "message"] {
            if let Some(text) = map.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }

    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("Unknown error")
        .to_string()
}
