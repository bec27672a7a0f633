//! Connectivity oracle.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;
use url::Url;

use musichub_common::{Error, Result};

use crate::http::build_client;

/// Answers "is the device online right now?".
///
/// Queried on demand before each automatic sync and by the session cache
/// during cold start. Transitions are delivered separately to the scheduler
/// as events.
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Whether the network is currently reachable.
    async fn is_online(&self) -> bool;
}

/// Connectivity flag set by the host platform (or a test).
#[derive(Debug)]
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    /// Create with an initial state.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Update the reported state.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connectivity for StaticConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Probe-based connectivity check.
///
/// Any HTTP response from the probe URL counts as online; only transport
/// failures and timeouts count as offline.
pub struct HttpConnectivity {
    http: Client,
    probe_url: Url,
}

impl HttpConnectivity {
    /// Default probe timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a probe against `probe_url`.
    ///
    /// # Errors
    /// - Invalid URL
    /// - HTTP client construction failure
    pub fn new(probe_url: &str, timeout: Duration) -> Result<Self> {
        let probe_url = Url::parse(probe_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid probe URL: {}", e)))?;
        let http = build_client(timeout)?;
        Ok(Self { http, probe_url })
    }
}

#[async_trait]
impl Connectivity for HttpConnectivity {
    async fn is_online(&self) -> bool {
        match self.http.head(self.probe_url.clone()).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Connectivity probe failed: {}", e);
                false
            }
        }
    }
}
