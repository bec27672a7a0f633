//! Wiring of the core components.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use musichub_auth::{AuthState, HttpAuthApi, SessionCache};
use musichub_platform::{Connectivity, HttpConnectivity, KeyValueStore, SqliteKeyValueStore};
use musichub_store::LocalStore;
use musichub_sync::{HttpSyncTransport, SyncEngine};

use crate::config::CoreConfig;

pub const STORE_FILE: &str = "store.db";
pub const SESSION_FILE: &str = "session.db";

/// Long-lived components, built once and shared by reference count.
pub struct Services {
    pub config: CoreConfig,
    pub store: Arc<LocalStore>,
    pub connectivity: Arc<dyn Connectivity>,
    pub session: Arc<SessionCache>,
    pub engine: Arc<SyncEngine>,
}

impl Services {
    /// Open the databases under `data_dir` and restore the session.
    pub async fn open(data_dir: &Path, config: CoreConfig) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;

        let kv: Arc<dyn KeyValueStore> = Arc::new(
            SqliteKeyValueStore::open(data_dir.join(SESSION_FILE))
                .context("Failed to open session storage")?,
        );
        let store = Arc::new(
            LocalStore::open_app(data_dir.join(STORE_FILE))
                .context("Failed to open local store")?,
        );
        let connectivity: Arc<dyn Connectivity> = Arc::new(
            HttpConnectivity::new(config.probe_url(), HttpConnectivity::DEFAULT_TIMEOUT)
                .context("Invalid connectivity probe URL")?,
        );

        let api = HttpAuthApi::new(&config.api_url, config.request_timeout())
            .context("Invalid API URL")?;
        let session = Arc::new(SessionCache::new(
            Arc::new(api),
            kv.clone(),
            connectivity.clone(),
            config.auth.clone(),
        ));
        let state = session
            .load_auth_state()
            .await
            .context("Failed to restore session")?;
        if state != AuthState::Unauthenticated {
            info!("Session restored ({})", state.as_str());
        }

        let transport = HttpSyncTransport::new(&config.api_url, HttpSyncTransport::DEFAULT_TIMEOUT)
            .context("Invalid API URL")?;
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            Arc::new(transport),
            session.clone(),
            connectivity.clone(),
            kv,
            config.sync.clone(),
        ));

        Ok(Self {
            config,
            store,
            connectivity,
            session,
            engine,
        })
    }
}
