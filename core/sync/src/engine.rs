//! Core sync engine: one pull/push round per call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use musichub_auth::SessionCache;
use musichub_common::{Clock, Error, Result, SecretToken, SystemClock};
use musichub_platform::{Connectivity, KeyValueStore};
use musichub_store::{ConflictStrategy, LocalStore};

use crate::cursor::SyncCursor;
use crate::state::{SyncFailure, SyncResult};
use crate::transport::{PullRequest, PullResponse, PushRequest, SyncTransport};

/// Configuration for the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How pulled rows are merged into locally modified ones.
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    /// Relations pulled when a call does not name any. Empty means all.
    #[serde(default)]
    pub default_relations: Vec<String>,
}

impl SyncConfig {
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_default_relations(mut self, relations: Vec<String>) -> Self {
        self.default_relations = relations;
        self
    }
}

/// Progress callback, called with a fraction in `0.0..=1.0`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// Per-call options.
#[derive(Clone, Default)]
pub struct SyncOptions {
    /// Skip the connectivity check.
    pub force: bool,
    /// Restrict the pull to these tables.
    pub relations: Option<Vec<String>>,
    pub on_progress: Option<ProgressFn>,
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_relations<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relations = Some(relations.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_progress(mut self, on_progress: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    fn report(&self, fraction: f32) {
        if let Some(on_progress) = &self.on_progress {
            on_progress(fraction);
        }
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("force", &self.force)
            .field("relations", &self.relations)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// What the engine needs from the session owner.
#[async_trait]
pub trait SessionAccess: Send + Sync {
    async fn access_token(&self) -> Result<Option<SecretToken>>;

    /// Obtain a new access token after the server rejected the current one.
    async fn refresh_access_token(&self) -> Result<SecretToken>;

    /// Note the end of a successful sync.
    async fn record_sync(&self, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
impl SessionAccess for SessionCache {
    async fn access_token(&self) -> Result<Option<SecretToken>> {
        self.get_access_token().await
    }

    async fn refresh_access_token(&self) -> Result<SecretToken> {
        SessionCache::refresh_access_token(self).await
    }

    async fn record_sync(&self, at: DateTime<Utc>) -> Result<()> {
        SessionCache::record_sync(self, at).await
    }
}

/// Counts from one completed round.
struct RoundStats {
    pulled: usize,
    pushed: usize,
}

/// Reconciles the local store with the server.
///
/// Each [`sync`](Self::sync) call is a single attempt with no internal
/// retry. Callers that need a schedule use the
/// [`SyncScheduler`](crate::scheduler::SyncScheduler).
pub struct SyncEngine {
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    session: Arc<dyn SessionAccess>,
    connectivity: Arc<dyn Connectivity>,
    cursor: SyncCursor,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncEngine {
    /// Create an engine. The cursor is kept in `kv`.
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        session: Arc<dyn SessionAccess>,
        connectivity: Arc<dyn Connectivity>,
        kv: Arc<dyn KeyValueStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            transport,
            session,
            connectivity,
            cursor: SyncCursor::new(kv),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    pub fn connectivity(&self) -> &Arc<dyn Connectivity> {
        &self.connectivity
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether the session currently holds an access token.
    pub async fn is_signed_in(&self) -> bool {
        match self.session.access_token().await {
            Ok(token) => token.is_some(),
            Err(e) => {
                warn!("Could not read session token: {}", e);
                false
            }
        }
    }

    /// Run one pull/push round.
    ///
    /// # Postconditions
    /// - On failure the cursor is unchanged and unpushed changes stay in the
    ///   journal
    /// - Expected failures (offline, auth, server) are reported in the result
    ///
    /// # Errors
    /// - Local store or key-value store failures
    pub async fn sync(&self, options: SyncOptions) -> Result<SyncResult> {
        options.report(0.0);

        if !options.force && !self.connectivity.is_online().await {
            debug!("Skipping sync: device is offline");
            return Ok(SyncResult::failed(SyncFailure::Offline, self.clock.now()));
        }

        info!("Starting sync");
        match self.round(&options).await {
            Ok(stats) => {
                let completed_at = self.clock.now();
                if let Err(e) = self.session.record_sync(completed_at).await {
                    warn!("Could not record sync time on session: {}", e);
                }
                options.report(1.0);
                info!(
                    "Sync completed: {} pulled, {} pushed",
                    stats.pulled, stats.pushed
                );
                Ok(SyncResult::succeeded(completed_at, stats.pulled, stats.pushed))
            }
            Err(e) => match SyncFailure::classify(e) {
                Ok(failure) => {
                    warn!("Sync failed: {}", failure);
                    Ok(SyncResult::failed(failure, self.clock.now()))
                }
                Err(e) => {
                    error!("Sync aborted: {}", e);
                    Err(e)
                }
            },
        }
    }

    async fn round(&self, options: &SyncOptions) -> Result<RoundStats> {
        let mut token = self
            .session
            .access_token()
            .await?
            .ok_or_else(|| Error::Unauthenticated("Not signed in".to_string()))?;
        let relations = self.relations(options)?;
        let last_pulled_at = self.cursor.last_pulled_at().await?;

        // Pull, then apply before anything else touches the cursor.
        let request = PullRequest {
            last_pulled_at,
            relations,
        };
        let response = self.pull(&mut token, &request).await?;
        let pulled = response.changes.upsert_count();
        let applied = self
            .store
            .apply_remote_changes(&response.changes, self.config.conflict_strategy)?;
        debug!("Applied pulled changes: {:?}", applied);
        options.report(0.5);

        // Push whatever is pending at this point; later edits wait.
        let snapshot = self.store.pending_changes()?;
        let pushed = if snapshot.is_empty() {
            debug!("Nothing to push");
            0
        } else {
            let request = PushRequest {
                changes: snapshot.changes.clone(),
                last_pulled_at: Some(response.timestamp),
            };
            self.push(&mut token, &request).await?;
            self.store.mark_synced(&snapshot)?;
            snapshot.record_count()
        };

        self.cursor.advance(response.timestamp).await?;
        Ok(RoundStats { pulled, pushed })
    }

    async fn pull(&self, token: &mut SecretToken, request: &PullRequest) -> Result<PullResponse> {
        match self.transport.pull(token, request).await {
            Err(e) if e.is_auth_rejection() => {
                *token = self.reauthorize().await?;
                self.transport.pull(token, request).await
            }
            other => other,
        }
    }

    async fn push(&self, token: &mut SecretToken, request: &PushRequest) -> Result<()> {
        match self.transport.push(token, request).await {
            Err(e) if e.is_auth_rejection() => {
                *token = self.reauthorize().await?;
                self.transport.push(token, request).await
            }
            other => other,
        }
    }

    async fn reauthorize(&self) -> Result<SecretToken> {
        info!("Access token rejected, refreshing");
        self.session.refresh_access_token().await
    }

    fn relations(&self, options: &SyncOptions) -> Result<Vec<String>> {
        let relations = options
            .relations
            .clone()
            .unwrap_or_else(|| self.config.default_relations.clone());
        let schema = self.store.schema();
        if let Some(unknown) = relations.iter().find(|r| schema.get(r).is_none()) {
            return Err(Error::InvalidInput(format!("Unknown relation '{}'", unknown)));
        }
        Ok(relations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySyncServer;
    use chrono::TimeZone;
    use musichub_auth::{AuthConfig, AuthUser, StubAuthApi, UserRole};
    use musichub_common::FixedClock;
    use musichub_platform::{MemoryKeyValueStore, StaticConnectivity};
    use musichub_store::{app_schema, Playlist, RecordStatus, Row};
    use serde_json::json;
    use std::sync::Mutex;

    struct Fixture {
        store: Arc<LocalStore>,
        server: Arc<MemorySyncServer>,
        auth: Arc<StubAuthApi>,
        session: Arc<SessionCache>,
        net: Arc<StaticConnectivity>,
        clock: Arc<FixedClock>,
        engine: SyncEngine,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn account() -> AuthUser {
        AuthUser {
            id: "u1".to_string(),
            email: "ana@example.com".to_string(),
            name: "Ana".to_string(),
            username: None,
            role: UserRole::Musician,
            avatar_url: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
            has_completed_onboarding: true,
            last_synced_at: None,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SyncConfig::default())
    }

    fn fixture_with(config: SyncConfig) -> Fixture {
        let store = Arc::new(LocalStore::in_memory(app_schema()).unwrap());
        let server = Arc::new(MemorySyncServer::new());
        let auth = Arc::new(StubAuthApi::new().with_account("pw", account()));
        let kv = MemoryKeyValueStore::new();
        let net = Arc::new(StaticConnectivity::new(true));
        let clock = Arc::new(FixedClock::new(now()));
        let session = Arc::new(
            SessionCache::new(auth.clone(), Arc::new(kv.clone()), net.clone(), AuthConfig::default())
                .with_clock(clock.clone()),
        );
        let engine = SyncEngine::new(
            store.clone(),
            server.clone(),
            session.clone(),
            net.clone(),
            Arc::new(kv),
            config,
        )
        .with_clock(clock.clone());
        Fixture {
            store,
            server,
            auth,
            session,
            net,
            clock,
            engine,
        }
    }

    async fn signed_in() -> Fixture {
        let f = fixture();
        f.session.sign_in("ana@example.com", "pw").await.unwrap();
        f
    }

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn remote_user() -> Row {
        row(json!({
            "id": "u1",
            "email": "ana@example.com",
            "name": "Ana",
            "role": "musician",
            "created_at": 1,
            "has_completed_onboarding": true
        }))
    }

    fn remote_playlist(name: &str) -> Row {
        row(json!({
            "id": "p1",
            "name": name,
            "description": null,
            "cover_image_url": null,
            "is_public": false,
            "created_at": 10,
            "updated_at": 10,
            "user_id": "u1"
        }))
    }

    fn playlist(id: &str) -> Playlist {
        Playlist {
            id: id.to_string(),
            name: "Road trip".to_string(),
            description: None,
            cover_image_url: None,
            is_public: false,
            created_at: 10,
            updated_at: 10,
            user_id: "u1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_offline_sync_touches_nothing() {
        let f = signed_in().await;
        f.store.insert(&playlist("p1")).unwrap();
        f.net.set_online(false);

        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error.unwrap().to_string(), "Device is offline");
        assert_eq!(f.server.pull_count(), 0);
        assert_eq!(f.engine.cursor().last_pulled_at().await.unwrap(), None);
        assert!(f.store.has_pending_changes().unwrap());
    }

    #[tokio::test]
    async fn test_forced_sync_skips_connectivity_gate() {
        let f = signed_in().await;
        f.net.set_online(false);

        let result = f.engine.sync(SyncOptions::forced()).await.unwrap();

        assert!(result.success);
        assert_eq!(f.server.pull_count(), 1);
    }

    #[tokio::test]
    async fn test_signed_out_sync_is_unauthenticated() {
        let f = fixture();

        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(matches!(result.error, Some(SyncFailure::Unauthenticated(_))));
        assert_eq!(f.server.pull_count(), 0);
    }

    #[tokio::test]
    async fn test_pull_applies_rows_and_advances_cursor() {
        let f = signed_in().await;
        f.server.set_time(1000);
        f.server.seed("users", remote_user());

        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.pulled, 1);
        assert_eq!(result.pushed, 0);
        assert!(f.store.find("users", "u1").unwrap().is_some());
        assert_eq!(f.store.status("users", "u1").unwrap(), Some(RecordStatus::Synced));
        assert_eq!(f.engine.cursor().last_pulled_at().await.unwrap(), Some(1000));
        assert_eq!(f.server.push_count(), 0);
    }

    #[tokio::test]
    async fn test_configured_conflict_strategy_applies_to_pull() {
        let f = fixture_with(SyncConfig::default().with_conflict_strategy(ConflictStrategy::PreferRemote));
        f.session.sign_in("ana@example.com", "pw").await.unwrap();
        f.server.set_time(1000);
        f.server.seed("playlists", remote_playlist("Road trip"));
        assert!(f.engine.sync(SyncOptions::default()).await.unwrap().success);

        f.store
            .update("playlists", "p1", row(json!({ "name": "Mine" })))
            .unwrap();
        f.server.set_time(2000);
        f.server.seed("playlists", remote_playlist("Theirs"));
        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.pushed, 0);
        let stored: Playlist = f.store.get("p1").unwrap().unwrap();
        assert_eq!(stored.name, "Theirs");
        assert_eq!(f.store.status("playlists", "p1").unwrap(), Some(RecordStatus::Synced));
        assert_eq!(f.server.push_count(), 0);
    }

    #[tokio::test]
    async fn test_push_clears_journal() {
        let f = signed_in().await;
        f.server.set_time(500);
        f.store.insert(&playlist("p1")).unwrap();

        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.pushed, 1);
        assert!(f.server.row("playlists", "p1").is_some());
        assert!(!f.store.has_pending_changes().unwrap());
        assert_eq!(f.store.status("playlists", "p1").unwrap(), Some(RecordStatus::Synced));

        let pushed = f.server.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].table("playlists").unwrap().created.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_push_keeps_journal_and_cursor() {
        let f = signed_in().await;
        f.server.set_time(500);
        f.store.insert(&playlist("p1")).unwrap();
        f.server.fail_next_push(503);

        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(matches!(
            result.error,
            Some(SyncFailure::ServerRejected { status: 503, .. })
        ));
        assert_eq!(f.engine.cursor().last_pulled_at().await.unwrap(), None);
        assert!(f.store.has_pending_changes().unwrap());

        let retry = f.engine.sync(SyncOptions::default()).await.unwrap();
        assert!(retry.success);
        assert!(f.server.row("playlists", "p1").is_some());
        assert!(!f.store.has_pending_changes().unwrap());
    }

    #[tokio::test]
    async fn test_validation_conflict_is_reported() {
        let f = signed_in().await;
        f.store.insert(&playlist("p1")).unwrap();
        f.server.fail_next_push(422);

        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(matches!(result.error, Some(SyncFailure::ValidationConflict(_))));
        assert_eq!(f.store.status("playlists", "p1").unwrap(), Some(RecordStatus::Created));
    }

    #[tokio::test]
    async fn test_cursor_unchanged_when_pull_fails() {
        let f = signed_in().await;
        f.server.set_time(1000);
        f.engine.sync(SyncOptions::default()).await.unwrap();

        f.server.set_time(2000);
        f.server.fail_next_pull(500);
        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(!result.success);
        assert_eq!(f.engine.cursor().last_pulled_at().await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn test_resending_after_crash_is_idempotent() {
        let f = signed_in().await;
        f.store.insert(&playlist("p1")).unwrap();

        // First delivery reached the server, then the app died before
        // clearing the journal or moving the cursor.
        let snapshot = f.store.pending_changes().unwrap();
        let token = f.session.get_access_token().await.unwrap().unwrap();
        f.server
            .push(
                &token,
                &PushRequest {
                    changes: snapshot.changes.clone(),
                    last_pulled_at: None,
                },
            )
            .await
            .unwrap();
        let after_first = f.server.rows("playlists");

        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(f.server.rows("playlists"), after_first);
        assert_eq!(after_first.len(), 1);
        assert!(!f.store.has_pending_changes().unwrap());
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed_once() {
        let f = signed_in().await;
        let stale = f.session.get_access_token().await.unwrap().unwrap();
        f.server.revoke_token(stale.expose());

        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(f.auth.call_count("refresh"), 1);
        assert_eq!(f.server.pull_count(), 2);
        let fresh = f.session.get_access_token().await.unwrap().unwrap();
        assert_ne!(fresh, stale);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_unauthenticated() {
        let f = signed_in().await;
        let stale = f.session.get_access_token().await.unwrap().unwrap();
        f.server.revoke_token(stale.expose());
        f.auth.revoke_refresh_tokens();

        let result = f.engine.sync(SyncOptions::default()).await.unwrap();

        assert!(matches!(result.error, Some(SyncFailure::Unauthenticated(_))));
        assert_eq!(f.server.pull_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_relation_rejected_before_network() {
        let f = signed_in().await;

        let result = f
            .engine
            .sync(SyncOptions::default().with_relations(["songs"]))
            .await
            .unwrap();

        assert!(matches!(result.error, Some(SyncFailure::InvalidRequest(_))));
        assert_eq!(f.server.pull_count(), 0);
    }

    #[tokio::test]
    async fn test_relations_forwarded() {
        let f = signed_in().await;
        f.server.seed("users", remote_user());
        f.server.seed(
            "venues",
            row(json!({ "id": "v1", "name": "Hall", "address": "Main St", "created_at": 1 })),
        );

        f.engine
            .sync(SyncOptions::default().with_relations(["users"]))
            .await
            .unwrap();

        assert_eq!(f.server.pull_requests()[0].relations, vec!["users".to_string()]);
        assert!(f.store.find("users", "u1").unwrap().is_some());
        assert!(f.store.find("venues", "v1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_progress_and_session_bookkeeping() {
        let f = signed_in().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.clock.advance(chrono::Duration::minutes(1));

        let result = f
            .engine
            .sync(SyncOptions::default().with_progress(move |p| sink.lock().unwrap().push(p)))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(*seen.lock().unwrap(), vec![0.0, 0.5, 1.0]);
        assert_eq!(result.completed_at, now() + chrono::Duration::minutes(1));
        assert_eq!(
            f.session.user().await.unwrap().last_synced_at,
            Some(result.completed_at)
        );
    }
}
