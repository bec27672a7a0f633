//! Sync scheduling: periodic, lifecycle, reconnect and manual triggers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use musichub_common::{Error, Result};
use musichub_platform::AppState;

use crate::engine::{SyncEngine, SyncOptions};
use crate::state::{SyncFailure, SyncResult};

/// When automatic syncs happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the background timer.
    pub interval: Duration,
    /// Minimum time in background before a foreground event triggers a sync.
    pub min_background: Duration,
    pub sync_on_start: bool,
    pub sync_on_foreground: bool,
    pub sync_on_reconnect: bool,
}

impl SchedulerConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15 * 60);
    pub const DEFAULT_MIN_BACKGROUND: Duration = Duration::from_secs(60);

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_min_background(mut self, min_background: Duration) -> Self {
        self.min_background = min_background;
        self
    }

    pub fn with_sync_on_start(mut self, enabled: bool) -> Self {
        self.sync_on_start = enabled;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            min_background: Self::DEFAULT_MIN_BACKGROUND,
            sync_on_start: true,
            sync_on_foreground: true,
            sync_on_reconnect: true,
        }
    }
}

/// Inputs to the scheduler loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    AppState(AppState),
    /// Current connectivity as reported by the platform.
    Connectivity(bool),
    /// Re-arm the periodic timer with a new period.
    Interval(Duration),
    Shutdown,
}

/// Clears the in-flight flag when a sync attempt ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Decides when [`SyncEngine::sync`] runs.
///
/// At most one sync is in flight. Automatic triggers that fire during a sync
/// are dropped, and a manual call gets an `AlreadySyncing` result.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    config: SchedulerConfig,
    is_syncing: AtomicBool,
    interval: RwLock<Duration>,
    last_synced_at: RwLock<Option<DateTime<Utc>>>,
    last_sync_result: RwLock<Option<SyncResult>>,
    event_tx: mpsc::Sender<SchedulerEvent>,
}

impl SyncScheduler {
    /// Create the scheduler and the handle that runs its loop.
    ///
    /// `last_synced_at` starts from the persisted cursor.
    ///
    /// # Errors
    /// - Zero interval
    /// - Cursor could not be read
    pub async fn new(
        engine: Arc<SyncEngine>,
        config: SchedulerConfig,
    ) -> Result<(Arc<Self>, SyncSchedulerHandle)> {
        check_interval(config.interval)?;
        let last_synced_at = engine.cursor().last_synced_at().await?;
        let (event_tx, event_rx) = mpsc::channel(32);

        let scheduler = Arc::new(Self {
            engine,
            interval: RwLock::new(config.interval),
            config,
            is_syncing: AtomicBool::new(false),
            last_synced_at: RwLock::new(last_synced_at),
            last_sync_result: RwLock::new(None),
            event_tx,
        });
        let handle = SyncSchedulerHandle {
            scheduler: scheduler.clone(),
            event_rx,
        };
        Ok((scheduler, handle))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Acquire)
    }

    pub async fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *self.last_synced_at.read().await
    }

    pub async fn last_sync_result(&self) -> Option<SyncResult> {
        self.last_sync_result.read().await.clone()
    }

    pub async fn interval(&self) -> Duration {
        *self.interval.read().await
    }

    /// Run a sync now, regardless of the timer.
    ///
    /// Returns an `AlreadySyncing` failure without touching the engine when
    /// another sync is in flight.
    pub async fn sync_now(&self, options: SyncOptions) -> Result<SyncResult> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync requested while another is in flight");
            return Ok(SyncResult::failed(
                SyncFailure::AlreadySyncing,
                self.engine.clock().now(),
            ));
        }
        let _in_flight = InFlight(&self.is_syncing);

        let result = self.engine.sync(options).await?;
        if result.success {
            *self.last_synced_at.write().await = Some(result.completed_at);
        }
        *self.last_sync_result.write().await = Some(result.clone());
        Ok(result)
    }

    /// Replace the periodic interval and re-arm the timer.
    ///
    /// # Errors
    /// - Zero interval
    /// - Scheduler loop not running
    pub async fn set_interval(&self, interval: Duration) -> Result<()> {
        check_interval(interval)?;
        *self.interval.write().await = interval;
        self.send(SchedulerEvent::Interval(interval)).await
    }

    /// Go back to [`SchedulerConfig::DEFAULT_INTERVAL`].
    pub async fn reset_interval(&self) -> Result<()> {
        self.set_interval(SchedulerConfig::DEFAULT_INTERVAL).await
    }

    pub async fn app_state_changed(&self, state: AppState) -> Result<()> {
        self.send(SchedulerEvent::AppState(state)).await
    }

    pub async fn connectivity_changed(&self, online: bool) -> Result<()> {
        self.send(SchedulerEvent::Connectivity(online)).await
    }

    /// Stop the loop. A sync already in flight runs to completion.
    pub async fn shutdown(&self) {
        let _ = self.event_tx.send(SchedulerEvent::Shutdown).await;
    }

    async fn send(&self, event: SchedulerEvent) -> Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| Error::InvalidState("Scheduler not running".to_string()))
    }

    /// Automatic trigger: skipped while busy, offline or signed out.
    async fn trigger(&self, reason: &'static str) {
        if self.is_syncing() {
            debug!("Dropping {} sync trigger: sync in flight", reason);
            return;
        }
        if !self.engine.connectivity().is_online().await {
            debug!("Skipping {} sync: device is offline", reason);
            return;
        }
        if !self.engine.is_signed_in().await {
            debug!("Skipping {} sync: not signed in", reason);
            return;
        }

        debug!("Triggering {} sync", reason);
        match self.sync_now(SyncOptions::default()).await {
            Ok(result) if result.success => {
                info!(
                    "{} sync completed: {} pulled, {} pushed",
                    reason, result.pulled, result.pushed
                );
            }
            Ok(SyncResult {
                error: Some(SyncFailure::AlreadySyncing),
                ..
            }) => debug!("Dropping {} sync trigger: sync in flight", reason),
            Ok(result) => match result.error {
                Some(failure) if failure.is_transient() => {
                    info!("{} sync deferred: {}", reason, failure)
                }
                Some(failure) => warn!("{} sync failed: {}", reason, failure),
                None => {}
            },
            Err(e) => error!("{} sync aborted: {}", reason, e),
        }
    }
}

/// Runs the scheduler loop. Spawn [`run`](Self::run) on the runtime.
pub struct SyncSchedulerHandle {
    scheduler: Arc<SyncScheduler>,
    event_rx: mpsc::Receiver<SchedulerEvent>,
}

impl SyncSchedulerHandle {
    pub async fn run(mut self) {
        let config = self.scheduler.config.clone();
        let mut ticker = periodic(self.scheduler.interval().await);
        let mut background_since: Option<Instant> = None;
        let mut online: Option<bool> = None;

        info!("Sync scheduler started");
        if config.sync_on_start {
            self.spawn_trigger("startup");
        }

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    match event {
                        SchedulerEvent::AppState(state) if !state.is_active() => {
                            background_since = Some(Instant::now());
                        }
                        SchedulerEvent::AppState(_) => {
                            let away = background_since.take().map(|since| since.elapsed());
                            if config.sync_on_foreground
                                && away.is_some_and(|away| away >= config.min_background)
                            {
                                self.spawn_trigger("foreground");
                            }
                        }
                        SchedulerEvent::Connectivity(now_online) => {
                            let was_online = online.replace(now_online);
                            if config.sync_on_reconnect && now_online && was_online == Some(false) {
                                self.spawn_trigger("reconnect");
                            }
                        }
                        SchedulerEvent::Interval(period) => {
                            debug!("Re-arming periodic sync every {:?}", period);
                            ticker = periodic(period);
                        }
                        SchedulerEvent::Shutdown => break,
                    }
                }
                _ = ticker.tick() => self.spawn_trigger("periodic"),
            }
        }

        info!("Sync scheduler stopped");
    }

    fn spawn_trigger(&self, reason: &'static str) {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.trigger(reason).await });
    }
}

/// First tick one full period from now.
fn periodic(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn check_interval(interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(Error::InvalidInput(
            "Sync interval must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
