//! Persisted pull cursor.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use musichub_common::Result;
use musichub_platform::KeyValueStore;

/// Key the cursor lives under, outside the local store.
pub const CURSOR_KEY: &str = "last_sync_timestamp";

/// Server timestamp (milliseconds) of the last completed sync round.
///
/// Never moves backwards: [`advance`](Self::advance) keeps the larger of the
/// stored and the offered value.
#[derive(Clone)]
pub struct SyncCursor {
    kv: Arc<dyn KeyValueStore>,
}

impl SyncCursor {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// `None` before the first successful sync. An unparsable value is
    /// treated the same way, which makes the next pull a full one.
    pub async fn last_pulled_at(&self) -> Result<Option<i64>> {
        let Some(raw) = self.kv.get_string(CURSOR_KEY).await? else {
            return Ok(None);
        };
        match raw.trim().parse::<i64>() {
            Ok(ts) => Ok(Some(ts)),
            Err(e) => {
                warn!("Ignoring corrupt sync cursor '{}': {}", raw, e);
                Ok(None)
            }
        }
    }

    /// Move the cursor to `timestamp` unless it is already past it.
    ///
    /// Returns the stored value afterwards.
    pub async fn advance(&self, timestamp: i64) -> Result<i64> {
        let current = self.last_pulled_at().await?;
        match current {
            Some(current) if current >= timestamp => {
                debug!(
                    "Sync cursor stays at {} (offered {})",
                    current, timestamp
                );
                Ok(current)
            }
            _ => {
                self.kv
                    .set_string(CURSOR_KEY, &timestamp.to_string())
                    .await?;
                debug!("Sync cursor advanced to {}", timestamp);
                Ok(timestamp)
            }
        }
    }

    /// The cursor as a point in time.
    pub async fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .last_pulled_at()
            .await?
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }
}
