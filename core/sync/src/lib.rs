//! MusicHub Sync Engine
//!
//! Reconciles the local store with the MusicHub server:
//! - Pull/push rounds against the `/sync` endpoint
//! - A monotonic, persisted pull cursor
//! - Periodic, lifecycle and reconnect scheduling with single-flight
//! - An in-memory sync server for tests and offline development

pub mod cursor;
pub mod engine;
pub mod memory;
pub mod scheduler;
pub mod state;
pub mod transport;

pub use cursor::{SyncCursor, CURSOR_KEY};
pub use engine::{ProgressFn, SessionAccess, SyncConfig, SyncEngine, SyncOptions};
pub use memory::MemorySyncServer;
pub use scheduler::{SchedulerConfig, SchedulerEvent, SyncScheduler, SyncSchedulerHandle};
pub use state::{SyncFailure, SyncResult};
pub use transport::{HttpSyncTransport, PullRequest, PullResponse, PushRequest, SyncTransport};
