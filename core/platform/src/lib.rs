//! Platform collaborators consumed by the MusicHub core.
//!
//! - Persisted key-value storage for credentials and the sync cursor
//! - The connectivity oracle
//! - Application lifecycle events
//! - HTTP helpers shared by the API clients

pub mod connectivity;
pub mod http;
pub mod kv;
pub mod lifecycle;
pub mod memory;
pub mod sqlite;

pub use connectivity::{Connectivity, HttpConnectivity, StaticConnectivity};
pub use kv::{KeyValueStore, KeyValueStoreExt};
pub use lifecycle::AppState;
pub use memory::MemoryKeyValueStore;
pub use sqlite::SqliteKeyValueStore;
