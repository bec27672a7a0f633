//! Persisted key-value store trait.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use musichub_common::{Error, Result};

/// Durable string key-value storage.
///
/// Backs the session credentials and the sync cursor. Every value must be
/// readable before any network call is made, so implementations keep data
/// on the device.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Read a raw value.
    ///
    /// # Postconditions
    /// - Returns `None` when the key was never written or has been removed
    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Write a raw value, replacing any previous one.
    async fn set_string(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List all keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// JSON-typed helpers on top of [`KeyValueStore`].
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Read and decode a JSON value.
    ///
    /// # Errors
    /// - Stored value is not valid JSON for `T`
    async fn get_item<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get_string(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::Serialization(format!("Corrupt value for '{}': {}", key, e))),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value.
    async fn set_item<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set_string(key, &raw).await
    }

    /// Remove several keys.
    async fn remove_all(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}
