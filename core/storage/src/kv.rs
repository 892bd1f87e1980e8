//! Key-value contract of the on-device persistence engine.

use async_trait::async_trait;

use tarotsync_common::Result;

/// Minimal string key-value store backing the local adapter.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove a value. Removing a missing key succeeds.
    async fn remove(&self, key: &str) -> Result<()>;
}
