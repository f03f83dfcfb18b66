use anyhow::Result;
use async_trait::async_trait;

/// Set of message keys that have been seen.
#[async_trait]
pub trait IdempotentRepository: Send + Sync {
    /// Add a key. Returns `false` when it was already present.
    async fn add(&self, key: &str) -> Result<bool>;

    async fn contains(&self, key: &str) -> Result<bool>;

    /// Remove a key. Returns `false` when it was not present.
    async fn remove(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    /// Human readable name for logging.
    fn name(&self) -> &str;
}
