use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cache::KeyCache;
use crate::repository::IdempotentRepository;
use crate::DEFAULT_MAX_CACHE_SIZE;

/// In-memory repository bounded to `max_cache_size` keys.
pub struct MemoryIdempotentRepository {
    cache: Mutex<KeyCache>,
}

impl MemoryIdempotentRepository {
    pub fn new(max_cache_size: usize) -> Self {
        Self {
            cache: Mutex::new(KeyCache::new(max_cache_size)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryIdempotentRepository {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHE_SIZE)
    }
}

#[async_trait]
impl IdempotentRepository for MemoryIdempotentRepository {
    async fn add(&self, key: &str) -> Result<bool> {
        Ok(self.cache.lock().insert(key))
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.cache.lock().contains(key))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.cache.lock().remove(key))
    }

    async fn clear(&self) -> Result<()> {
        self.cache.lock().clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
