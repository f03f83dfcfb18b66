//! File-backed idempotent repository.
//!
//! Keys are kept in an in-memory cache and mirrored to a text file with one
//! key per line. Adds append a line, removals rewrite the file from the cache
//! and `clear` truncates it. Parent directories are created on first write and
//! every mutation is flushed before returning.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::KeyCache;
use crate::repository::IdempotentRepository;
use crate::DEFAULT_MAX_CACHE_SIZE;

pub struct FileIdempotentRepository {
    path: PathBuf,
    name: String,
    cache: Mutex<KeyCache>,
}

impl FileIdempotentRepository {
    /// Open a repository, loading any keys already stored in `path`.
    /// The file is not created until the first key is written.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_capacity(path, DEFAULT_MAX_CACHE_SIZE).await
    }

    pub async fn open_with_capacity(path: impl AsRef<Path>, max_cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut cache = KeyCache::new(max_cache_size);

        if fs::try_exists(&path).await.unwrap_or(false) {
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read idempotent store {}", path.display()))?;
            for key in content.lines().map(str::trim).filter(|k| !k.is_empty()) {
                cache.insert(key);
            }
            info!(path = %path.display(), keys = cache.len(), "Loaded idempotent repository");
        }

        Ok(Self {
            name: format!("file:{}", path.display()),
            path,
            cache: Mutex::new(cache),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !fs::try_exists(parent).await.unwrap_or(false) {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
                debug!(dir = %parent.display(), "Created idempotent store directory");
            }
        }
        Ok(())
    }

    async fn append_line(&self, key: &str) -> Result<()> {
        self.ensure_parent_dir().await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open idempotent store {}", self.path.display()))?;
        file.write_all(format!("{}\n", key).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn rewrite(&self, cache: &KeyCache) -> Result<()> {
        self.ensure_parent_dir().await?;
        let mut content = String::new();
        for key in cache.iter() {
            content.push_str(key);
            content.push('\n');
        }
        let mut file = fs::File::create(&self.path)
            .await
            .with_context(|| format!("Failed to rewrite idempotent store {}", self.path.display()))?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotentRepository for FileIdempotentRepository {
    async fn add(&self, key: &str) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        if !cache.insert(key) {
            return Ok(false);
        }
        self.append_line(key).await?;
        Ok(true)
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.cache.lock().await.contains(key))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        if !cache.remove(key) {
            return Ok(false);
        }
        self.rewrite(&cache).await?;
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.clear();
        if fs::try_exists(&self.path).await.unwrap_or(false) {
            fs::File::create(&self.path).await?.flush().await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_creates_parent_dirs_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store").join("keys.dat");

        let repo = FileIdempotentRepository::open(&path).await.unwrap();
        assert!(!path.exists());

        assert!(repo.add("order-1").await.unwrap());
        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "order-1\n");
    }

    #[tokio::test]
    async fn test_reload_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.dat");

        {
            let repo = FileIdempotentRepository::open(&path).await.unwrap();
            repo.add("a").await.unwrap();
            repo.add("b").await.unwrap();
            repo.add("c").await.unwrap();
            assert!(repo.remove("b").await.unwrap());
        }

        let reopened = FileIdempotentRepository::open(&path).await.unwrap();
        assert!(reopened.contains("a").await.unwrap());
        assert!(!reopened.contains("b").await.unwrap());
        assert!(reopened.contains("c").await.unwrap());
        assert!(!reopened.add("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.dat");

        let repo = FileIdempotentRepository::open(&path).await.unwrap();
        repo.add("x").await.unwrap();
        repo.clear().await.unwrap();

        assert!(!repo.contains("x").await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
