//! Bounded executor pools for parallel and asynchronous patterns.
//!
//! - Semaphore-based concurrency limit per pool
//! - `try_submit` hands the task back when the pool is saturated so the caller
//!   can run it itself; nested fan-outs on one pool never wait on each other
//! - Graceful shutdown waits for active tasks; `shutdown_now` cancels them
//! - Named profiles resolved from configuration through `ExecutorRegistry`

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sy_common::ExchangeError;
use sy_config::{EngineConfig, ThreadPoolProfile};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ConfigError;

/// Handle to a submitted task. Resolves to `Err(Rejected)` when the pool was
/// shut down with `shutdown_now` before the task finished.
pub type TaskHandle<T> = JoinHandle<Result<T, ExchangeError>>;

/// Outcome of [`ThreadPool::try_submit`].
pub enum Submission<F, T> {
    Spawned(TaskHandle<T>),
    /// No free slot. The task is handed back to run on the caller's task.
    CallerRuns(F),
}

pub struct ThreadPool {
    name: String,
    pool_size: usize,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    accepting: AtomicBool,
    cancel_tx: watch::Sender<bool>,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            pool_size,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            active: Arc::new(AtomicUsize::new(0)),
            accepting: AtomicBool::new(true),
            cancel_tx,
        }
    }

    pub fn from_profile(profile: &ThreadPoolProfile) -> Self {
        Self::new(profile.id.clone(), profile.pool_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn rejected(&self) -> ExchangeError {
        ExchangeError::rejected(format!("Thread pool {} is shut down", self.name))
    }

    /// Submit a task, waiting for a free slot when the pool is saturated.
    pub async fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, ExchangeError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_accepting() {
            return Err(self.rejected());
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.rejected())?;
        Ok(self.spawn(permit, task))
    }

    /// Submit a task without waiting. A saturated pool returns the task as
    /// [`Submission::CallerRuns`].
    pub fn try_submit<F, T>(&self, task: F) -> Result<Submission<F, T>, ExchangeError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_accepting() {
            return Err(self.rejected());
        }

        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(Submission::Spawned(self.spawn(permit, task))),
            Err(TryAcquireError::NoPermits) => {
                debug!(pool = %self.name, "Thread pool saturated, caller runs the task");
                Ok(Submission::CallerRuns(task))
            }
            Err(TryAcquireError::Closed) => Err(self.rejected()),
        }
    }

    fn spawn<F, T>(&self, permit: OwnedSemaphorePermit, task: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let active = self.active.clone();
        let mut cancel_rx = self.cancel_tx.subscribe();
        let name = self.name.clone();
        active.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let _permit = permit;
            let result = tokio::select! {
                output = task => Ok(output),
                Ok(_) = cancel_rx.wait_for(|cancelled| *cancelled) => {
                    Err(ExchangeError::rejected(format!("Task cancelled: thread pool {} shut down", name)))
                }
            };
            active.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    /// Stop accepting tasks and wait up to `timeout` for active ones to finish.
    /// Returns whether the pool drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        let drained = tokio::time::timeout(timeout, async {
            while self.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();
        self.semaphore.close();

        if drained {
            debug!(pool = %self.name, "Thread pool drained");
        } else {
            warn!(pool = %self.name, active = self.active_count(), "Thread pool did not drain in time");
        }
        drained
    }

    /// Stop accepting tasks and cancel the running ones.
    pub fn shutdown_now(&self) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        self.semaphore.close();
        self.cancel_tx.send_replace(true);
        let active = self.active_count();
        if active > 0 {
            warn!(pool = %self.name, active, "Cancelling running tasks");
        }
        active
    }
}

/// Pools by profile id. The default profile always exists.
pub struct ExecutorRegistry {
    default_id: String,
    pools: DashMap<String, Arc<ThreadPool>>,
}

impl ExecutorRegistry {
    pub fn from_config(config: &EngineConfig) -> Self {
        let pools = DashMap::new();
        for profile in std::iter::once(&config.thread_pool).chain(config.thread_pools.iter()) {
            pools.insert(profile.id.clone(), Arc::new(ThreadPool::from_profile(profile)));
        }
        info!(pools = pools.len(), default = %config.thread_pool.id, "Executor pools configured");
        Self {
            default_id: config.thread_pool.id.clone(),
            pools,
        }
    }

    pub fn default_pool(&self) -> Arc<ThreadPool> {
        match self.pools.get(&self.default_id) {
            Some(pool) => pool.clone(),
            None => {
                let pool = Arc::new(ThreadPool::new(self.default_id.clone(), ThreadPoolProfile::default().pool_size));
                self.pools.insert(self.default_id.clone(), pool.clone());
                pool
            }
        }
    }

    /// Resolve a profile id; `None` means the default pool.
    pub fn lookup(&self, id: Option<&str>) -> Result<Arc<ThreadPool>, ConfigError> {
        match id {
            None => Ok(self.default_pool()),
            Some(id) => self
                .pools
                .get(id)
                .map(|pool| pool.clone())
                .ok_or_else(|| ConfigError::registry_miss("thread pool profile", id)),
        }
    }

    pub fn register(&self, pool: Arc<ThreadPool>) {
        self.pools.insert(pool.name().to_string(), pool);
    }

    pub async fn shutdown_all(&self, timeout: Duration) {
        let pools: Vec<Arc<ThreadPool>> = self.pools.iter().map(|p| p.value().clone()).collect();
        for pool in pools {
            pool.shutdown(timeout).await;
        }
    }

    pub fn shutdown_all_now(&self) -> usize {
        self.pools.iter().map(|p| p.value().shutdown_now()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_limits_concurrency() {
        let pool = Arc::new(ThreadPool::new("test", 2));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let peak = peak.clone();
            let current = current.clone();
            handles.push(
                pool.submit(async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap(),
            );
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_now_cancels() {
        let pool = ThreadPool::new("test", 1);
        let handle = pool
            .submit(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
            })
            .await
            .unwrap();

        pool.shutdown_now();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ExchangeError::Rejected(_))));
        assert!(pool.submit(async {}).await.is_err());
    }

    #[tokio::test]
    async fn test_try_submit_hands_back_when_saturated() {
        let pool = ThreadPool::new("test", 1);
        let release = Arc::new(tokio::sync::Notify::new());
        let holder = {
            let release = release.clone();
            match pool.try_submit(async move { release.notified().await }).unwrap() {
                Submission::Spawned(handle) => handle,
                Submission::CallerRuns(_) => panic!("an idle pool should spawn"),
            }
        };

        match pool.try_submit(async { 7 }).unwrap() {
            Submission::CallerRuns(task) => assert_eq!(task.await, 7),
            Submission::Spawned(_) => panic!("a saturated pool should hand the task back"),
        }

        release.notify_one();
        holder.await.unwrap().unwrap();
        assert!(matches!(pool.try_submit(async {}).unwrap(), Submission::Spawned(_)));

        pool.shutdown_now();
        assert!(pool.try_submit(async {}).is_err());
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut config = EngineConfig::default();
        config.thread_pools.push(ThreadPoolProfile { id: "fanout".into(), pool_size: 3 });
        let registry = ExecutorRegistry::from_config(&config);

        assert_eq!(registry.lookup(Some("fanout")).unwrap().pool_size(), 3);
        assert_eq!(registry.lookup(None).unwrap().name(), "default");
        assert!(matches!(
            registry.lookup(Some("missing")),
            Err(ConfigError::RegistryMiss { .. })
        ));
    }
}
