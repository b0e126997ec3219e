//! Persistence contract for threads, checkpoints, runs and crons.
//!
//! The core only ever talks to `Arc<dyn Storage>`; which backend sits behind
//! it is decided once at startup by [`open_storage`].

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{RetryPolicy, StorageBackend, StorageConfig};
use crate::models::{
    Checkpoint, Cron, CronFilter, Run, RunFilter, Thread, ThreadFilter,
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(test)]
pub mod test_support;

pub use memory::MemoryStorage;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("storage pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("corrupt storage row: {0}")]
    Corrupt(String),
}

impl StorageError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted(_) | Self::Unavailable(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

pub type SharedStorage = Arc<dyn Storage>;

/// CRUD + query contract every backend implements identically.
///
/// `owner` scopes reads: when `Some`, rows owned by anyone else are invisible.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_thread(&self, thread: &Thread) -> StorageResult<()>;
    async fn get_thread(&self, owner: Option<&str>, thread_id: &str)
    -> StorageResult<Option<Thread>>;
    async fn update_thread(&self, thread: &Thread) -> StorageResult<()>;
    /// Deletes the thread together with its checkpoints and runs.
    async fn delete_thread(&self, owner: Option<&str>, thread_id: &str) -> StorageResult<bool>;
    async fn search_threads(
        &self,
        owner: Option<&str>,
        filter: &ThreadFilter,
    ) -> StorageResult<Vec<Thread>>;
    async fn count_threads(&self, owner: Option<&str>, filter: &ThreadFilter)
    -> StorageResult<usize>;

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> StorageResult<()>;
    async fn latest_checkpoint(&self, thread_id: &str) -> StorageResult<Option<Checkpoint>>;
    /// Newest first. `before` is an exclusive checkpoint-id cursor.
    async fn list_checkpoints(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> StorageResult<Vec<Checkpoint>>;
    async fn latest_checkpoint_before(
        &self,
        thread_id: &str,
        before: DateTime<Utc>,
    ) -> StorageResult<Option<Checkpoint>>;
    async fn checkpoint_for_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> StorageResult<Option<Checkpoint>>;
    async fn delete_checkpoints_for_run(&self, thread_id: &str, run_id: &str)
    -> StorageResult<usize>;

    async fn create_run(&self, run: &Run) -> StorageResult<()>;
    async fn get_run(&self, owner: Option<&str>, run_id: &str) -> StorageResult<Option<Run>>;
    async fn update_run(&self, run: &Run) -> StorageResult<()>;
    async fn delete_run(&self, owner: Option<&str>, run_id: &str) -> StorageResult<bool>;
    /// Newest first.
    async fn list_runs(&self, owner: Option<&str>, filter: &RunFilter) -> StorageResult<Vec<Run>>;
    async fn count_runs(&self, owner: Option<&str>, filter: &RunFilter) -> StorageResult<usize>;

    async fn create_cron(&self, cron: &Cron) -> StorageResult<()>;
    async fn get_cron(&self, owner: Option<&str>, cron_id: &str) -> StorageResult<Option<Cron>>;
    async fn update_cron(&self, cron: &Cron) -> StorageResult<()>;
    async fn delete_cron(&self, owner: Option<&str>, cron_id: &str) -> StorageResult<bool>;
    async fn list_crons(&self, owner: Option<&str>, filter: &CronFilter)
    -> StorageResult<Vec<Cron>>;
    async fn count_crons(&self, owner: Option<&str>, filter: &CronFilter) -> StorageResult<usize>;

    /// Release pooled resources. Called once during shutdown.
    async fn close(&self) {}
}

/// Retries idempotent reads on retryable failures; writes pass through once.
pub struct RetryingStorage {
    inner: SharedStorage,
    policy: RetryPolicy,
}

impl RetryingStorage {
    #[must_use]
    pub fn new(inner: SharedStorage, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn read<T, F, Fut>(&self, op: &'static str, f: F) -> StorageResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = StorageResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Err(err)
                    if err.is_retryable()
                        && self.policy.enabled
                        && attempt < self.policy.max_retries =>
                {
                    let delay = self.policy.delay_for_attempt(attempt);
                    tracing::warn!(op, attempt, ?delay, "retrying storage read: {err}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Storage for RetryingStorage {
    async fn create_thread(&self, thread: &Thread) -> StorageResult<()> {
        self.inner.create_thread(thread).await
    }

    async fn get_thread(
        &self,
        owner: Option<&str>,
        thread_id: &str,
    ) -> StorageResult<Option<Thread>> {
        self.read("get_thread", || self.inner.get_thread(owner, thread_id))
            .await
    }

    async fn update_thread(&self, thread: &Thread) -> StorageResult<()> {
        self.inner.update_thread(thread).await
    }

    async fn delete_thread(&self, owner: Option<&str>, thread_id: &str) -> StorageResult<bool> {
        self.inner.delete_thread(owner, thread_id).await
    }

    async fn search_threads(
        &self,
        owner: Option<&str>,
        filter: &ThreadFilter,
    ) -> StorageResult<Vec<Thread>> {
        self.read("search_threads", || self.inner.search_threads(owner, filter))
            .await
    }

    async fn count_threads(
        &self,
        owner: Option<&str>,
        filter: &ThreadFilter,
    ) -> StorageResult<usize> {
        self.read("count_threads", || self.inner.count_threads(owner, filter))
            .await
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> StorageResult<()> {
        self.inner.put_checkpoint(checkpoint).await
    }

    async fn latest_checkpoint(&self, thread_id: &str) -> StorageResult<Option<Checkpoint>> {
        self.read("latest_checkpoint", || self.inner.latest_checkpoint(thread_id))
            .await
    }

    async fn list_checkpoints(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> StorageResult<Vec<Checkpoint>> {
        self.read("list_checkpoints", || {
            self.inner.list_checkpoints(thread_id, limit, before)
        })
        .await
    }

    async fn latest_checkpoint_before(
        &self,
        thread_id: &str,
        before: DateTime<Utc>,
    ) -> StorageResult<Option<Checkpoint>> {
        self.read("latest_checkpoint_before", || {
            self.inner.latest_checkpoint_before(thread_id, before)
        })
        .await
    }

    async fn checkpoint_for_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> StorageResult<Option<Checkpoint>> {
        self.read("checkpoint_for_run", || {
            self.inner.checkpoint_for_run(thread_id, run_id)
        })
        .await
    }

    async fn delete_checkpoints_for_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> StorageResult<usize> {
        self.inner.delete_checkpoints_for_run(thread_id, run_id).await
    }

    async fn create_run(&self, run: &Run) -> StorageResult<()> {
        self.inner.create_run(run).await
    }

    async fn get_run(&self, owner: Option<&str>, run_id: &str) -> StorageResult<Option<Run>> {
        self.read("get_run", || self.inner.get_run(owner, run_id)).await
    }

    async fn update_run(&self, run: &Run) -> StorageResult<()> {
        self.inner.update_run(run).await
    }

    async fn delete_run(&self, owner: Option<&str>, run_id: &str) -> StorageResult<bool> {
        self.inner.delete_run(owner, run_id).await
    }

    async fn list_runs(&self, owner: Option<&str>, filter: &RunFilter) -> StorageResult<Vec<Run>> {
        self.read("list_runs", || self.inner.list_runs(owner, filter))
            .await
    }

    async fn count_runs(&self, owner: Option<&str>, filter: &RunFilter) -> StorageResult<usize> {
        self.read("count_runs", || self.inner.count_runs(owner, filter))
            .await
    }

    async fn create_cron(&self, cron: &Cron) -> StorageResult<()> {
        self.inner.create_cron(cron).await
    }

    async fn get_cron(&self, owner: Option<&str>, cron_id: &str) -> StorageResult<Option<Cron>> {
        self.read("get_cron", || self.inner.get_cron(owner, cron_id)).await
    }

    async fn update_cron(&self, cron: &Cron) -> StorageResult<()> {
        self.inner.update_cron(cron).await
    }

    async fn delete_cron(&self, owner: Option<&str>, cron_id: &str) -> StorageResult<bool> {
        self.inner.delete_cron(owner, cron_id).await
    }

    async fn list_crons(
        &self,
        owner: Option<&str>,
        filter: &CronFilter,
    ) -> StorageResult<Vec<Cron>> {
        self.read("list_crons", || self.inner.list_crons(owner, filter))
            .await
    }

    async fn count_crons(&self, owner: Option<&str>, filter: &CronFilter) -> StorageResult<usize> {
        self.read("count_crons", || self.inner.count_crons(owner, filter))
            .await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Open the configured backend wrapped in read retries.
pub async fn open_storage(cfg: &StorageConfig) -> Result<SharedStorage> {
    let inner: SharedStorage = match cfg.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres => Arc::new(postgres::PostgresStorage::connect(cfg).await?),
        #[cfg(not(feature = "postgres"))]
        StorageBackend::Postgres => {
            anyhow::bail!("This build does not include the postgres storage backend")
        }
    };
    tracing::info!(backend = cfg.backend.as_str(), "storage backend ready");
    Ok(Arc::new(RetryingStorage::new(inner, cfg.retry_policy())))
}

/// Apply `offset`/`limit` to an already ordered list.
pub(crate) fn paginate<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

pub(crate) fn owner_matches(owner: Option<&str>, row_owner: Option<&str>) -> bool {
    owner.is_none_or(|owner| row_owner == Some(owner))
}
