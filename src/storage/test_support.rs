//! Storage wrapper that fails chosen operations on demand.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{MemoryStorage, Storage, StorageError, StorageResult};
use crate::models::{Checkpoint, Cron, CronFilter, Run, RunFilter, Thread, ThreadFilter};

/// In-memory storage whose operations can be made to fail by name.
///
/// Failing operations return [`StorageError::Unavailable`] without touching
/// the underlying rows.
#[derive(Default)]
pub struct FaultyStorage {
    inner: MemoryStorage,
    /// Remaining failures per operation; `None` fails until healed.
    failing: Mutex<HashMap<&'static str, Option<u32>>>,
    calls: AtomicU32,
}

impl FaultyStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `op` until [`heal`](Self::heal) is called.
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().expect("fault table").insert(op, None);
    }

    /// Fail the next `times` calls to `op`.
    pub fn fail_times(&self, op: &'static str, times: u32) {
        self.failing.lock().expect("fault table").insert(op, Some(times));
    }

    pub fn heal(&self, op: &'static str) {
        self.failing.lock().expect("fault table").remove(op);
    }

    /// Total calls seen, failed ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, op: &'static str) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut failing = self.failing.lock().expect("fault table");
        match failing.get_mut(op) {
            None => Ok(()),
            Some(None) => Err(StorageError::Unavailable(format!("{op} unavailable"))),
            Some(Some(0)) => {
                failing.remove(op);
                Ok(())
            }
            Some(Some(left)) => {
                *left -= 1;
                Err(StorageError::Unavailable(format!("{op} unavailable")))
            }
        }
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn create_thread(&self, thread: &Thread) -> StorageResult<()> {
        self.check("create_thread")?;
        self.inner.create_thread(thread).await
    }
    async fn get_thread(
        &self,
        owner: Option<&str>,
        thread_id: &str,
    ) -> StorageResult<Option<Thread>> {
        self.check("get_thread")?;
        self.inner.get_thread(owner, thread_id).await
    }
    async fn update_thread(&self, thread: &Thread) -> StorageResult<()> {
        self.check("update_thread")?;
        self.inner.update_thread(thread).await
    }
    async fn delete_thread(&self, owner: Option<&str>, id: &str) -> StorageResult<bool> {
        self.check("delete_thread")?;
        self.inner.delete_thread(owner, id).await
    }
    async fn search_threads(
        &self,
        owner: Option<&str>,
        filter: &ThreadFilter,
    ) -> StorageResult<Vec<Thread>> {
        self.check("search_threads")?;
        self.inner.search_threads(owner, filter).await
    }
    async fn count_threads(
        &self,
        owner: Option<&str>,
        filter: &ThreadFilter,
    ) -> StorageResult<usize> {
        self.check("count_threads")?;
        self.inner.count_threads(owner, filter).await
    }
    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> StorageResult<()> {
        self.check("put_checkpoint")?;
        self.inner.put_checkpoint(checkpoint).await
    }
    async fn latest_checkpoint(&self, thread_id: &str) -> StorageResult<Option<Checkpoint>> {
        self.check("latest_checkpoint")?;
        self.inner.latest_checkpoint(thread_id).await
    }
    async fn list_checkpoints(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> StorageResult<Vec<Checkpoint>> {
        self.check("list_checkpoints")?;
        self.inner.list_checkpoints(thread_id, limit, before).await
    }
    async fn latest_checkpoint_before(
        &self,
        thread_id: &str,
        before: DateTime<Utc>,
    ) -> StorageResult<Option<Checkpoint>> {
        self.check("latest_checkpoint_before")?;
        self.inner.latest_checkpoint_before(thread_id, before).await
    }
    async fn checkpoint_for_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> StorageResult<Option<Checkpoint>> {
        self.check("checkpoint_for_run")?;
        self.inner.checkpoint_for_run(thread_id, run_id).await
    }
    async fn delete_checkpoints_for_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> StorageResult<usize> {
        self.check("delete_checkpoints_for_run")?;
        self.inner.delete_checkpoints_for_run(thread_id, run_id).await
    }
    async fn create_run(&self, run: &Run) -> StorageResult<()> {
        self.check("create_run")?;
        self.inner.create_run(run).await
    }
    async fn get_run(&self, owner: Option<&str>, run_id: &str) -> StorageResult<Option<Run>> {
        self.check("get_run")?;
        self.inner.get_run(owner, run_id).await
    }
    async fn update_run(&self, run: &Run) -> StorageResult<()> {
        self.check("update_run")?;
        self.inner.update_run(run).await
    }
    async fn delete_run(&self, owner: Option<&str>, run_id: &str) -> StorageResult<bool> {
        self.check("delete_run")?;
        self.inner.delete_run(owner, run_id).await
    }
    async fn list_runs(&self, owner: Option<&str>, filter: &RunFilter) -> StorageResult<Vec<Run>> {
        self.check("list_runs")?;
        self.inner.list_runs(owner, filter).await
    }
    async fn count_runs(&self, owner: Option<&str>, filter: &RunFilter) -> StorageResult<usize> {
        self.check("count_runs")?;
        self.inner.count_runs(owner, filter).await
    }
    async fn create_cron(&self, cron: &Cron) -> StorageResult<()> {
        self.check("create_cron")?;
        self.inner.create_cron(cron).await
    }
    async fn get_cron(&self, owner: Option<&str>, id: &str) -> StorageResult<Option<Cron>> {
        self.check("get_cron")?;
        self.inner.get_cron(owner, id).await
    }
    async fn update_cron(&self, cron: &Cron) -> StorageResult<()> {
        self.check("update_cron")?;
        self.inner.update_cron(cron).await
    }
    async fn delete_cron(&self, owner: Option<&str>, id: &str) -> StorageResult<bool> {
        self.check("delete_cron")?;
        self.inner.delete_cron(owner, id).await
    }
    async fn list_crons(
        &self,
        owner: Option<&str>,
        filter: &CronFilter,
    ) -> StorageResult<Vec<Cron>> {
        self.check("list_crons")?;
        self.inner.list_crons(owner, filter).await
    }
    async fn count_crons(&self, owner: Option<&str>, filter: &CronFilter) -> StorageResult<usize> {
        self.check("count_crons")?;
        self.inner.count_crons(owner, filter).await
    }
}
