//! Thread state manager: current values, status and checkpoint history.
//!
//! Methods that mutate a thread on behalf of a run (`commit_run`,
//! `rollback_run`, `set_status`) expect the caller to hold that thread's
//! slot lock from [`ThreadLocks`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::arbiter::ThreadLocks;
use crate::error_taxonomy::{RuntimeError, RuntimeResult};
use crate::models::{
    Checkpoint, HistoryQuery, IfExists, Thread, ThreadCreate, ThreadFilter, ThreadSearch,
    ThreadState, ThreadStatus, empty_object, merge_values,
};
use crate::storage::SharedStorage;

const DEFAULT_HISTORY_LIMIT: usize = 10;

pub struct ThreadManager {
    storage: SharedStorage,
    locks: Arc<ThreadLocks>,
}

pub type SharedThreadManager = Arc<ThreadManager>;

fn thread_not_found(thread_id: &str) -> RuntimeError {
    RuntimeError::not_found(format!("Thread {thread_id} not found"))
}

impl ThreadManager {
    #[must_use]
    pub fn new(storage: SharedStorage, locks: Arc<ThreadLocks>) -> Self {
        Self { storage, locks }
    }

    pub async fn create(&self, owner: Option<&str>, req: ThreadCreate) -> RuntimeResult<Thread> {
        let thread_id = req
            .thread_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(existing) = self.storage.get_thread(None, &thread_id).await? {
            let visible = owner.is_none_or(|owner| existing.owner_id.as_deref() == Some(owner));
            return match req.if_exists {
                IfExists::DoNothing if visible => Ok(existing),
                _ => Err(RuntimeError::conflict(format!(
                    "Thread {thread_id} already exists"
                ))),
            };
        }
        let metadata = req.metadata.unwrap_or_else(empty_object);
        let thread = Thread::new(thread_id, owner.map(str::to_string), metadata);
        self.storage.create_thread(&thread).await?;
        tracing::info!(thread_id = %thread.thread_id, "thread created");
        Ok(thread)
    }

    pub async fn get(&self, owner: Option<&str>, thread_id: &str) -> RuntimeResult<Thread> {
        self.storage
            .get_thread(owner, thread_id)
            .await?
            .ok_or_else(|| thread_not_found(thread_id))
    }

    /// Refused while a run is active or queued on the thread.
    pub async fn delete(&self, owner: Option<&str>, thread_id: &str) -> RuntimeResult<()> {
        let slot = self.locks.lock(thread_id).await;
        if !slot.is_idle() {
            return Err(RuntimeError::conflict(format!(
                "Thread {thread_id} has active runs"
            )));
        }
        let deleted = self.storage.delete_thread(owner, thread_id).await?;
        drop(slot);
        self.locks.collect(thread_id).await;
        if !deleted {
            return Err(thread_not_found(thread_id));
        }
        tracing::info!(thread_id, "thread deleted");
        Ok(())
    }

    pub async fn search(
        &self,
        owner: Option<&str>,
        search: ThreadSearch,
    ) -> RuntimeResult<Vec<Thread>> {
        let mut filter = ThreadFilter::from(search);
        filter.limit = Some(filter.limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
        Ok(self.storage.search_threads(owner, &filter).await?)
    }

    pub async fn count(&self, owner: Option<&str>, search: ThreadSearch) -> RuntimeResult<usize> {
        let filter = ThreadFilter::from(search);
        Ok(self.storage.count_threads(owner, &filter).await?)
    }

    /// Latest snapshot, or the bare thread values when nothing was committed yet.
    pub async fn state(&self, owner: Option<&str>, thread_id: &str) -> RuntimeResult<ThreadState> {
        let thread = self.get(owner, thread_id).await?;
        match self.storage.latest_checkpoint(thread_id).await? {
            Some(checkpoint) => Ok(ThreadState::from(checkpoint)),
            None => Ok(ThreadState {
                values: thread.values,
                checkpoint: None,
                parent_checkpoint: None,
                metadata: thread.metadata,
                run_id: None,
                created_at: None,
            }),
        }
    }

    pub async fn history(
        &self,
        owner: Option<&str>,
        thread_id: &str,
        query: HistoryQuery,
    ) -> RuntimeResult<Vec<ThreadState>> {
        self.get(owner, thread_id).await?;
        let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        let checkpoints = self
            .storage
            .list_checkpoints(thread_id, Some(limit), query.before.as_deref())
            .await?;
        Ok(checkpoints.into_iter().map(ThreadState::from).collect())
    }

    /// Manually append a snapshot with `values` merged over the current state.
    pub async fn update_state(
        &self,
        owner: Option<&str>,
        thread_id: &str,
        values: Value,
    ) -> RuntimeResult<ThreadState> {
        let slot = self.locks.lock(thread_id).await;
        if !slot.is_idle() {
            return Err(RuntimeError::conflict(format!(
                "Thread {thread_id} is busy"
            )));
        }
        let mut thread = self.get(owner, thread_id).await?;
        let merged = merge_values(&thread.values, &values);
        let checkpoint = self.append_snapshot(&mut thread, None, merged).await?;
        drop(slot);
        self.locks.collect(thread_id).await;
        Ok(ThreadState::from(checkpoint))
    }

    /// Current values of a thread, unscoped.
    pub async fn values(&self, thread_id: &str) -> RuntimeResult<Value> {
        Ok(self
            .get(None, thread_id)
            .await?
            .values)
    }

    pub async fn set_status(&self, thread_id: &str, status: ThreadStatus) -> RuntimeResult<()> {
        let mut thread = self.get(None, thread_id).await?;
        if thread.status == status {
            return Ok(());
        }
        thread.status = status;
        thread.updated_at = Utc::now();
        self.storage.update_thread(&thread).await?;
        Ok(())
    }

    /// Record the outcome of a run: one snapshot plus the new status.
    pub async fn commit_run(
        &self,
        thread_id: &str,
        run_id: &str,
        values: Value,
        status: ThreadStatus,
    ) -> RuntimeResult<()> {
        let mut thread = self.get(None, thread_id).await?;
        thread.status = status;
        self.append_snapshot(&mut thread, Some(run_id), values)
            .await?;
        Ok(())
    }

    /// Discard a run's effects, restoring the last checkpoint taken before it started.
    pub async fn rollback_run(
        &self,
        thread_id: &str,
        run_id: &str,
        started_at: DateTime<Utc>,
        status: ThreadStatus,
    ) -> RuntimeResult<()> {
        let mut thread = self.get(None, thread_id).await?;
        let restored = self
            .storage
            .latest_checkpoint_before(thread_id, started_at)
            .await?
            .map_or_else(empty_object, |checkpoint| checkpoint.values);
        let removed = self
            .storage
            .delete_checkpoints_for_run(thread_id, run_id)
            .await?;
        thread.values = restored;
        thread.status = status;
        thread.updated_at = Utc::now();
        self.storage.update_thread(&thread).await?;
        tracing::info!(thread_id, run_id, removed, "thread rolled back");
        Ok(())
    }

    async fn append_snapshot(
        &self,
        thread: &mut Thread,
        run_id: Option<&str>,
        values: Value,
    ) -> RuntimeResult<Checkpoint> {
        let parent = self.storage.latest_checkpoint(&thread.thread_id).await?;
        let now = Utc::now();
        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4().to_string(),
            thread_id: thread.thread_id.clone(),
            run_id: run_id.map(str::to_string),
            parent_checkpoint_id: parent.map(|parent| parent.checkpoint_id),
            values: values.clone(),
            metadata: thread.metadata.clone(),
            created_at: now,
        };
        self.storage.put_checkpoint(&checkpoint).await?;
        thread.values = values;
        thread.updated_at = now;
        self.storage.update_thread(thread).await?;
        Ok(checkpoint)
    }
}
