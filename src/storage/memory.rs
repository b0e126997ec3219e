//! In-process storage backend for tests and single-node development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{Storage, StorageError, StorageResult, owner_matches, paginate};
use crate::models::{
    Checkpoint, Cron, CronFilter, Run, RunFilter, Thread, ThreadFilter, metadata_contains,
};

#[derive(Default)]
struct MemoryState {
    threads: HashMap<String, Thread>,
    /// Per-thread checkpoints in insertion order.
    checkpoints: HashMap<String, Vec<Checkpoint>>,
    runs: HashMap<String, Run>,
    crons: HashMap<String, Cron>,
}

#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn thread_matches(thread: &Thread, owner: Option<&str>, filter: &ThreadFilter) -> bool {
    owner_matches(owner, thread.owner_id.as_deref())
        && filter.status.is_none_or(|status| thread.status == status)
        && filter
            .metadata
            .as_ref()
            .is_none_or(|wanted| metadata_contains(&thread.metadata, wanted))
}

fn run_matches(run: &Run, owner: Option<&str>, filter: &RunFilter) -> bool {
    owner_matches(owner, run.owner_id.as_deref())
        && filter
            .thread_id
            .as_ref()
            .is_none_or(|thread_id| run.thread_id.as_ref() == Some(thread_id))
        && (filter.statuses.is_empty() || filter.statuses.contains(&run.status))
}

fn cron_matches(cron: &Cron, owner: Option<&str>, filter: &CronFilter) -> bool {
    owner_matches(owner, cron.owner_id.as_deref())
        && filter
            .assistant_id
            .as_ref()
            .is_none_or(|assistant_id| &cron.assistant_id == assistant_id)
        && filter
            .thread_id
            .as_ref()
            .is_none_or(|thread_id| cron.thread_id.as_ref() == Some(thread_id))
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_thread(&self, thread: &Thread) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if state.threads.contains_key(&thread.thread_id) {
            return Err(StorageError::Conflict(format!(
                "Thread {} already exists",
                thread.thread_id
            )));
        }
        state
            .threads
            .insert(thread.thread_id.clone(), thread.clone());
        Ok(())
    }

    async fn get_thread(
        &self,
        owner: Option<&str>,
        thread_id: &str,
    ) -> StorageResult<Option<Thread>> {
        let state = self.state.read().await;
        Ok(state
            .threads
            .get(thread_id)
            .filter(|thread| owner_matches(owner, thread.owner_id.as_deref()))
            .cloned())
    }

    async fn update_thread(&self, thread: &Thread) -> StorageResult<()> {
        let mut state = self.state.write().await;
        match state.threads.get_mut(&thread.thread_id) {
            Some(slot) => {
                *slot = thread.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "Thread {} not found",
                thread.thread_id
            ))),
        }
    }

    async fn delete_thread(&self, owner: Option<&str>, thread_id: &str) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        let visible = state
            .threads
            .get(thread_id)
            .is_some_and(|thread| owner_matches(owner, thread.owner_id.as_deref()));
        if !visible {
            return Ok(false);
        }
        state.threads.remove(thread_id);
        state.checkpoints.remove(thread_id);
        state
            .runs
            .retain(|_, run| run.thread_id.as_deref() != Some(thread_id));
        Ok(true)
    }

    async fn search_threads(
        &self,
        owner: Option<&str>,
        filter: &ThreadFilter,
    ) -> StorageResult<Vec<Thread>> {
        let state = self.state.read().await;
        let mut threads: Vec<Thread> = state
            .threads
            .values()
            .filter(|thread| thread_matches(thread, owner, filter))
            .cloned()
            .collect();
        threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(threads, filter.offset, filter.limit))
    }

    async fn count_threads(
        &self,
        owner: Option<&str>,
        filter: &ThreadFilter,
    ) -> StorageResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .threads
            .values()
            .filter(|thread| thread_matches(thread, owner, filter))
            .count())
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> StorageResult<()> {
        let mut state = self.state.write().await;
        state
            .checkpoints
            .entry(checkpoint.thread_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn latest_checkpoint(&self, thread_id: &str) -> StorageResult<Option<Checkpoint>> {
        let state = self.state.read().await;
        Ok(state
            .checkpoints
            .get(thread_id)
            .and_then(|list| list.last())
            .cloned())
    }

    async fn list_checkpoints(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> StorageResult<Vec<Checkpoint>> {
        let state = self.state.read().await;
        let Some(list) = state.checkpoints.get(thread_id) else {
            return Ok(Vec::new());
        };
        let end = match before {
            Some(cursor) => list
                .iter()
                .position(|checkpoint| checkpoint.checkpoint_id == cursor)
                .unwrap_or(list.len()),
            None => list.len(),
        };
        let newest_first: Vec<Checkpoint> = list[..end].iter().rev().cloned().collect();
        Ok(paginate(newest_first, 0, limit))
    }

    async fn latest_checkpoint_before(
        &self,
        thread_id: &str,
        before: DateTime<Utc>,
    ) -> StorageResult<Option<Checkpoint>> {
        let state = self.state.read().await;
        Ok(state.checkpoints.get(thread_id).and_then(|list| {
            list.iter()
                .rev()
                .find(|checkpoint| checkpoint.created_at < before)
                .cloned()
        }))
    }

    async fn checkpoint_for_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> StorageResult<Option<Checkpoint>> {
        let state = self.state.read().await;
        Ok(state.checkpoints.get(thread_id).and_then(|list| {
            list.iter()
                .rev()
                .find(|checkpoint| checkpoint.run_id.as_deref() == Some(run_id))
                .cloned()
        }))
    }

    async fn delete_checkpoints_for_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let Some(list) = state.checkpoints.get_mut(thread_id) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|checkpoint| checkpoint.run_id.as_deref() != Some(run_id));
        Ok(before - list.len())
    }

    async fn create_run(&self, run: &Run) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if state.runs.contains_key(&run.run_id) {
            return Err(StorageError::Conflict(format!(
                "Run {} already exists",
                run.run_id
            )));
        }
        state.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, owner: Option<&str>, run_id: &str) -> StorageResult<Option<Run>> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .get(run_id)
            .filter(|run| owner_matches(owner, run.owner_id.as_deref()))
            .cloned())
    }

    async fn update_run(&self, run: &Run) -> StorageResult<()> {
        let mut state = self.state.write().await;
        match state.runs.get_mut(&run.run_id) {
            Some(slot) => {
                *slot = run.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("Run {} not found", run.run_id))),
        }
    }

    async fn delete_run(&self, owner: Option<&str>, run_id: &str) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        let visible = state
            .runs
            .get(run_id)
            .is_some_and(|run| owner_matches(owner, run.owner_id.as_deref()));
        if visible {
            state.runs.remove(run_id);
        }
        Ok(visible)
    }

    async fn list_runs(&self, owner: Option<&str>, filter: &RunFilter) -> StorageResult<Vec<Run>> {
        let state = self.state.read().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|run| run_matches(run, owner, filter))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(runs, filter.offset, filter.limit))
    }

    async fn count_runs(&self, owner: Option<&str>, filter: &RunFilter) -> StorageResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .values()
            .filter(|run| run_matches(run, owner, filter))
            .count())
    }

    async fn create_cron(&self, cron: &Cron) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if state.crons.contains_key(&cron.cron_id) {
            return Err(StorageError::Conflict(format!(
                "Cron {} already exists",
                cron.cron_id
            )));
        }
        state.crons.insert(cron.cron_id.clone(), cron.clone());
        Ok(())
    }

    async fn get_cron(&self, owner: Option<&str>, cron_id: &str) -> StorageResult<Option<Cron>> {
        let state = self.state.read().await;
        Ok(state
            .crons
            .get(cron_id)
            .filter(|cron| owner_matches(owner, cron.owner_id.as_deref()))
            .cloned())
    }

    async fn update_cron(&self, cron: &Cron) -> StorageResult<()> {
        let mut state = self.state.write().await;
        match state.crons.get_mut(&cron.cron_id) {
            Some(slot) => {
                *slot = cron.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "Cron {} not found",
                cron.cron_id
            ))),
        }
    }

    async fn delete_cron(&self, owner: Option<&str>, cron_id: &str) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        let visible = state
            .crons
            .get(cron_id)
            .is_some_and(|cron| owner_matches(owner, cron.owner_id.as_deref()));
        if visible {
            state.crons.remove(cron_id);
        }
        Ok(visible)
    }

    async fn list_crons(
        &self,
        owner: Option<&str>,
        filter: &CronFilter,
    ) -> StorageResult<Vec<Cron>> {
        let state = self.state.read().await;
        let mut crons: Vec<Cron> = state
            .crons
            .values()
            .filter(|cron| cron_matches(cron, owner, filter))
            .cloned()
            .collect();
        crons.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(crons, filter.offset, filter.limit))
    }

    async fn count_crons(&self, owner: Option<&str>, filter: &CronFilter) -> StorageResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .crons
            .values()
            .filter(|cron| cron_matches(cron, owner, filter))
            .count())
    }
}
