//! Per-thread serialization and multitask arbitration.
//!
//! Every thread gets a lazily created async mutex guarding a [`ThreadSlot`]:
//! the run that currently owns the thread plus the FIFO of runs waiting for
//! it. Arbitration, the pending→running flip and run finalization all happen
//! while holding that mutex; the executor itself runs outside it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::models::MultitaskStrategy;

/// The run that currently owns a thread.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub run_id: String,
    /// Stamp checked at finalize so a stale worker cannot write.
    pub generation: u64,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    /// Restore the pre-run checkpoint instead of committing this run's state.
    pub rollback: bool,
}

impl ActiveRun {
    #[must_use]
    pub fn matches(&self, run_id: &str, generation: u64) -> bool {
        self.run_id == run_id && self.generation == generation
    }
}

#[derive(Debug, Default)]
pub struct ThreadSlot {
    pub active: Option<ActiveRun>,
    pub queue: VecDeque<String>,
}

impl ThreadSlot {
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// Cancel the active run; with `rollback` its state will be discarded.
    pub fn cancel_active(&mut self, rollback: bool) {
        if let Some(active) = self.active.as_mut() {
            active.rollback |= rollback;
            active.cancel.cancel();
        }
    }

    /// Remove a waiting run. Returns whether it was queued.
    pub fn dequeue(&mut self, run_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|queued| queued != run_id);
        before != self.queue.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Thread is free; the run owns it now.
    Start,
    /// Another run is active; refuse with a conflict.
    Reject,
    /// Wait behind the active run.
    Enqueue,
    /// Cancel the active run and every queued one, then go first.
    Preempt { rollback: bool },
}

/// Decide how a new run interacts with the thread's current occupant.
#[must_use]
pub fn arbitrate(slot: &ThreadSlot, strategy: MultitaskStrategy) -> Decision {
    if slot.is_idle() {
        return Decision::Start;
    }
    match strategy {
        MultitaskStrategy::Reject => Decision::Reject,
        MultitaskStrategy::Enqueue => Decision::Enqueue,
        MultitaskStrategy::Interrupt => Decision::Preempt { rollback: false },
        MultitaskStrategy::Rollback => Decision::Preempt { rollback: true },
    }
}

pub type SlotGuard = OwnedMutexGuard<ThreadSlot>;

/// Map from `thread_id` to its slot mutex.
#[derive(Default)]
pub struct ThreadLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<ThreadSlot>>>>,
    generation: AtomicU64,
}

impl ThreadLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, thread_id: &str) -> SlotGuard {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ThreadSlot::default())))
                .clone()
        };
        slot.lock_owned().await
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop the slot for `thread_id` if nobody holds it and it is idle.
    pub async fn collect(&self, thread_id: &str) {
        let mut slots = self.slots.lock().await;
        let removable = slots.get(thread_id).is_some_and(|slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().is_ok_and(|guard| guard.is_idle())
        });
        if removable {
            slots.remove(thread_id);
        }
    }

    /// Snapshot of every active cancellation token, for shutdown.
    pub async fn active_tokens(&self) -> Vec<CancellationToken> {
        let slots: Vec<_> = self.slots.lock().await.values().cloned().collect();
        let mut tokens = Vec::new();
        for slot in slots {
            if let Some(active) = &slot.lock().await.active {
                tokens.push(active.cancel.clone());
            }
        }
        tokens
    }

    #[cfg(test)]
    pub async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }
}
