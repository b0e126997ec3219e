//! Run lifecycle controller.
//!
//! Owns the run state machine: admission through the per-thread arbiter,
//! the execution loop around the [`AgentExecutor`], timeouts, cancellation,
//! terminal bookkeeping on the thread, and hand-off to the next queued run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::arbiter::{ActiveRun, Decision, ThreadLocks, ThreadSlot, arbitrate};
use crate::config::RunsConfig;
use crate::error_taxonomy::{ErrorEnvelope, RuntimeError, RuntimeResult};
use crate::executor::{
    ExecutionEvent, ExecutionRequest, ExecutorError, SharedExecutor,
};
use crate::models::{
    CancelAction, CancelQuery, IfExists, IfNotExists, MultitaskStrategy, OnCompletion, Run,
    RunCreate, RunFilter, RunKwargs, RunListQuery, RunStatus, ThreadCreate, ThreadStatus,
    default_stream_modes, empty_object, merge_values,
};
use crate::storage::{SharedStorage, owner_matches};
use crate::stream::{Frame, StreamHub, Subscription};
use crate::threads::SharedThreadManager;

const DEFAULT_RUN_LIST_LIMIT: usize = 10;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const FORCED_DRAIN: Duration = Duration::from_secs(5);

/// Final record of a run plus the state it left behind.
#[derive(Debug, Clone)]
pub struct Completion {
    pub run: Run,
    pub values: Value,
}

/// A run together with a reader attached to its event stream.
pub struct RunStream {
    pub run: Run,
    pub subscription: Subscription,
}

struct Submitted {
    run: Run,
    frames: mpsc::UnboundedReceiver<Frame>,
    done: watch::Receiver<Option<Completion>>,
}

#[derive(Debug)]
enum Outcome {
    Success(Value),
    Failed(ErrorEnvelope),
    Interrupted,
    TimedOut(String),
}

fn thread_status_after(status: RunStatus) -> ThreadStatus {
    match status {
        RunStatus::Success => ThreadStatus::Idle,
        RunStatus::Interrupted => ThreadStatus::Interrupted,
        RunStatus::Error | RunStatus::Timeout => ThreadStatus::Error,
        RunStatus::Pending | RunStatus::Running => ThreadStatus::Busy,
    }
}

fn cancelled_envelope() -> ErrorEnvelope {
    RuntimeError::from(ExecutorError::Cancelled).envelope()
}

fn run_not_found(run_id: &str) -> RuntimeError {
    RuntimeError::not_found(format!("Run {run_id} not found"))
}

pub struct RunManager {
    storage: SharedStorage,
    threads: SharedThreadManager,
    locks: Arc<ThreadLocks>,
    executor: SharedExecutor,
    hub: StreamHub,
    config: RunsConfig,
    tracker: TaskTracker,
    accepting: AtomicBool,
    force_stop: CancellationToken,
    completions: Mutex<HashMap<String, watch::Sender<Option<Completion>>>>,
    stateless: Mutex<HashMap<String, CancellationToken>>,
    http: reqwest::Client,
}

pub type SharedRunManager = Arc<RunManager>;

impl RunManager {
    #[must_use]
    pub fn new(
        storage: SharedStorage,
        threads: SharedThreadManager,
        locks: Arc<ThreadLocks>,
        executor: SharedExecutor,
        config: RunsConfig,
    ) -> SharedRunManager {
        Arc::new(Self {
            storage,
            threads,
            locks,
            executor,
            hub: StreamHub::new(config.stream_retention),
            config,
            tracker: TaskTracker::new(),
            accepting: AtomicBool::new(true),
            force_stop: CancellationToken::new(),
            completions: Mutex::new(HashMap::new()),
            stateless: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    // === Creation ===

    /// Create a background run.
    pub async fn create(
        self: &Arc<Self>,
        owner: Option<&str>,
        thread_id: Option<&str>,
        req: RunCreate,
    ) -> RuntimeResult<Run> {
        Ok(self.submit(owner, thread_id, req).await?.run)
    }

    /// Create a run and attach a reader before it can emit anything.
    pub async fn create_and_stream(
        self: &Arc<Self>,
        owner: Option<&str>,
        thread_id: Option<&str>,
        req: RunCreate,
    ) -> RuntimeResult<RunStream> {
        let submitted = self.submit(owner, thread_id, req).await?;
        Ok(RunStream {
            run: submitted.run,
            subscription: Subscription::Live(submitted.frames),
        })
    }

    /// Create a run and wait for it to reach a terminal state.
    pub async fn create_and_wait(
        self: &Arc<Self>,
        owner: Option<&str>,
        thread_id: Option<&str>,
        req: RunCreate,
    ) -> RuntimeResult<Completion> {
        let submitted = self.submit(owner, thread_id, req).await?;
        let run_id = submitted.run.run_id.clone();
        self.wait_on(submitted.done, &run_id).await
    }

    async fn submit(
        self: &Arc<Self>,
        owner: Option<&str>,
        thread_id: Option<&str>,
        req: RunCreate,
    ) -> RuntimeResult<Submitted> {
        if !self.is_accepting() {
            return Err(RuntimeError::Unavailable(
                "Server is shutting down and not accepting new runs".to_string(),
            ));
        }
        if req.assistant_id.trim().is_empty() {
            return Err(RuntimeError::validation("assistant_id is required"));
        }
        if let Some(thread_id) = thread_id {
            self.ensure_thread(owner, thread_id, req.if_not_exists)
                .await?;
        }

        let strategy = req.multitask_strategy.unwrap_or_default();
        let run = build_run(owner, thread_id, req);
        self.storage.create_run(&run).await?;
        let frames = self.hub.open(&run.run_id).await;
        let done = self.register_completion(&run.run_id).await;
        tracing::info!(
            run_id = %run.run_id,
            thread_id = run.thread_id.as_deref().unwrap_or("-"),
            strategy = strategy.as_str(),
            "run created"
        );

        let run = match run.thread_id.clone() {
            Some(thread_id) => self.admit(&thread_id, run, strategy).await?,
            None => self.start_stateless(run).await?,
        };
        Ok(Submitted { run, frames, done })
    }

    async fn ensure_thread(
        &self,
        owner: Option<&str>,
        thread_id: &str,
        if_not_exists: IfNotExists,
    ) -> RuntimeResult<()> {
        match self.threads.get(owner, thread_id).await {
            Ok(_) => Ok(()),
            Err(RuntimeError::NotFound(_)) if if_not_exists == IfNotExists::Create => {
                self.threads
                    .create(
                        owner,
                        ThreadCreate {
                            thread_id: Some(thread_id.to_string()),
                            metadata: None,
                            if_exists: IfExists::DoNothing,
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn register_completion(&self, run_id: &str) -> watch::Receiver<Option<Completion>> {
        let (tx, rx) = watch::channel(None);
        self.completions.lock().await.insert(run_id.to_string(), tx);
        rx
    }

    // === Admission ===

    async fn admit(
        self: &Arc<Self>,
        thread_id: &str,
        run: Run,
        strategy: MultitaskStrategy,
    ) -> RuntimeResult<Run> {
        let mut slot = self.locks.lock(thread_id).await;
        let decision = arbitrate(&slot, strategy);
        tracing::debug!(run_id = %run.run_id, thread_id, ?decision, "run arbitrated");
        let admitted = match decision {
            Decision::Start => match self.start_locked(&mut slot, thread_id, run.clone()).await {
                Ok(started) => Ok(started),
                Err(err) => {
                    self.settle_unstarted(run, &err).await;
                    Err(err)
                }
            },
            Decision::Enqueue => {
                slot.queue.push_back(run.run_id.clone());
                Ok(run)
            }
            Decision::Preempt { rollback } => {
                slot.cancel_active(rollback);
                let superseded: Vec<String> = slot.queue.drain(..).collect();
                slot.queue.push_back(run.run_id.clone());
                for run_id in superseded {
                    self.interrupt_pending(&run_id).await;
                }
                Ok(run)
            }
            Decision::Reject => {
                drop(slot);
                self.locks.collect(thread_id).await;
                let err = RuntimeError::conflict(format!(
                    "Thread {thread_id} already has an active run"
                ));
                let rejected = self
                    .record_terminal(run, RunStatus::Error, Some(err.envelope()))
                    .await;
                self.complete(rejected, Value::Null).await;
                return Err(err);
            }
        };
        // A queue left without an owner (e.g. after a failed hand-off) is drained here.
        if slot.active.is_none() && !slot.queue.is_empty() {
            self.start_next_locked(&mut slot, thread_id).await;
        }
        admitted
    }

    async fn start_locked(
        self: &Arc<Self>,
        slot: &mut ThreadSlot,
        thread_id: &str,
        mut run: Run,
    ) -> RuntimeResult<Run> {
        let active = ActiveRun {
            run_id: run.run_id.clone(),
            generation: self.locks.next_generation(),
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
            rollback: false,
        };
        self.transition(&mut run, RunStatus::Running).await?;
        self.threads.set_status(thread_id, ThreadStatus::Busy).await?;
        slot.active = Some(active.clone());
        self.spawn_worker(run.clone(), active.cancel, Some(active.generation));
        Ok(run)
    }

    /// Start the first still-pending queued run. Returns whether one started.
    async fn start_next_locked(self: &Arc<Self>, slot: &mut ThreadSlot, thread_id: &str) -> bool {
        while let Some(run_id) = slot.queue.pop_front() {
            match self.storage.get_run(None, &run_id).await {
                Ok(Some(run)) if run.status == RunStatus::Pending => {
                    match self.start_locked(slot, thread_id, run.clone()).await {
                        Ok(_) => return true,
                        Err(err) => {
                            tracing::error!("Failed to start queued run {run_id}: {err}");
                            self.settle_unstarted(run, &err).await;
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => tracing::error!("Failed to load queued run {run_id}: {err}"),
            }
        }
        false
    }

    /// Fail a run whose start could not be recorded so its waiters return.
    async fn settle_unstarted(&self, run: Run, err: &RuntimeError) {
        let failed = self
            .record_terminal(run, RunStatus::Error, Some(err.envelope()))
            .await;
        self.complete(failed, Value::Null).await;
    }

    async fn start_stateless(self: &Arc<Self>, mut run: Run) -> RuntimeResult<Run> {
        let cancel = CancellationToken::new();
        self.stateless
            .lock()
            .await
            .insert(run.run_id.clone(), cancel.clone());
        self.transition(&mut run, RunStatus::Running).await?;
        self.spawn_worker(run.clone(), cancel, None);
        Ok(run)
    }

    fn spawn_worker(self: &Arc<Self>, run: Run, cancel: CancellationToken, generation: Option<u64>) {
        self.tracker
            .spawn(self.clone().drive(run, cancel, generation));
    }

    async fn transition(&self, run: &mut Run, next: RunStatus) -> RuntimeResult<bool> {
        if !run.status.can_transition_to(next) {
            return Ok(false);
        }
        run.status = next;
        run.updated_at = Utc::now();
        self.storage.update_run(run).await?;
        Ok(true)
    }

    // === Execution ===

    async fn drive(self: Arc<Self>, run: Run, cancel: CancellationToken, generation: Option<u64>) {
        let initial = match self.initial_state(&run).await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!("Failed to load initial state for run {}: {err}", run.run_id);
                self.finalize(run, generation, Outcome::Failed(err.envelope()), Value::Null)
                    .await;
                return;
            }
        };
        self.hub
            .publish(&run.run_id, Frame::metadata(&run.run_id, 1))
            .await;
        self.hub.publish(&run.run_id, Frame::values(&initial)).await;

        let (outcome, partial) = self.execute(&run, initial, &cancel).await;
        self.finalize(run, generation, outcome, partial).await;
    }

    async fn initial_state(&self, run: &Run) -> RuntimeResult<Value> {
        match &run.thread_id {
            Some(thread_id) => {
                let values = self.threads.values(thread_id).await?;
                Ok(merge_values(&values, &run.input))
            }
            None if run.input.is_null() => Ok(empty_object()),
            None => Ok(run.input.clone()),
        }
    }

    /// Drive the executor until it returns, times out or ignores a cancel.
    /// The executor future is dropped on return, so late writes go nowhere.
    async fn execute(
        &self,
        run: &Run,
        initial: Value,
        cancel: &CancellationToken,
    ) -> (Outcome, Value) {
        let request = ExecutionRequest {
            run_id: run.run_id.clone(),
            thread_id: run.thread_id.clone(),
            assistant_id: run.assistant_id.clone(),
            state: initial.clone(),
            config: run.config.clone(),
            interrupt_before: run.kwargs.interrupt_before.clone(),
            interrupt_after: run.kwargs.interrupt_after.clone(),
        };
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut execution =
            AssertUnwindSafe(self.executor.execute(request, events_tx, cancel.clone()))
                .catch_unwind();
        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);
        let grace = self.config.cancel_grace();
        let unacknowledged = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::pin!(unacknowledged);

        let mut partial = initial;
        let outcome = loop {
            tokio::select! {
                biased;
                Some(event) = events_rx.recv() => {
                    self.forward(&run.run_id, event, &mut partial).await;
                }
                result = &mut execution => {
                    while let Ok(event) = events_rx.try_recv() {
                        self.forward(&run.run_id, event, &mut partial).await;
                    }
                    break match result {
                        Ok(Ok(values)) if !cancel.is_cancelled() => Outcome::Success(values),
                        Ok(Ok(_) | Err(ExecutorError::Cancelled)) => Outcome::Interrupted,
                        Ok(Err(err)) => Outcome::Failed(RuntimeError::from(err).envelope()),
                        Err(_) => {
                            tracing::error!(run_id = %run.run_id, "executor panicked");
                            Outcome::Failed(
                                RuntimeError::Internal("Executor panicked".to_string()).envelope(),
                            )
                        }
                    };
                }
                () = &mut unacknowledged => {
                    tracing::warn!(run_id = %run.run_id, "executor ignored cancellation; forcing interrupt");
                    break Outcome::Interrupted;
                }
                () = &mut deadline => {
                    cancel.cancel();
                    break Outcome::TimedOut(format!(
                        "Run exceeded its {}s timeout",
                        self.config.timeout_secs
                    ));
                }
                () = self.force_stop.cancelled() => {
                    cancel.cancel();
                    break Outcome::TimedOut("Run was stopped by server shutdown".to_string());
                }
            }
        };
        (outcome, partial)
    }

    async fn forward(&self, run_id: &str, event: ExecutionEvent, partial: &mut Value) {
        let frame = match event {
            ExecutionEvent::MessageMetadata {
                message_id,
                metadata,
            } => Frame::message_metadata(&message_id, &metadata),
            ExecutionEvent::MessagePartial { message } => Frame::message_partial(&message),
            ExecutionEvent::Update { node, delta, state } => {
                *partial = state;
                Frame::updates(&node, &delta)
            }
        };
        self.hub.publish(run_id, frame).await;
    }

    // === Termination ===

    async fn finalize(
        self: &Arc<Self>,
        run: Run,
        generation: Option<u64>,
        outcome: Outcome,
        partial: Value,
    ) {
        let (status, error, values) = match outcome {
            Outcome::Success(values) => (RunStatus::Success, None, values),
            Outcome::Failed(envelope) => (RunStatus::Error, Some(envelope), partial),
            Outcome::Interrupted => (RunStatus::Interrupted, Some(cancelled_envelope()), partial),
            Outcome::TimedOut(message) => (
                RunStatus::Timeout,
                Some(RuntimeError::Timeout(message).envelope()),
                partial,
            ),
        };

        let (Some(thread_id), Some(generation)) = (run.thread_id.clone(), generation) else {
            self.stateless.lock().await.remove(&run.run_id);
            let run = self.record_terminal(run, status, error).await;
            self.complete(run, values).await;
            return;
        };

        let mut slot = self.locks.lock(&thread_id).await;
        let Some(active) = slot
            .active
            .take_if(|active| active.matches(&run.run_id, generation))
        else {
            // Leave the thread to its current holder but still release this run's waiters.
            drop(slot);
            tracing::warn!(run_id = %run.run_id, generation, "run no longer holds its thread");
            let run = self.record_terminal(run, status, error).await;
            self.complete(run, values).await;
            return;
        };

        let hand_off = self.is_accepting() && !slot.queue.is_empty();
        let thread_status = if hand_off {
            ThreadStatus::Busy
        } else {
            thread_status_after(status)
        };
        let committed = if active.rollback {
            self.threads
                .rollback_run(&thread_id, &run.run_id, active.started_at, thread_status)
                .await
        } else {
            self.threads
                .commit_run(&thread_id, &run.run_id, values.clone(), thread_status)
                .await
        };
        if let Err(err) = committed {
            tracing::error!("Failed to record thread state for run {}: {err}", run.run_id);
        }
        let values = if active.rollback {
            self.threads.values(&thread_id).await.unwrap_or(values)
        } else {
            values
        };
        let run = self.record_terminal(run, status, error).await;

        if hand_off
            && !self.start_next_locked(&mut slot, &thread_id).await
            && let Err(err) = self
                .threads
                .set_status(&thread_id, thread_status_after(status))
                .await
        {
            tracing::error!("Failed to reset thread {thread_id} after run {}: {err}", run.run_id);
        }
        drop(slot);
        self.locks.collect(&thread_id).await;
        self.complete(run, values).await;
    }

    /// Persist a terminal status. Terminal-to-terminal writes are no-ops.
    async fn record_terminal(
        &self,
        run: Run,
        status: RunStatus,
        error: Option<ErrorEnvelope>,
    ) -> Run {
        let mut current = match self.storage.get_run(None, &run.run_id).await {
            Ok(Some(current)) => current,
            Ok(None) => run,
            Err(err) => {
                tracing::error!("Failed to reload run {}: {err}", run.run_id);
                run
            }
        };
        if !current.status.can_transition_to(status) {
            return current;
        }
        current.status = status;
        current.error = error;
        current.updated_at = Utc::now();
        if let Err(err) = self.storage.update_run(&current).await {
            tracing::error!("Failed to persist terminal status for run {}: {err}", current.run_id);
        }
        current
    }

    /// Publish the terminal frame, release waiters and fire the webhook.
    async fn complete(&self, run: Run, values: Value) {
        let frame = match &run.error {
            Some(envelope) => Frame::error(envelope),
            None => Frame::values(&values),
        };
        self.hub.finish(&run, frame).await;
        tracing::info!(run_id = %run.run_id, status = run.status.as_str(), "run finished");

        if let Some(url) = run.kwargs.webhook.clone() {
            self.spawn_webhook(url, run.clone());
        }
        if run.on_completion == OnCompletion::Delete
            && let Err(err) = self.storage.delete_run(None, &run.run_id).await
        {
            tracing::error!("Failed to delete completed run {}: {err}", run.run_id);
        }
        if let Some(tx) = self.completions.lock().await.remove(&run.run_id) {
            tx.send_replace(Some(Completion { run, values }));
        }
    }

    /// Settle a run that never started.
    async fn interrupt_pending(&self, run_id: &str) {
        let run = match self.storage.get_run(None, run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(err) => {
                tracing::error!("Failed to load queued run {run_id}: {err}");
                return;
            }
        };
        let values = match run.thread_id.as_deref() {
            Some(thread_id) => self.threads.values(thread_id).await.unwrap_or(Value::Null),
            None => Value::Null,
        };
        let run = self
            .record_terminal(run, RunStatus::Interrupted, Some(cancelled_envelope()))
            .await;
        self.complete(run, values).await;
    }

    fn spawn_webhook(&self, url: String, run: Run) {
        let client = self.http.clone();
        let timeout = Duration::from_secs(self.config.webhook_timeout_secs);
        self.tracker.spawn(async move {
            match client.post(&url).timeout(timeout).json(&run).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(run_id = %run.run_id, "webhook delivered");
                }
                Ok(response) => tracing::warn!(
                    "Webhook for run {} returned {}",
                    run.run_id,
                    response.status()
                ),
                Err(err) => tracing::warn!("Failed to deliver webhook for run {}: {err}", run.run_id),
            }
        });
    }

    // === Queries & control ===

    pub async fn get(
        &self,
        owner: Option<&str>,
        thread_id: Option<&str>,
        run_id: &str,
    ) -> RuntimeResult<Run> {
        let run = self
            .storage
            .get_run(owner, run_id)
            .await?
            .ok_or_else(|| run_not_found(run_id))?;
        if thread_id.is_some_and(|thread_id| run.thread_id.as_deref() != Some(thread_id)) {
            return Err(run_not_found(run_id));
        }
        Ok(run)
    }

    pub async fn list(
        &self,
        owner: Option<&str>,
        thread_id: &str,
        query: RunListQuery,
    ) -> RuntimeResult<Vec<Run>> {
        self.threads.get(owner, thread_id).await?;
        let filter = RunFilter {
            thread_id: Some(thread_id.to_string()),
            statuses: query.status.into_iter().collect(),
            limit: Some(query.limit.unwrap_or(DEFAULT_RUN_LIST_LIMIT)),
            offset: query.offset.unwrap_or(0),
        };
        Ok(self.storage.list_runs(owner, &filter).await?)
    }

    /// Only terminal runs can be deleted.
    pub async fn delete(
        &self,
        owner: Option<&str>,
        thread_id: Option<&str>,
        run_id: &str,
    ) -> RuntimeResult<()> {
        let run = self.get(owner, thread_id, run_id).await?;
        if !run.status.is_terminal() {
            return Err(RuntimeError::conflict(format!(
                "Run {run_id} is still {}",
                run.status
            )));
        }
        self.storage.delete_run(owner, run_id).await?;
        self.hub.forget(run_id).await;
        Ok(())
    }

    pub async fn cancel(
        self: &Arc<Self>,
        owner: Option<&str>,
        thread_id: Option<&str>,
        run_id: &str,
        query: CancelQuery,
    ) -> RuntimeResult<Run> {
        let run = self.get(owner, thread_id, run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        let rollback = query.action == CancelAction::Rollback;
        match run.thread_id.as_deref() {
            None => {
                if let Some(token) = self.stateless.lock().await.get(run_id) {
                    token.cancel();
                }
            }
            Some(thread_id) => {
                let mut slot = self.locks.lock(thread_id).await;
                let is_active = slot
                    .active
                    .as_ref()
                    .is_some_and(|active| active.run_id == run_id);
                if is_active {
                    slot.cancel_active(rollback);
                } else if slot.dequeue(run_id) {
                    self.interrupt_pending(run_id).await;
                }
                drop(slot);
                self.locks.collect(thread_id).await;
            }
        }
        tracing::info!(run_id, action = ?query.action, "run cancellation requested");

        if query.wait {
            return Ok(self.wait(run_id).await?.run);
        }
        Ok(self.storage.get_run(owner, run_id).await?.unwrap_or(run))
    }

    /// Wait for a run to settle.
    pub async fn wait(&self, run_id: &str) -> RuntimeResult<Completion> {
        let receiver = self
            .completions
            .lock()
            .await
            .get(run_id)
            .map(watch::Sender::subscribe);
        match receiver {
            Some(receiver) => self.wait_on(receiver, run_id).await,
            None => self.wait_in_storage(run_id).await,
        }
    }

    async fn wait_on(
        &self,
        mut receiver: watch::Receiver<Option<Completion>>,
        run_id: &str,
    ) -> RuntimeResult<Completion> {
        let settled = receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|done| done.clone());
        match settled {
            Some(completion) => Ok(completion),
            None => self.wait_in_storage(run_id).await,
        }
    }

    /// Fallback for runs settled before the caller attached, or by another process.
    async fn wait_in_storage(&self, run_id: &str) -> RuntimeResult<Completion> {
        loop {
            let run = self
                .storage
                .get_run(None, run_id)
                .await?
                .ok_or_else(|| run_not_found(run_id))?;
            if run.status.is_terminal() {
                let values = self.settled_values(&run).await?;
                return Ok(Completion { run, values });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    async fn settled_values(&self, run: &Run) -> RuntimeResult<Value> {
        let Some(thread_id) = run.thread_id.as_deref() else {
            return Ok(Value::Null);
        };
        match self.storage.checkpoint_for_run(thread_id, &run.run_id).await? {
            Some(checkpoint) => Ok(checkpoint.values),
            None => self.threads.values(thread_id).await,
        }
    }

    /// Wait for a thread run and return the thread's values afterwards.
    pub async fn join(
        &self,
        owner: Option<&str>,
        thread_id: &str,
        run_id: &str,
    ) -> RuntimeResult<Value> {
        self.get(owner, Some(thread_id), run_id).await?;
        self.wait(run_id).await?;
        self.threads.values(thread_id).await
    }

    /// Attach to a run's stream: live frames while it runs, a replay afterwards.
    pub async fn reconnect(
        &self,
        owner: Option<&str>,
        thread_id: Option<&str>,
        run_id: &str,
    ) -> RuntimeResult<RunStream> {
        // Finished runs replay from the hub first: their record may already
        // be gone from storage (`on_completion = delete`).
        if let Some(stream) = self.replay(owner, thread_id, run_id).await? {
            return Ok(stream);
        }
        let run = match self.get(owner, thread_id, run_id).await {
            Ok(run) => run,
            Err(RuntimeError::NotFound(_)) => {
                // Settled and deleted between the two lookups.
                return self
                    .replay(owner, thread_id, run_id)
                    .await?
                    .ok_or_else(|| run_not_found(run_id));
            }
            Err(err) => return Err(err),
        };
        let subscription = match self.hub.subscribe(run_id).await {
            Some(subscription) => subscription,
            None if run.status.is_terminal() => {
                let frame = match &run.error {
                    Some(envelope) => Frame::error(envelope),
                    None => Frame::values(&self.settled_values(&run).await?),
                };
                Subscription::Finished(frame)
            }
            None => Subscription::Live(self.hub.open(run_id).await),
        };
        Ok(RunStream { run, subscription })
    }

    async fn replay(
        &self,
        owner: Option<&str>,
        thread_id: Option<&str>,
        run_id: &str,
    ) -> RuntimeResult<Option<RunStream>> {
        let Some(retained) = self.hub.retained(run_id).await else {
            return Ok(None);
        };
        let run = retained.run;
        let visible = owner_matches(owner, run.owner_id.as_deref())
            && thread_id.is_none_or(|thread_id| run.thread_id.as_deref() == Some(thread_id));
        if !visible {
            return Err(run_not_found(run_id));
        }
        Ok(Some(RunStream {
            run,
            subscription: Subscription::Finished(retained.frame),
        }))
    }

    // === Process lifecycle ===

    /// Settle runs left behind by a previous process.
    pub async fn recover(self: &Arc<Self>) -> RuntimeResult<()> {
        let orphaned = self
            .storage
            .list_runs(
                None,
                &RunFilter {
                    statuses: vec![RunStatus::Running],
                    ..RunFilter::default()
                },
            )
            .await?;
        for run in orphaned {
            let thread_id = run.thread_id.clone();
            let run = self
                .record_terminal(
                    run,
                    RunStatus::Error,
                    Some(ErrorEnvelope::new(
                        "run_orphaned",
                        "Run was still running when the server stopped",
                    )),
                )
                .await;
            tracing::warn!(run_id = %run.run_id, "marked orphaned run as error");
            if let Some(thread_id) = thread_id
                && let Err(err) = self.threads.set_status(&thread_id, ThreadStatus::Error).await
            {
                tracing::error!("Failed to reset thread {thread_id}: {err}");
            }
        }

        let mut pending = self
            .storage
            .list_runs(
                None,
                &RunFilter {
                    statuses: vec![RunStatus::Pending],
                    ..RunFilter::default()
                },
            )
            .await?;
        pending.sort_by_key(|run| run.created_at);
        let readmitted = pending.len();
        for run in pending {
            let _ = self.hub.open(&run.run_id).await;
            let _ = self.register_completion(&run.run_id).await;
            let run_id = run.run_id.clone();
            let admitted = match run.thread_id.clone() {
                Some(thread_id) => self.admit(&thread_id, run, MultitaskStrategy::Enqueue).await,
                None => self.start_stateless(run).await,
            };
            if let Err(err) = admitted {
                tracing::error!("Failed to re-admit pending run {run_id}: {err}");
            }
        }
        if readmitted > 0 {
            tracing::info!(readmitted, "pending runs re-admitted");
        }
        Ok(())
    }

    /// Stop accepting runs, give in-flight ones a grace period, then force them.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.tracker.close();
        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tracker.len(),
                "runs still active after shutdown grace; forcing timeout"
            );
            self.force_stop.cancel();
            for token in self.locks.active_tokens().await {
                token.cancel();
            }
            if tokio::time::timeout(FORCED_DRAIN, self.tracker.wait())
                .await
                .is_err()
            {
                tracing::error!("Run workers did not exit after forced timeout");
            }
        }
    }
}

fn build_run(owner: Option<&str>, thread_id: Option<&str>, req: RunCreate) -> Run {
    let now = Utc::now();
    let on_completion = req.on_completion.unwrap_or(if thread_id.is_some() {
        OnCompletion::Keep
    } else {
        OnCompletion::Delete
    });
    Run {
        run_id: Uuid::new_v4().to_string(),
        thread_id: thread_id.map(str::to_string),
        assistant_id: req.assistant_id,
        owner_id: owner.map(str::to_string),
        status: RunStatus::Pending,
        input: req.input.unwrap_or(Value::Null),
        config: req.config.unwrap_or_else(empty_object),
        metadata: req.metadata.unwrap_or_else(empty_object),
        multitask_strategy: req.multitask_strategy.unwrap_or_default(),
        on_completion,
        kwargs: RunKwargs {
            stream_mode: req
                .stream_mode
                .map_or_else(default_stream_modes, |modes| modes.into_vec()),
            on_disconnect: req.on_disconnect.unwrap_or_default(),
            webhook: req.webhook,
            interrupt_before: req.interrupt_before.unwrap_or_default(),
            interrupt_after: req.interrupt_after.unwrap_or_default(),
        },
        error: None,
        created_at: now,
        updated_at: now,
    }
}
