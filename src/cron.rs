//! Cron scheduler: one timer task per active cron.
//!
//! Every firing goes through [`RunManager`] like any client request, so the
//! per-thread arbiter still applies. Timer waits are capped and re-checked
//! against the wall clock, so arbitrarily distant dates never overflow a
//! single sleep.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error_taxonomy::{RuntimeError, RuntimeResult};
use crate::models::{
    Cron, CronCreate, CronFilter, CronPayload, CronSearch, CronUpdate, IfExists, MultitaskStrategy,
    OnCompletion, Run, RunCreate, ThreadCreate, empty_object, merge_values,
};
use crate::runs::SharedRunManager;
use crate::storage::SharedStorage;
use crate::threads::SharedThreadManager;

const DEFAULT_CRON_LIST_LIMIT: usize = 10;
const TIMER_DRAIN: Duration = Duration::from_secs(5);

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Parse a 5-field crontab or a 6/7-field expression with seconds.
pub fn parse_schedule(expression: &str) -> RuntimeResult<Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, day, month, weekday] => format!(
            "0 {minute} {hour} {day} {month} {}",
            crontab_weekdays(weekday)
        ),
        _ => fields.join(" "),
    };
    Schedule::from_str(&normalized).map_err(|err| {
        RuntimeError::validation(format!("Invalid cron schedule '{expression}': {err}"))
    })
}

/// Crontab numbers weekdays 0-7 from Sunday; the parser numbers them 1-7.
/// Numbers are rewritten to names so both conventions agree.
fn crontab_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = range
                .split('-')
                .map(|part| match part.parse::<usize>() {
                    Ok(day) if day < WEEKDAYS.len() => WEEKDAYS[day].to_string(),
                    _ => part.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// First occurrence strictly after `after` that falls before `end_time`.
#[must_use]
pub fn next_occurrence(
    schedule: &Schedule,
    after: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after)
        .next()
        .filter(|next| end_time.is_none_or(|end| *next < end))
}

fn cron_not_found(cron_id: &str) -> RuntimeError {
    RuntimeError::not_found(format!("Cron {cron_id} not found"))
}

struct Timer {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CronScheduler {
    storage: SharedStorage,
    runs: SharedRunManager,
    threads: SharedThreadManager,
    config: SchedulerConfig,
    timers: Mutex<HashMap<String, Timer>>,
    next_timer: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

pub type SharedCronScheduler = Arc<CronScheduler>;

impl CronScheduler {
    #[must_use]
    pub fn new(
        storage: SharedStorage,
        runs: SharedRunManager,
        threads: SharedThreadManager,
        config: SchedulerConfig,
    ) -> SharedCronScheduler {
        Arc::new(Self {
            storage,
            runs,
            threads,
            config,
            timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    // === CRUD ===

    pub async fn create(
        self: &Arc<Self>,
        owner: Option<&str>,
        thread_id: Option<&str>,
        req: CronCreate,
    ) -> RuntimeResult<Cron> {
        if req.assistant_id.trim().is_empty() {
            return Err(RuntimeError::validation("assistant_id is required"));
        }
        let schedule = parse_schedule(&req.schedule)?;
        if let Some(thread_id) = thread_id {
            self.threads.get(owner, thread_id).await?;
        }

        let now = Utc::now();
        let metadata = req.metadata.unwrap_or_else(empty_object);
        let cron = Cron {
            cron_id: Uuid::new_v4().to_string(),
            assistant_id: req.assistant_id,
            thread_id: thread_id.map(str::to_string),
            owner_id: owner.map(str::to_string),
            schedule: req.schedule,
            end_time: req.end_time,
            next_run_date: next_occurrence(&schedule, now, req.end_time),
            payload: CronPayload {
                input: req.input.unwrap_or(Value::Null),
                config: req.config.unwrap_or_else(empty_object),
                metadata: metadata.clone(),
                webhook: req.webhook,
                interrupt_before: req.interrupt_before.unwrap_or_default(),
                interrupt_after: req.interrupt_after.unwrap_or_default(),
                multitask_strategy: req.multitask_strategy,
            },
            on_run_completed: req.on_run_completed.unwrap_or(OnCompletion::Delete),
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.storage.create_cron(&cron).await?;
        tracing::info!(
            cron_id = %cron.cron_id,
            schedule = %cron.schedule,
            next_run_date = ?cron.next_run_date,
            "cron created"
        );
        self.arm(&cron).await;
        Ok(cron)
    }

    pub async fn get(&self, owner: Option<&str>, cron_id: &str) -> RuntimeResult<Cron> {
        self.storage
            .get_cron(owner, cron_id)
            .await?
            .ok_or_else(|| cron_not_found(cron_id))
    }

    /// Patch a cron and re-arm its timer against the new schedule.
    pub async fn update(
        self: &Arc<Self>,
        owner: Option<&str>,
        cron_id: &str,
        patch: CronUpdate,
    ) -> RuntimeResult<Cron> {
        let mut cron = self.get(owner, cron_id).await?;
        if let Some(schedule) = patch.schedule {
            parse_schedule(&schedule)?;
            cron.schedule = schedule;
        }
        if patch.end_time.is_some() {
            cron.end_time = patch.end_time;
        }
        if let Some(input) = patch.input {
            cron.payload.input = input;
        }
        if let Some(config) = patch.config {
            cron.payload.config = config;
        }
        if let Some(metadata) = patch.metadata {
            cron.metadata = merge_values(&cron.metadata, &metadata);
            cron.payload.metadata = merge_values(&cron.payload.metadata, &metadata);
        }
        if patch.webhook.is_some() {
            cron.payload.webhook = patch.webhook;
        }

        let schedule = parse_schedule(&cron.schedule)?;
        let now = Utc::now();
        cron.next_run_date = next_occurrence(&schedule, now, cron.end_time);
        cron.updated_at = now;
        self.storage.update_cron(&cron).await?;
        self.disarm(cron_id).await;
        self.arm(&cron).await;
        tracing::info!(cron_id, next_run_date = ?cron.next_run_date, "cron updated");
        Ok(cron)
    }

    /// Cancel the timer and remove the record together.
    pub async fn delete(&self, owner: Option<&str>, cron_id: &str) -> RuntimeResult<()> {
        self.get(owner, cron_id).await?;
        let mut timers = self.timers.lock().await;
        if let Some(timer) = timers.remove(cron_id) {
            timer.cancel.cancel();
        }
        if !self.storage.delete_cron(owner, cron_id).await? {
            return Err(cron_not_found(cron_id));
        }
        drop(timers);
        tracing::info!(cron_id, "cron deleted");
        Ok(())
    }

    pub async fn search(&self, owner: Option<&str>, search: CronSearch) -> RuntimeResult<Vec<Cron>> {
        let mut filter = CronFilter::from(search);
        filter.limit = Some(filter.limit.unwrap_or(DEFAULT_CRON_LIST_LIMIT));
        Ok(self.storage.list_crons(owner, &filter).await?)
    }

    pub async fn count(&self, owner: Option<&str>, search: CronSearch) -> RuntimeResult<usize> {
        let filter = CronFilter {
            limit: None,
            offset: 0,
            ..CronFilter::from(search)
        };
        Ok(self.storage.count_crons(owner, &filter).await?)
    }

    // === Timers ===

    /// Arm a timer for every stored cron that still has a next run date.
    /// Dates already in the past fire once straight away.
    pub async fn start(self: &Arc<Self>) -> RuntimeResult<()> {
        if !self.config.enabled {
            tracing::info!("cron scheduler disabled");
            return Ok(());
        }
        let crons = self
            .storage
            .list_crons(None, &CronFilter::default())
            .await?;
        let mut armed = 0usize;
        for cron in &crons {
            if self.arm(cron).await {
                armed += 1;
            }
        }
        tracing::info!(armed, total = crons.len(), "cron scheduler started");
        Ok(())
    }

    #[cfg(test)]
    pub async fn is_armed(&self, cron_id: &str) -> bool {
        self.timers.lock().await.contains_key(cron_id)
    }

    /// Cancel every outstanding timer and wait for in-flight firings.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let timers: Vec<Timer> = self.timers.lock().await.drain().map(|(_, t)| t).collect();
        for timer in &timers {
            timer.cancel.cancel();
        }
        self.tracker.close();
        if tokio::time::timeout(TIMER_DRAIN, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("cron timers did not stop in time; aborting");
            for timer in timers {
                timer.handle.abort();
            }
        }
    }

    async fn arm(self: &Arc<Self>, cron: &Cron) -> bool {
        if !self.config.enabled || self.shutdown.is_cancelled() || cron.next_run_date.is_none() {
            return false;
        }
        // Held across the spawn so a timer that retires at once finds its entry.
        let mut timers = self.timers.lock().await;
        let id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let handle = self
            .tracker
            .spawn(self.clone().run_timer(cron.clone(), id, cancel.clone()));
        if let Some(previous) = timers.insert(cron.cron_id.clone(), Timer { id, cancel, handle }) {
            previous.cancel.cancel();
        }
        true
    }

    async fn disarm(&self, cron_id: &str) {
        if let Some(timer) = self.timers.lock().await.remove(cron_id) {
            timer.cancel.cancel();
        }
    }

    /// Wait for each due date and fire. Only deletion, expiry, an unusable
    /// schedule or cancellation ends the loop; storage hiccups do not.
    async fn run_timer(self: Arc<Self>, cron: Cron, id: u64, cancel: CancellationToken) {
        let cron_id = cron.cron_id.clone();
        let mut current = cron;
        while let Some(due) = current.next_run_date {
            if !self.sleep_until(due, &cancel).await {
                return;
            }
            match self.fire(current, &cancel).await {
                Ok(Some(next)) => current = next,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!("Cron {cron_id} could not be rescheduled: {err}");
                    break;
                }
            }
        }
        let mut timers = self.timers.lock().await;
        if timers.get(&cron_id).is_some_and(|timer| timer.id == id) {
            timers.remove(&cron_id);
            tracing::debug!(cron_id = %cron_id, "cron timer retired");
        }
    }

    /// Returns false when cancelled before `due`.
    async fn sleep_until(&self, due: DateTime<Utc>, cancel: &CancellationToken) -> bool {
        loop {
            let Ok(remaining) = (due - Utc::now()).to_std() else {
                return true;
            };
            if remaining.is_zero() {
                return true;
            }
            let wait = remaining.min(self.config.max_timer_wait());
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Fire once and persist the next run date.
    ///
    /// Returns the cron to wait on next, or `None` to retire the timer. The
    /// next run date is kept in memory when it cannot be persisted.
    async fn fire(&self, snapshot: Cron, cancel: &CancellationToken) -> RuntimeResult<Option<Cron>> {
        let cron_id = snapshot.cron_id.clone();
        let mut cron = match self.storage.get_cron(None, &cron_id).await {
            Ok(Some(stored)) => Cron {
                next_run_date: snapshot.next_run_date,
                ..stored
            },
            Ok(None) => return Ok(None),
            Err(err) => {
                tracing::warn!("Failed to reload cron {cron_id}; firing from memory: {err}");
                snapshot
            }
        };
        let now = Utc::now();
        if cron.end_time.is_some_and(|end| end <= now) {
            cron.next_run_date = None;
            cron.updated_at = now;
            self.persist(&cron).await;
            tracing::info!(cron_id = %cron_id, "cron expired; timer retired");
            return Ok(None);
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }

        match self.launch(&cron).await {
            Ok(run) => tracing::info!(cron_id = %cron_id, run_id = %run.run_id, "cron fired"),
            Err(err) => tracing::error!("Cron {cron_id} failed to create a run: {err}"),
        }

        let schedule = parse_schedule(&cron.schedule).map_err(|err| {
            RuntimeError::Scheduler(format!("Stored schedule for cron {cron_id} is unusable: {err}"))
        })?;
        let after = cron.next_run_date.map_or(now, |previous| previous.max(now));
        cron.next_run_date = next_occurrence(&schedule, after, cron.end_time);
        cron.updated_at = Utc::now();
        self.persist(&cron).await;
        Ok(cron.next_run_date.is_some().then_some(cron))
    }

    async fn persist(&self, cron: &Cron) {
        if let Err(err) = self.storage.update_cron(cron).await {
            tracing::error!(
                "Failed to persist next run date for cron {}: {err}",
                cron.cron_id
            );
        }
    }

    async fn launch(&self, cron: &Cron) -> RuntimeResult<Run> {
        let owner = cron.owner_id.as_deref();
        let payload = &cron.payload;
        let req = RunCreate {
            assistant_id: cron.assistant_id.clone(),
            input: Some(payload.input.clone()),
            config: Some(payload.config.clone()),
            metadata: Some(merge_values(
                &payload.metadata,
                &json!({ "cron_id": cron.cron_id }),
            )),
            multitask_strategy: Some(
                payload
                    .multitask_strategy
                    .unwrap_or(MultitaskStrategy::Enqueue),
            ),
            webhook: payload.webhook.clone(),
            interrupt_before: Some(payload.interrupt_before.clone()),
            interrupt_after: Some(payload.interrupt_after.clone()),
            ..RunCreate::default()
        };

        if let Some(thread_id) = cron.thread_id.as_deref() {
            return self.runs.create(owner, Some(thread_id), req).await;
        }

        let thread = self
            .threads
            .create(
                owner,
                ThreadCreate {
                    thread_id: None,
                    metadata: Some(json!({ "cron_id": cron.cron_id })),
                    if_exists: IfExists::Raise,
                },
            )
            .await?;
        let run = self
            .runs
            .create(owner, Some(&thread.thread_id), req)
            .await?;
        if cron.on_run_completed == OnCompletion::Delete {
            self.spawn_cleanup(owner.map(str::to_string), thread.thread_id, run.run_id.clone());
        }
        Ok(run)
    }

    /// Remove a per-firing thread once its run is terminal.
    fn spawn_cleanup(&self, owner: Option<String>, thread_id: String, run_id: String) {
        let runs = self.runs.clone();
        let threads = self.threads.clone();
        self.tracker.spawn(async move {
            if let Err(err) = runs.wait(&run_id).await {
                tracing::warn!("Failed to wait for cron run {run_id}: {err}");
                return;
            }
            if let Err(err) = threads.delete(owner.as_deref(), &thread_id).await {
                tracing::warn!("Failed to delete cron thread {thread_id}: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ThreadLocks;
    use crate::config::RunsConfig;
    use crate::executor::EchoExecutor;
    use crate::models::{RunFilter, RunStatus, ThreadFilter};
    use crate::runs::RunManager;
    use crate::storage::test_support::FaultyStorage;
    use crate::storage::{MemoryStorage, Storage};
    use crate::threads::ThreadManager;
    use anyhow::Result;
    use chrono::{Datelike, TimeDelta, Timelike, Weekday};
    use pretty_assertions::assert_eq;

    struct Harness {
        crons: SharedCronScheduler,
        storage: SharedStorage,
    }

    fn harness() -> Harness {
        harness_on(Arc::new(MemoryStorage::new()))
    }

    fn harness_on(storage: SharedStorage) -> Harness {
        let locks = Arc::new(ThreadLocks::new());
        let threads = Arc::new(ThreadManager::new(storage.clone(), locks.clone()));
        let runs = RunManager::new(
            storage.clone(),
            threads.clone(),
            locks,
            Arc::new(EchoExecutor::new(Duration::from_millis(1))),
            RunsConfig::default(),
        );
        let crons = CronScheduler::new(
            storage.clone(),
            runs,
            threads,
            SchedulerConfig::default(),
        );
        Harness { crons, storage }
    }

    fn stored_cron(thread_id: Option<&str>, schedule: &str) -> Cron {
        let now = Utc::now();
        Cron {
            cron_id: Uuid::new_v4().to_string(),
            assistant_id: "agent".to_string(),
            thread_id: thread_id.map(str::to_string),
            owner_id: None,
            schedule: schedule.to_string(),
            end_time: None,
            next_run_date: Some(now - TimeDelta::seconds(1)),
            payload: CronPayload {
                input: json!({ "messages": ["tick"] }),
                ..CronPayload::default()
            },
            on_run_completed: OnCompletion::Keep,
            metadata: empty_object(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn runs_on(storage: &SharedStorage, thread_id: &str) -> Result<Vec<Run>> {
        Ok(storage
            .list_runs(
                None,
                &RunFilter {
                    thread_id: Some(thread_id.to_string()),
                    ..RunFilter::default()
                },
            )
            .await?)
    }

    async fn until<F, Fut>(mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        for _ in 0..100 {
            if check().await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        anyhow::bail!("condition not reached in time")
    }

    #[test]
    fn five_field_schedules_use_crontab_weekdays() -> Result<()> {
        let monday = chrono::NaiveDate::from_ymd_opt(2026, 3, 2)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .map(|d| d.and_utc())
            .ok_or_else(|| anyhow::anyhow!("bad date"))?;

        let sunday = parse_schedule("0 0 * * 0")?;
        let next = next_occurrence(&sunday, monday, None).expect("next sunday");
        assert_eq!(next.weekday(), Weekday::Sun);

        let also_sunday = parse_schedule("30 6 * * 7")?;
        let next = next_occurrence(&also_sunday, monday, None).expect("next sunday");
        assert_eq!((next.weekday(), next.hour(), next.minute()), (Weekday::Sun, 6, 30));

        let weekdays = parse_schedule("0 9 * * 1-5")?;
        let next = next_occurrence(&weekdays, monday, None).expect("next weekday");
        assert_eq!(next.weekday(), Weekday::Tue);
        assert_eq!(next.hour(), 9);
        Ok(())
    }

    #[test]
    fn six_field_schedules_pass_through() -> Result<()> {
        let every_second = parse_schedule("* * * * * *")?;
        let now = Utc::now();
        let next = next_occurrence(&every_second, now, None).expect("next second");
        assert!(next > now);
        assert!(next - now <= TimeDelta::seconds(1));
        Ok(())
    }

    #[test]
    fn invalid_schedule_is_a_validation_error() {
        let err = parse_schedule("every tuesday").expect_err("invalid");
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn end_time_bounds_next_occurrence() -> Result<()> {
        let schedule = parse_schedule("* * * * *")?;
        let now = Utc::now();
        assert!(next_occurrence(&schedule, now, Some(now)).is_none());
        assert!(next_occurrence(&schedule, now, Some(now + TimeDelta::hours(1))).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn due_cron_fires_exactly_once_and_advances() -> Result<()> {
        let h = harness();
        h.crons
            .threads
            .create(
                None,
                ThreadCreate {
                    thread_id: Some("t-cron".to_string()),
                    ..ThreadCreate::default()
                },
            )
            .await?;
        let cron = stored_cron(Some("t-cron"), "* * * * *");
        let previous = cron.next_run_date.expect("due date");
        h.storage.create_cron(&cron).await?;

        h.crons.start().await?;
        let storage = &h.storage;
        let (crons, cron_id) = (&h.crons, cron.cron_id.as_str());
        until(move || async move {
            let fired = runs_on(storage, "t-cron").await?.len() == 1;
            let advanced = crons.get(None, cron_id).await?.next_run_date > Some(previous);
            Ok(fired && advanced)
        })
        .await?;

        let stored = h.crons.get(None, &cron.cron_id).await?;
        let next = stored.next_run_date.expect("rescheduled");
        assert!(next > previous);
        assert!(next > Utc::now());
        assert!(h.crons.is_armed(&cron.cron_id).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let runs = runs_on(&h.storage, "t-cron").await?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].metadata["cron_id"], json!(cron.cron_id));
        h.crons.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn storage_outage_keeps_timer_armed() -> Result<()> {
        let storage = Arc::new(FaultyStorage::new());
        let h = harness_on(storage.clone());
        h.crons
            .threads
            .create(
                None,
                ThreadCreate {
                    thread_id: Some("t-outage".to_string()),
                    ..ThreadCreate::default()
                },
            )
            .await?;
        let cron = stored_cron(Some("t-outage"), "* * * * * *");
        let previous = cron.next_run_date;
        h.storage.create_cron(&cron).await?;

        storage.fail("create_run");
        storage.fail("update_cron");
        h.crons.start().await?;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(h.crons.is_armed(&cron.cron_id).await);
        assert!(runs_on(&h.storage, "t-outage").await?.is_empty());
        // Nothing could be persisted, so the stored date never moved.
        assert_eq!(h.crons.get(None, &cron.cron_id).await?.next_run_date, previous);

        storage.heal("create_run");
        storage.heal("update_cron");
        let (crons, storage, cron_id) = (&h.crons, &h.storage, cron.cron_id.as_str());
        until(move || async move {
            let fired = !runs_on(storage, "t-outage").await?.is_empty();
            let advanced = crons.get(None, cron_id).await?.next_run_date > previous;
            Ok(fired && advanced)
        })
        .await?;
        assert!(h.crons.is_armed(&cron.cron_id).await);
        h.crons.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn deleted_cron_retires_its_timer() -> Result<()> {
        let h = harness();
        let mut cron = stored_cron(None, "* * * * * *");
        cron.next_run_date = Some(Utc::now() + TimeDelta::milliseconds(300));
        h.storage.create_cron(&cron).await?;
        h.crons.start().await?;
        assert!(h.crons.is_armed(&cron.cron_id).await);

        // Removed behind the scheduler's back: the next firing finds nothing.
        h.storage.delete_cron(None, &cron.cron_id).await?;
        let (crons, cron_id) = (&h.crons, cron.cron_id.as_str());
        until(move || async move { Ok(!crons.is_armed(cron_id).await) }).await?;
        let runs = h.storage.list_runs(None, &RunFilter::default()).await?;
        assert!(runs.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn expired_cron_creates_no_run_and_is_retired() -> Result<()> {
        let h = harness();
        let mut cron = stored_cron(None, "* * * * *");
        cron.end_time = Some(Utc::now() - TimeDelta::milliseconds(500));
        h.storage.create_cron(&cron).await?;

        h.crons.start().await?;
        let (crons, cron_id) = (&h.crons, cron.cron_id.as_str());
        until(move || async move { Ok(!crons.is_armed(cron_id).await) }).await?;

        let stored = h.crons.get(None, &cron.cron_id).await?;
        assert_eq!(stored.next_run_date, None);
        let runs = h.storage.list_runs(None, &RunFilter::default()).await?;
        assert!(runs.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn stateless_cron_thread_is_removed_after_run() -> Result<()> {
        let h = harness();
        let mut cron = stored_cron(None, "* * * * *");
        cron.on_run_completed = OnCompletion::Delete;
        h.storage.create_cron(&cron).await?;

        h.crons.start().await?;
        let (crons, storage) = (&h.crons, &h.storage);
        let (cron_id, previous) = (cron.cron_id.as_str(), cron.next_run_date);
        until(move || async move {
            let advanced = crons.get(None, cron_id).await?.next_run_date > previous;
            let threads = storage.search_threads(None, &ThreadFilter::default()).await?;
            Ok(advanced && threads.is_empty())
        })
        .await?;
        // Deleting the thread takes its run records with it.
        assert!(storage.list_runs(None, &RunFilter::default()).await?.is_empty());
        h.crons.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn create_arms_and_delete_disarms() -> Result<()> {
        let h = harness();
        let cron = h
            .crons
            .create(
                None,
                None,
                CronCreate {
                    assistant_id: "agent".to_string(),
                    schedule: "0 0 1 1 *".to_string(),
                    ..CronCreate::default()
                },
            )
            .await?;
        assert!(cron.next_run_date.is_some_and(|next| next > Utc::now()));
        assert!(h.crons.is_armed(&cron.cron_id).await);
        assert_eq!(h.crons.count(None, CronSearch::default()).await?, 1);

        h.crons.delete(None, &cron.cron_id).await?;
        assert!(!h.crons.is_armed(&cron.cron_id).await);
        let err = h.crons.get(None, &cron.cron_id).await.expect_err("deleted");
        assert_eq!(err.code(), "not_found");
        Ok(())
    }

    #[tokio::test]
    async fn create_rejects_bad_schedule_and_unknown_thread() -> Result<()> {
        let h = harness();
        let bad = CronCreate {
            assistant_id: "agent".to_string(),
            schedule: "61 * * * *".to_string(),
            ..CronCreate::default()
        };
        let err = h.crons.create(None, None, bad).await.expect_err("bad schedule");
        assert_eq!(err.code(), "validation_error");

        let orphan = CronCreate {
            assistant_id: "agent".to_string(),
            schedule: "* * * * *".to_string(),
            ..CronCreate::default()
        };
        let err = h
            .crons
            .create(None, Some("ghost"), orphan)
            .await
            .expect_err("unknown thread");
        assert_eq!(err.code(), "not_found");
        Ok(())
    }

    #[tokio::test]
    async fn update_reschedules_and_clears_past_end_time() -> Result<()> {
        let h = harness();
        let cron = h
            .crons
            .create(
                None,
                None,
                CronCreate {
                    assistant_id: "agent".to_string(),
                    schedule: "0 0 1 1 *".to_string(),
                    ..CronCreate::default()
                },
            )
            .await?;

        let hourly = h
            .crons
            .update(
                None,
                &cron.cron_id,
                CronUpdate {
                    schedule: Some("0 * * * *".to_string()),
                    metadata: Some(json!({ "team": "ops" })),
                    ..CronUpdate::default()
                },
            )
            .await?;
        let next = hourly.next_run_date.expect("hourly");
        assert!(next - Utc::now() <= TimeDelta::hours(1));
        assert_eq!(hourly.metadata["team"], json!("ops"));
        assert!(h.crons.is_armed(&cron.cron_id).await);

        let ended = h
            .crons
            .update(
                None,
                &cron.cron_id,
                CronUpdate {
                    end_time: Some(Utc::now()),
                    ..CronUpdate::default()
                },
            )
            .await?;
        assert_eq!(ended.next_run_date, None);
        assert!(!h.crons.is_armed(&cron.cron_id).await);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_cancels_all_timers() -> Result<()> {
        let h = harness();
        for _ in 0..3 {
            h.crons
                .create(
                    None,
                    None,
                    CronCreate {
                        assistant_id: "agent".to_string(),
                        schedule: "0 0 1 1 *".to_string(),
                        ..CronCreate::default()
                    },
                )
                .await?;
        }
        h.crons.shutdown().await;
        let crons = h.crons.search(None, CronSearch::default()).await?;
        assert_eq!(crons.len(), 3);
        for cron in crons {
            assert!(!h.crons.is_armed(&cron.cron_id).await);
        }
        let status_filter = RunFilter {
            statuses: vec![RunStatus::Pending, RunStatus::Running],
            ..RunFilter::default()
        };
        assert_eq!(h.storage.count_runs(None, &status_filter).await?, 0);
        Ok(())
    }
}
