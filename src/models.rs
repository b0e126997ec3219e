//! Runtime entities and request/response models for threads, runs and crons.
//!
//! These types are shared verbatim by the HTTP layer and every storage
//! backend, so their serialized names are part of the wire contract.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error_taxonomy::ErrorEnvelope;

#[must_use]
pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Identity resolved upstream for a request; `None` means anonymous (unscoped).
pub type OwnerId = Option<String>;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "invalid {} '{other}'",
                        stringify!($name)
                    )),
                }
            }
        }
    };
}

// === Threads ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Idle,
    Busy,
    Interrupted,
    Error,
}

string_enum!(ThreadStatus {
    Idle => "idle",
    Busy => "busy",
    Interrupted => "interrupted",
    Error => "error",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub status: ThreadStatus,
    #[serde(default = "empty_object")]
    pub values: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    #[must_use]
    pub fn new(thread_id: impl Into<String>, owner_id: OwnerId, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            owner_id,
            status: ThreadStatus::Idle,
            values: empty_object(),
            metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only state snapshot of a thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<String>,
    pub values: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRef {
    pub thread_id: String,
    pub checkpoint_id: String,
}

/// Client-facing view of a thread snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadState {
    pub values: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint: Option<CheckpointRef>,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Checkpoint> for ThreadState {
    fn from(value: Checkpoint) -> Self {
        let parent_checkpoint = value.parent_checkpoint_id.map(|checkpoint_id| CheckpointRef {
            thread_id: value.thread_id.clone(),
            checkpoint_id,
        });
        Self {
            values: value.values,
            checkpoint: Some(CheckpointRef {
                thread_id: value.thread_id,
                checkpoint_id: value.checkpoint_id,
            }),
            parent_checkpoint,
            metadata: value.metadata,
            run_id: value.run_id,
            created_at: Some(value.created_at),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    #[default]
    Raise,
    DoNothing,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ThreadCreate {
    pub thread_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub if_exists: IfExists,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ThreadSearch {
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub status: Option<ThreadStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadStateUpdate {
    pub values: Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub before: Option<String>,
}

// === Runs ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Interrupted,
}

string_enum!(RunStatus {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Error => "error",
    Timeout => "timeout",
    Interrupted => "interrupted",
});

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Timeout | Self::Interrupted
        )
    }

    /// Whether `next` is a forward step of the run state machine.
    ///
    /// Terminal states accept nothing; callers treat a rejected
    /// terminal-to-terminal write as an idempotent no-op.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MultitaskStrategy {
    #[default]
    Reject,
    Enqueue,
    Interrupt,
    Rollback,
}

string_enum!(MultitaskStrategy {
    Reject => "reject",
    Enqueue => "enqueue",
    Interrupt => "interrupt",
    Rollback => "rollback",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnCompletion {
    Delete,
    Keep,
}

string_enum!(OnCompletion {
    Delete => "delete",
    Keep => "keep",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IfNotExists {
    Create,
    #[default]
    Reject,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnDisconnect {
    Cancel,
    #[default]
    Continue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Values,
    Updates,
    Messages,
}

#[must_use]
pub fn default_stream_modes() -> Vec<StreamMode> {
    vec![StreamMode::Values, StreamMode::Updates, StreamMode::Messages]
}

/// Accepts either `"values"` or `["values", "updates"]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

/// Execution options frozen on the run record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunKwargs {
    #[serde(default = "default_stream_modes")]
    pub stream_mode: Vec<StreamMode>,
    #[serde(default)]
    pub on_disconnect: OnDisconnect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupt_before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupt_after: Vec<String>,
}

impl Default for RunKwargs {
    fn default() -> Self {
        Self {
            stream_mode: default_stream_modes(),
            on_disconnect: OnDisconnect::default(),
            webhook: None,
            interrupt_before: Vec::new(),
            interrupt_after: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub thread_id: Option<String>,
    pub assistant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    pub multitask_strategy: MultitaskStrategy,
    pub on_completion: OnCompletion,
    #[serde(default)]
    pub kwargs: RunKwargs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Path a client can use to reconnect to this run's stream.
    #[must_use]
    pub fn stream_location(&self) -> String {
        match &self.thread_id {
            Some(thread_id) => format!("/threads/{thread_id}/runs/{}", self.run_id),
            None => format!("/runs/{}", self.run_id),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RunCreate {
    #[serde(default)]
    pub assistant_id: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub multitask_strategy: Option<MultitaskStrategy>,
    #[serde(default)]
    pub on_completion: Option<OnCompletion>,
    #[serde(default)]
    pub if_not_exists: IfNotExists,
    #[serde(default)]
    pub stream_mode: Option<OneOrMany<StreamMode>>,
    #[serde(default)]
    pub on_disconnect: Option<OnDisconnect>,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub interrupt_before: Option<Vec<String>>,
    #[serde(default)]
    pub interrupt_after: Option<Vec<String>>,
}

impl RunCreate {
    #[cfg(test)]
    #[must_use]
    pub fn for_assistant(assistant_id: impl Into<String>, input: Value) -> Self {
        Self {
            assistant_id: assistant_id.into(),
            input: Some(input),
            ..Self::default()
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_strategy(mut self, strategy: MultitaskStrategy) -> Self {
        self.multitask_strategy = Some(strategy);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CancelAction {
    #[default]
    Interrupt,
    Rollback,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CancelQuery {
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub action: CancelAction,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RunListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub status: Option<RunStatus>,
}

// === Crons ===

/// Frozen run-creation parameters replayed on every firing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CronPayload {
    #[serde(default)]
    pub input: Value,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupt_before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupt_after: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multitask_strategy: Option<MultitaskStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cron {
    pub cron_id: String,
    pub assistant_id: String,
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub schedule: String,
    pub end_time: Option<DateTime<Utc>>,
    pub next_run_date: Option<DateTime<Utc>>,
    pub payload: CronPayload,
    pub on_run_completed: OnCompletion,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CronCreate {
    #[serde(default)]
    pub assistant_id: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub interrupt_before: Option<Vec<String>>,
    #[serde(default)]
    pub interrupt_after: Option<Vec<String>>,
    #[serde(default)]
    pub multitask_strategy: Option<MultitaskStrategy>,
    #[serde(default)]
    pub on_run_completed: Option<OnCompletion>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CronUpdate {
    pub schedule: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub config: Option<Value>,
    pub metadata: Option<Value>,
    pub webhook: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CronSearch {
    pub assistant_id: Option<String>,
    pub thread_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

// === Storage filters ===

#[derive(Debug, Clone, Default)]
pub struct ThreadFilter {
    pub metadata: Option<Value>,
    pub status: Option<ThreadStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl From<ThreadSearch> for ThreadFilter {
    fn from(value: ThreadSearch) -> Self {
        Self {
            metadata: value.metadata,
            status: value.status,
            limit: value.limit,
            offset: value.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub thread_id: Option<String>,
    pub statuses: Vec<RunStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CronFilter {
    pub assistant_id: Option<String>,
    pub thread_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl From<CronSearch> for CronFilter {
    fn from(value: CronSearch) -> Self {
        Self {
            assistant_id: value.assistant_id,
            thread_id: value.thread_id,
            limit: value.limit,
            offset: value.offset.unwrap_or(0),
        }
    }
}

/// Whether every key of `filter` is present in `metadata` with an equal value.
#[must_use]
pub fn metadata_contains(metadata: &Value, filter: &Value) -> bool {
    match (metadata, filter) {
        (_, Value::Null) => true,
        (Value::Object(have), Value::Object(want)) => want
            .iter()
            .all(|(key, value)| have.get(key).is_some_and(|v| v == value)),
        _ => false,
    }
}

/// Shallow-merge `input` into `base` the way thread values accumulate.
#[must_use]
pub fn merge_values(base: &Value, input: &Value) -> Value {
    match (base, input) {
        (Value::Object(base_map), Value::Object(input_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in input_map {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, input) => input.clone(),
    }
}
