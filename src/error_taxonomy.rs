//! Shared error taxonomy across storage, runs, crons and the HTTP layer.
//!
//! HTTP error bodies and SSE `error` frames both serialize an
//! [`ErrorEnvelope`], so clients can reuse one decoder for either.

use serde::{Deserialize, Serialize};

use crate::executor::ExecutorError;
use crate::storage::StorageError;

/// Broad category for typed error handling and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Conflict,
    NotFound,
    Executor,
    Timeout,
    Storage,
    Scheduler,
    Unavailable,
    Internal,
}

/// Wire shape shared by HTTP error responses and SSE `error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub code: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("{0}")]
    Timeout(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Scheduler(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Conflict(_) => ErrorCategory::Conflict,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Executor(_) => ErrorCategory::Executor,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Storage(StorageError::NotFound(_)) => ErrorCategory::NotFound,
            Self::Storage(StorageError::Conflict(_)) => ErrorCategory::Conflict,
            Self::Storage(err) if err.is_retryable() => ErrorCategory::Unavailable,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Unavailable(_) => ErrorCategory::Unavailable,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Executor(ExecutorError::Cancelled) => "executor_cancelled",
            Self::Executor(ExecutorError::Failed { .. }) => "executor_error",
            Self::Timeout(_) => "timeout",
            Self::Storage(StorageError::NotFound(_)) => "not_found",
            Self::Storage(StorageError::Conflict(_)) => "conflict",
            Self::Storage(StorageError::PoolExhausted(_)) => "storage_pool_exhausted",
            Self::Storage(StorageError::Unavailable(_)) => "storage_unavailable",
            Self::Storage(StorageError::Query(_) | StorageError::Corrupt(_)) => "storage_error",
            Self::Scheduler(_) => "scheduler_error",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether a client may retry the same request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_retryable(),
            Self::Unavailable(_) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.code(), self.to_string())
    }
}

impl From<&RuntimeError> for ErrorEnvelope {
    fn from(value: &RuntimeError) -> Self {
        value.envelope()
    }
}
