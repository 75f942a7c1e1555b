use std::time::Duration;

use thiserror::Error;

use crate::task::StatusKind;

/// Failure to get a response at all. HTTP error statuses are not transport
/// errors; they come back as a normal response.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("non-retryable error (HTTP {status}): {body}")]
    Permanent { status: u16, body: String },

    #[error("call failed after {attempts} attempts, last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("could not build request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("rate ledger lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("rate ledger storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(error: rusqlite::Error) -> Self {
        LedgerError::Storage(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("duplicate task key: {0}")]
    DuplicateKey(String),

    #[error("task {key}: cannot move from {from} to {to}")]
    InvalidTransition {
        key: String,
        from: StatusKind,
        to: StatusKind,
    },
}

/// Error returned by a task body.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The task's own time check failed. Aborts the whole invocation.
    #[error("time budget exhausted inside task: {0}")]
    BudgetExceeded(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::BudgetExceeded(_))
    }
}

/// Errors that end an invocation. Statuses already written stay valid.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("aggregation failed: {0}")]
    Aggregate(anyhow::Error),

    #[error("writing output failed: {0}")]
    Output(anyhow::Error),

    #[error("could not disable trigger: {0}")]
    Trigger(anyhow::Error),
}
