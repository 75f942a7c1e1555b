//! Persistent task lists.
//!
//! A store holds the tasks of one job, in insertion order, plus a small
//! key/value scratch area for state that must survive between invocations
//! (continuation buffers, setup parameters).

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use serde_json::Value;

use crate::error::StoreError;
use crate::task::{Claim, NewTask, StatusCounts, StatusKind, Task, TaskStatus};

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

pub trait TaskStore: Send + Sync {
    /// Replace every task and scratch entry of the job with `tasks`.
    fn create_all(&self, tasks: Vec<NewTask>) -> Result<usize, StoreError>;

    /// All tasks in insertion order.
    fn list_all(&self) -> Result<Vec<Task>, StoreError>;

    /// Pending tasks and interrupted in-progress ones, in insertion order.
    fn list_pending(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|task| matches!(task.status.kind(), StatusKind::Pending | StatusKind::InProgress))
            .collect())
    }

    fn get(&self, key: &str) -> Result<Task, StoreError>;

    /// Atomically move a task to in-progress under `claim`. Succeeds for a
    /// pending task, or an in-progress one whose claim is absent, expired or
    /// already owned by the same run. Returns `false` if another run holds it
    /// or the task is finished.
    fn claim(&self, key: &str, claim: &Claim, lease: Duration) -> Result<bool, StoreError>;

    /// Drop the claim on an in-progress task so the next run resumes it.
    fn release(&self, key: &str) -> Result<(), StoreError>;

    fn set_status(&self, key: &str, status: TaskStatus) -> Result<(), StoreError>;

    fn write_result(&self, key: &str, result: &Value) -> Result<(), StoreError>;

    fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        Ok(self.list_all()?.iter().map(|task| &task.status).collect())
    }

    fn read_scratch(&self, name: &str) -> Result<Option<String>, StoreError>;

    fn write_scratch(&self, name: &str, value: &str) -> Result<(), StoreError>;

    fn clear_scratch(&self, name: &str) -> Result<(), StoreError>;

    /// Put failed tasks back to pending. Returns how many were re-armed.
    fn rearm_failed(&self) -> Result<usize, StoreError>;

    /// Delete the job's tasks and scratch.
    fn discard(&self) -> Result<(), StoreError>;
}

pub(crate) fn can_claim(task: &Task, claim: &Claim, lease: Duration) -> bool {
    match task.status.kind() {
        StatusKind::Pending => true,
        StatusKind::InProgress => match &task.claim {
            None => true,
            Some(held) => held.run_id == claim.run_id || !held.is_live(claim.claimed_at_ms, lease),
        },
        StatusKind::Done | StatusKind::Failed => false,
    }
}

pub(crate) fn check_transition(key: &str, from: &TaskStatus, to: &TaskStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            key: key.to_string(),
            from: from.kind(),
            to: to.kind(),
        })
    }
}

pub(crate) fn check_unique_keys(tasks: &[NewTask]) -> Result<(), StoreError> {
    let mut seen = std::collections::HashSet::new();
    for task in tasks {
        if !seen.insert(task.key.as_str()) {
            return Err(StoreError::DuplicateKey(task.key.clone()));
        }
    }
    Ok(())
}
