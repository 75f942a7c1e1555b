use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;

use crate::error::StoreError;
use crate::task::{Claim, NewTask, Task, TaskStatus};

use super::{can_claim, check_transition, check_unique_keys, TaskStore};

/// In-process store for tests and single-shot runs.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tasks: Vec<Task>,
    scratch: BTreeMap<String, String>,
}

impl Inner {
    fn task_mut(&mut self, key: &str) -> Result<&mut Task, StoreError> {
        self.tasks
            .iter_mut()
            .find(|task| task.key == key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskStore for MemoryTaskStore {
    fn create_all(&self, tasks: Vec<NewTask>) -> Result<usize, StoreError> {
        check_unique_keys(&tasks)?;
        let mut inner = self.lock();
        inner.scratch.clear();
        inner.tasks = tasks
            .into_iter()
            .map(|task| Task {
                key: task.key,
                payload: task.payload,
                status: TaskStatus::Pending,
                result: None,
                claim: None,
            })
            .collect();
        Ok(inner.tasks.len())
    }

    fn list_all(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.lock().tasks.clone())
    }

    fn get(&self, key: &str) -> Result<Task, StoreError> {
        self.lock().task_mut(key).map(|task| task.clone())
    }

    fn claim(&self, key: &str, claim: &Claim, lease: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let task = inner.task_mut(key)?;
        if !can_claim(task, claim, lease) {
            return Ok(false);
        }
        task.status = TaskStatus::InProgress;
        task.claim = Some(claim.clone());
        Ok(true)
    }

    fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let task = inner.task_mut(key)?;
        if task.status == TaskStatus::InProgress {
            task.claim = None;
        }
        Ok(())
    }

    fn set_status(&self, key: &str, status: TaskStatus) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let task = inner.task_mut(key)?;
        check_transition(key, &task.status, &status)?;
        task.status = status;
        Ok(())
    }

    fn write_result(&self, key: &str, result: &Value) -> Result<(), StoreError> {
        self.lock().task_mut(key)?.result = Some(result.clone());
        Ok(())
    }

    fn read_scratch(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().scratch.get(name).cloned())
    }

    fn write_scratch(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.lock().scratch.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn clear_scratch(&self, name: &str) -> Result<(), StoreError> {
        self.lock().scratch.remove(name);
        Ok(())
    }

    fn rearm_failed(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let mut rearmed = 0;
        for task in inner.tasks.iter_mut() {
            if matches!(task.status, TaskStatus::Failed(_)) {
                task.status = TaskStatus::Pending;
                task.result = None;
                task.claim = None;
                rearmed += 1;
            }
        }
        Ok(rearmed)
    }

    fn discard(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.tasks.clear();
        inner.scratch.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[test]
    fn test_create_and_list() {
        conformance::create_and_list(&MemoryTaskStore::new());
    }

    #[test]
    fn test_lifecycle() {
        conformance::lifecycle(&MemoryTaskStore::new());
    }

    #[test]
    fn test_claims() {
        conformance::claims(&MemoryTaskStore::new());
    }

    #[test]
    fn test_scratch() {
        conformance::scratch(&MemoryTaskStore::new());
    }
}
