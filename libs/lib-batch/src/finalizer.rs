//! Completion detection and one-time aggregation.
//!
//! When no task is pending or in progress the job's results are aggregated,
//! written to the configured sink, the recurring trigger is disabled and the
//! job's tasks are discarded. Later invocations then find nothing to do.

use std::collections::HashSet;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use serde::Serialize;

use crate::error::BatchError;
use crate::store::TaskStore;
use crate::task::{StatusCounts, Task};

pub trait Aggregator {
    type Output: Serialize;

    /// Combine every task's result into the final output. Failed tasks are
    /// included in `tasks`; it is up to the aggregator to skip them.
    fn aggregate(&mut self, tasks: &[Task], store: &dyn TaskStore) -> anyhow::Result<Self::Output>;
}

pub trait OutputSink<T: ?Sized> {
    fn emit(&self, output: &T) -> anyhow::Result<()>;
}

/// Stops the recurring schedule that keeps invoking the job.
pub trait Trigger {
    fn disable(&self) -> anyhow::Result<()>;
}

pub struct NoopTrigger;

impl Trigger for NoopTrigger {
    fn disable(&self) -> anyhow::Result<()> {
        tracing::debug!("No trigger to disable");
        Ok(())
    }
}

/// Writes pretty JSON, replacing the file atomically.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl<T: Serialize + ?Sized> OutputSink<T> for JsonFileSink {
    fn emit(&self, output: &T) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(output)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), "Output written");
        Ok(())
    }
}

/// Keeps emitted outputs in memory.
#[derive(Default)]
pub struct MemorySink {
    emitted: Mutex<Vec<serde_json::Value>>,
}

impl MemorySink {
    pub fn emitted(&self) -> Vec<serde_json::Value> {
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T: Serialize + ?Sized> OutputSink<T> for MemorySink {
    fn emit(&self, output: &T) -> anyhow::Result<()> {
        let value = serde_json::to_value(output)?;
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The job has no tasks (never set up, or already finalized).
    Empty,
    Remaining(StatusCounts),
    Finished(StatusCounts),
}

pub struct Finalizer<'a> {
    store: &'a dyn TaskStore,
    trigger: &'a dyn Trigger,
}

impl<'a> Finalizer<'a> {
    pub fn new(store: &'a dyn TaskStore, trigger: &'a dyn Trigger) -> Self {
        Self { store, trigger }
    }

    pub fn detect(&self) -> Result<StatusCounts, BatchError> {
        Ok(self.store.count_by_status()?)
    }

    pub fn finalize<A: Aggregator>(
        &self,
        aggregator: &mut A,
        sink: &dyn OutputSink<A::Output>,
    ) -> Result<Completion, BatchError> {
        let counts = self.detect()?;
        if counts.total() == 0 {
            tracing::info!("No tasks found, nothing to finalize");
            return Ok(Completion::Empty);
        }
        if counts.remaining() > 0 {
            tracing::info!("Progress: {counts}");
            return Ok(Completion::Remaining(counts));
        }

        let tasks = self.store.list_all()?;
        let output = aggregator
            .aggregate(&tasks, self.store)
            .map_err(BatchError::Aggregate)?;
        sink.emit(&output).map_err(BatchError::Output)?;
        self.trigger.disable().map_err(BatchError::Trigger)?;
        self.store.discard()?;

        if counts.failed > 0 {
            tracing::warn!(failed = counts.failed, "Finished with failed tasks: {counts}");
        } else {
            tracing::info!("All tasks finished: {counts}");
        }
        Ok(Completion::Finished(counts))
    }
}

/// Keep the first item for each key, preserving order.
pub fn dedup_first_by<T, K, F>(items: impl IntoIterator<Item = T>, mut key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: FnMut(&T) -> K,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item)))
        .collect()
}
