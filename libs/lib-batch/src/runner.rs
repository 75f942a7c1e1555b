//! Runs pending tasks one at a time until the list is drained or the time
//! budget says the next task might not finish.

use serde_json::Value;
use uuid::Uuid;

use crate::budget::Budget;
use crate::caller::ResilientCaller;
use crate::clock::Clock;
use crate::context::RunContext;
use crate::error::{BatchError, StoreError, TaskError};
use crate::store::TaskStore;
use crate::task::{Claim, Task, TaskStatus};

/// The per-task work of a pipeline.
pub trait TaskBody {
    /// Load continuation state left by a previous invocation.
    fn resume(&mut self, _store: &dyn TaskStore) -> Result<(), StoreError> {
        Ok(())
    }

    /// Process one task. `Ok(Some(value))` is stored as the task's result.
    fn run(&mut self, task: &Task, ctx: &TaskContext<'_>) -> Result<Option<Value>, TaskError>;

    /// Persist continuation state before the invocation ends.
    fn checkpoint(&mut self, _store: &dyn TaskStore) -> Result<(), StoreError> {
        Ok(())
    }
}

/// What a task body can see of the running invocation.
pub struct TaskContext<'a> {
    run: &'a RunContext,
    budget: &'a Budget,
    run_id: &'a str,
}

impl TaskContext<'_> {
    pub fn caller(&self) -> &ResilientCaller {
        &self.run.caller
    }

    pub fn store(&self) -> &dyn TaskStore {
        self.run.store.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.run.clock.as_ref()
    }

    pub fn run_id(&self) -> &str {
        self.run_id
    }

    /// Check, from inside a long task, that one more step of the average
    /// length (scaled by `margin`) still fits. A failure aborts the
    /// invocation and leaves the task to be resumed.
    pub fn ensure_budget(&self, margin: f64) -> Result<(), TaskError> {
        let assessment = self.budget.assess(self.run.clock.now_ms(), margin);
        if assessment.proceed {
            Ok(())
        } else {
            Err(TaskError::BudgetExceeded(format!(
                "{} ms left, {:.0} ms needed",
                assessment.remaining_ms, assessment.required_ms
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Drained,
    BudgetExhausted,
    Aborted { key: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub processed: usize,
    pub failed: usize,
    /// Tasks claimed by another live run.
    pub skipped: usize,
    pub durations_ms: Vec<i64>,
    pub stop: StopReason,
}

pub struct BatchRunner<'a> {
    ctx: &'a RunContext,
}

impl<'a> BatchRunner<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    pub fn run(&self, body: &mut dyn TaskBody) -> Result<RunReport, BatchError> {
        let ctx = self.ctx;
        let store = ctx.store.as_ref();
        let run_id = Uuid::new_v4().to_string();
        let mut budget = Budget::start(ctx.budget.clone(), ctx.clock.now_ms());

        let mut report = RunReport {
            run_id: run_id.clone(),
            processed: 0,
            failed: 0,
            skipped: 0,
            durations_ms: Vec::new(),
            stop: StopReason::Drained,
        };

        let pending = store.list_pending()?;
        if pending.is_empty() {
            tracing::info!(job = %ctx.job, "No pending tasks");
            return Ok(report);
        }
        body.resume(store)?;
        tracing::info!(job = %ctx.job, run_id = %run_id, pending = pending.len(), "Starting batch run");

        for task in pending {
            let now = ctx.clock.now_ms();
            let assessment = budget.assess(now, budget.config().safety_margin);
            if !assessment.proceed {
                tracing::info!(
                    elapsed_ms = assessment.elapsed_ms,
                    remaining_ms = assessment.remaining_ms,
                    required_ms = assessment.required_ms as i64,
                    "Not enough time left for another task, stopping"
                );
                report.stop = StopReason::BudgetExhausted;
                break;
            }

            let claim = Claim::new(run_id.clone(), now);
            if !store.claim(&task.key, &claim, ctx.claim_lease)? {
                tracing::debug!(key = %task.key, "Task held by another run, skipping");
                report.skipped += 1;
                continue;
            }

            tracing::info!(key = %task.key, "Running task");
            let started = ctx.clock.now_ms();
            let outcome = body.run(
                &task,
                &TaskContext {
                    run: ctx,
                    budget: &budget,
                    run_id: &run_id,
                },
            );
            let elapsed = ctx.clock.now_ms() - started;
            budget.record(elapsed);

            let mut abort = None;
            let recorded = match outcome {
                Ok(result) => Self::record_done(store, &task.key, result).map(|()| {
                    report.processed += 1;
                    tracing::info!(key = %task.key, elapsed_ms = elapsed, "Task done");
                }),
                Err(err) if err.is_fatal() => {
                    tracing::error!(key = %task.key, "Aborting run: {err}");
                    abort = Some(err.to_string());
                    store.release(&task.key)
                }
                Err(err) => {
                    tracing::error!(key = %task.key, "Task failed: {err}");
                    report.failed += 1;
                    store.set_status(&task.key, TaskStatus::failed(err.to_string()))
                }
            };

            if let Err(err) = recorded {
                tracing::error!(key = %task.key, "Recording task outcome failed: {err}");
                self.salvage(body, &task.key);
                return Err(err.into());
            }
            if let Some(reason) = abort {
                report.stop = StopReason::Aborted {
                    key: task.key.clone(),
                    reason,
                };
                break;
            }
        }

        body.checkpoint(store)?;
        report.durations_ms = budget.samples().to_vec();
        tracing::info!(
            run_id = %run_id,
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            stop = ?report.stop,
            "Batch run finished"
        );
        Ok(report)
    }

    fn record_done(store: &dyn TaskStore, key: &str, result: Option<Value>) -> Result<(), StoreError> {
        if let Some(result) = result {
            store.write_result(key, &result)?;
        }
        store.set_status(key, TaskStatus::Done)
    }

    /// Best effort after a store failure mid-run: hand the task back to the
    /// next invocation and keep the body's continuation state.
    fn salvage(&self, body: &mut dyn TaskBody, key: &str) {
        let store = self.ctx.store.as_ref();
        if let Err(err) = store.release(key) {
            tracing::warn!(key = %key, "Could not release task: {err}");
        }
        if let Err(err) = body.checkpoint(store) {
            tracing::warn!("Could not checkpoint after store failure: {err}");
        }
    }
}
