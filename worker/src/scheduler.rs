//! Re-runs `process` on a fixed interval until the job finalizes.
//!
//! Invocations are blocking, so each tick hands the work to the blocking
//! pool. A tick that fires while the previous invocation is still running
//! is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use lib_batch::{Completion, Trigger};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_cron_scheduler::{Job, JobScheduler};

/// Disables the schedule by signalling the loop in [`run_schedule`].
#[derive(Clone)]
pub struct ChannelTrigger {
    tx: mpsc::Sender<()>,
}

impl ChannelTrigger {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }
}

impl Trigger for ChannelTrigger {
    fn disable(&self) -> anyhow::Result<()> {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => Ok(()),
            Err(TrySendError::Closed(())) => bail!("schedule already stopped"),
        }
    }
}

async fn tick<F>(invocation: Arc<F>, trigger: ChannelTrigger, running: Arc<AtomicBool>)
where
    F: Fn(&ChannelTrigger) -> anyhow::Result<Completion> + Send + Sync + 'static,
{
    if running.swap(true, Ordering::AcqRel) {
        tracing::warn!("Previous invocation still running, skipping tick");
        return;
    }

    let stop = trigger.clone();
    let outcome = tokio::task::spawn_blocking(move || invocation(&trigger)).await;
    running.store(false, Ordering::Release);

    match outcome {
        Ok(Ok(Completion::Remaining(counts))) => tracing::info!("Invocation done, {counts}"),
        Ok(Ok(Completion::Finished(counts))) => tracing::info!("Job finalized, {counts}"),
        Ok(Ok(Completion::Empty)) => {
            tracing::warn!("Job has no tasks, stopping schedule");
            if let Err(e) = stop.disable() {
                tracing::error!("Failed to stop schedule: {e:?}");
            }
        }
        Ok(Err(e)) => tracing::error!("Invocation failed: {e:?}"),
        Err(e) => tracing::error!("Invocation panicked: {e}"),
    }
}

/// Run `invocation` shortly after start and then every `interval`, until it
/// disables its trigger or the process is interrupted.
pub async fn run_schedule<F>(interval: Duration, invocation: F) -> anyhow::Result<()>
where
    F: Fn(&ChannelTrigger) -> anyhow::Result<Completion> + Send + Sync + 'static,
{
    let (trigger, mut disabled) = ChannelTrigger::new();
    let invocation = Arc::new(invocation);
    let running = Arc::new(AtomicBool::new(false));

    let mut scheduler = JobScheduler::new().await?;
    {
        let (invocation, trigger, running) = (invocation.clone(), trigger.clone(), running.clone());
        scheduler
            .add(Job::new_one_shot_async(Duration::from_secs(1), move |_uuid, _l| {
                Box::pin(tick(invocation.clone(), trigger.clone(), running.clone()))
            })?)
            .await?;
    }
    let repeated = scheduler
        .add(Job::new_repeated_async(interval, move |_uuid, _l| {
            Box::pin(tick(invocation.clone(), trigger.clone(), running.clone()))
        })?)
        .await?;

    scheduler.set_shutdown_handler(Box::new(|| {
        Box::pin(async move {
            tracing::info!("Shutting down scheduler");
        })
    }));
    scheduler.start().await?;
    tracing::info!(interval_secs = interval.as_secs(), "Scheduler started");

    tokio::select! {
        _ = disabled.recv() => tracing::info!("Trigger disabled, stopping schedule"),
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, stopping schedule"),
    }

    scheduler.remove(&repeated).await?;
    scheduler.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use lib_batch::StatusCounts;

    use super::*;

    #[tokio::test]
    async fn test_trigger_signals_once_and_tolerates_repeats() {
        let (trigger, mut rx) = ChannelTrigger::new();
        trigger.disable().unwrap();
        trigger.disable().unwrap();
        assert_eq!(rx.recv().await, Some(()));

        drop(rx);
        assert!(trigger.disable().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_schedule_stops_when_job_finalizes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let schedule = run_schedule(Duration::from_secs(1), move |trigger| {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let counts = StatusCounts {
                done: call,
                ..Default::default()
            };
            if call < 2 {
                Ok(Completion::Remaining(counts))
            } else {
                trigger.disable()?;
                Ok(Completion::Finished(counts))
            }
        });

        tokio::time::timeout(Duration::from_secs(20), schedule)
            .await
            .expect("schedule should stop")
            .unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
