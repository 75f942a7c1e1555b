mod input;
mod observability;
mod pipelines;
mod prompt;
mod scheduler;
#[cfg(test)]
mod testing;
mod worker_config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lib_batch::rate_gate::SqliteLedger;
use lib_batch::{
    Completion, NoopTrigger, RateGate, ReqwestTransport, ResilientCaller, RunContext, SharedClock,
    SqliteTaskStore, SystemClock, Trigger,
};
use mimalloc::MiMalloc;

use crate::pipelines::PipelineKind;
use crate::worker_config::WorkerConfig;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(version, about = "Checkpointed batch worker for generative-AI pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Split the pipeline's input into tasks, replacing any previous task list.
    Setup { pipeline: PipelineKind },
    /// Run pending tasks until the time budget runs out, finalizing when none are left.
    Process { pipeline: PipelineKind },
    /// Repeat `process` on the configured interval until the job finalizes.
    Schedule { pipeline: PipelineKind },
    /// Show task counts and the shared rate window.
    Status { pipeline: PipelineKind },
    /// Put failed tasks back to pending.
    Rearm { pipeline: PipelineKind },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = WorkerConfig::load().context("Failed to load worker config")?;
    observability::init_tracing(&cfg.log);
    tracing::debug!("{cfg}");

    match cli.command {
        Command::Setup { pipeline } => {
            let ctx = build_context(&cfg, pipeline)?;
            let created = pipelines::setup(pipeline, &cfg, ctx.store.as_ref())?;
            tracing::info!(pipeline = %pipeline, tasks = created, "Setup complete");
        }
        Command::Process { pipeline } => {
            process_once(&cfg, pipeline, &NoopTrigger)?;
        }
        Command::Schedule { pipeline } => {
            let interval = Duration::from_secs(cfg.schedule.interval_secs.max(1));
            let cfg = Arc::new(cfg);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(scheduler::run_schedule(interval, move |trigger| {
                process_once(&cfg, pipeline, trigger)
            }))?;
        }
        Command::Status { pipeline } => {
            let ctx = build_context(&cfg, pipeline)?;
            let counts = ctx.store.count_by_status()?;
            println!("{pipeline}: {counts}");
            println!("rate window: {}", ctx.caller.gate().status());
        }
        Command::Rearm { pipeline } => {
            let ctx = build_context(&cfg, pipeline)?;
            let rearmed = ctx.store.rearm_failed()?;
            tracing::info!(pipeline = %pipeline, rearmed, "Failed tasks re-armed");
        }
    }
    Ok(())
}

/// Everything one invocation needs. Built fresh per invocation, on the
/// thread that runs it.
fn build_context(cfg: &WorkerConfig, pipeline: PipelineKind) -> anyhow::Result<RunContext> {
    let db_path = &cfg.storage.path;
    let ledger_path = &cfg.storage.ledger_path;
    for path in [db_path, ledger_path] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let clock: SharedClock = Arc::new(SystemClock);
    let job = pipeline.to_string();
    let store = SqliteTaskStore::open(db_path, &job)
        .with_context(|| format!("opening task store {}", db_path.display()))?;
    let ledger = SqliteLedger::open(ledger_path, &cfg.storage.ledger_name)
        .with_context(|| format!("opening rate ledger {}", ledger_path.display()))?;
    let gate = RateGate::new(cfg.limits.gate_config(), Arc::new(ledger), clock.clone());
    let transport = ReqwestTransport::new(Duration::from_secs(cfg.api.request_timeout_secs))?;
    let caller = ResilientCaller::new(
        Arc::new(transport),
        Arc::new(gate),
        clock.clone(),
        cfg.limits.retry_policy(),
    );

    let ctx = RunContext::new(
        job,
        Arc::new(store),
        Arc::new(caller),
        clock,
        cfg.budget.budget_config(),
    );
    Ok(match cfg.budget.claim_lease_secs {
        Some(secs) => ctx.with_claim_lease(Duration::from_secs(secs)),
        None => ctx,
    })
}

fn process_once(cfg: &WorkerConfig, pipeline: PipelineKind, trigger: &dyn Trigger) -> anyhow::Result<Completion> {
    let ctx = build_context(cfg, pipeline)?;
    let report = pipelines::process(pipeline, cfg, &ctx, trigger)?;
    Ok(report.map_or(Completion::Empty, |r| r.completion))
}
