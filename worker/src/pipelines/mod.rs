//! The batch pipelines and their dispatch.
//!
//! Every pipeline follows the same shape: `setup` turns an input sheet into
//! tasks plus a few scratch entries, and `process` runs one bounded
//! invocation, finalizing into a JSON file once nothing is left.

pub mod assign_categories;
pub mod free_prompt;
pub mod generate_categories;
pub mod generate_feedback;
pub mod group_knowledge;
pub mod illustration_prompts;
pub mod revise_feedback;
pub mod row_images;

use std::path::Path;

use anyhow::{bail, Context};
use lib_batch::{InvocationReport, JsonFileSink, RunContext, Task, TaskStatus, TaskStore, Trigger};
use lib_utils::csv::render_table;
use serde_json::Value;

use crate::input::Sheet;
use crate::prompt::{image_generator_from_env, text_generator_from_env};
use crate::worker_config::WorkerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineKind {
    GenerateCategories,
    AssignCategories,
    GenerateFeedback,
    FreePrompt,
    ReviseFeedback,
    IllustrationPrompts,
    RowImages,
    GroupKnowledge,
}

const SCRATCH_BASE_PROMPT: &str = "base_prompt";
const SCRATCH_HEADER: &str = "header";

/// What `setup` leaves behind so `process` needs no arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupParams {
    pub base_prompt: String,
    pub header: Vec<String>,
}

impl SetupParams {
    pub fn save(&self, store: &dyn TaskStore) -> anyhow::Result<()> {
        store.write_scratch(SCRATCH_BASE_PROMPT, &self.base_prompt)?;
        store.write_scratch(SCRATCH_HEADER, &serde_json::to_string(&self.header)?)?;
        Ok(())
    }

    /// `None` when the job has no tasks at all (never set up, or finished).
    pub fn load(store: &dyn TaskStore) -> anyhow::Result<Option<Self>> {
        if store.count_by_status()?.total() == 0 {
            return Ok(None);
        }
        let (Some(base_prompt), Some(header)) = (
            store.read_scratch(SCRATCH_BASE_PROMPT)?,
            store.read_scratch(SCRATCH_HEADER)?,
        ) else {
            bail!("task list has no setup parameters; run setup again");
        };
        Ok(Some(Self {
            base_prompt,
            header: serde_json::from_str(&header).context("stored header is not a JSON list")?,
        }))
    }

    pub fn csv(&self, rows: &[Vec<String>]) -> String {
        render_table(self.header.as_slice(), rows)
    }
}

/// Result arrays of done tasks, flattened in store order.
pub(crate) fn concat_done_results(tasks: &[Task]) -> Vec<Value> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .filter_map(|t| t.result.as_ref())
        .flat_map(|result| match result {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        })
        .collect()
}

fn log_invocation(kind: PipelineKind, report: &Option<InvocationReport>) {
    match report {
        Some(report) => tracing::info!(
            pipeline = %kind,
            processed = report.run.processed,
            failed = report.run.failed,
            completion = ?report.completion,
            "Invocation finished"
        ),
        None => tracing::info!(pipeline = %kind, "No task list; nothing to process"),
    }
}

pub fn setup(kind: PipelineKind, cfg: &WorkerConfig, store: &dyn TaskStore) -> anyhow::Result<usize> {
    let vars = &cfg.prompt_vars;
    let pipelines = &cfg.pipelines;
    match kind {
        PipelineKind::GenerateCategories => {
            let c = &pipelines.generate_categories;
            generate_categories::setup(c, &Sheet::load(&c.input)?, vars, store)
        }
        PipelineKind::AssignCategories => {
            let c = &pipelines.assign_categories;
            let categories = load_category_list(&c.categories)?;
            assign_categories::setup(c, &Sheet::load(&c.input)?, &categories, vars, store)
        }
        PipelineKind::GenerateFeedback => {
            let c = &pipelines.generate_feedback;
            generate_feedback::setup(c, &Sheet::load(&c.input)?, vars, store)
        }
        PipelineKind::FreePrompt => {
            let c = &pipelines.free_prompt;
            free_prompt::setup(c, &Sheet::load(&c.input)?, vars, store)
        }
        PipelineKind::RowImages => {
            let c = &pipelines.row_images;
            row_images::setup(c, &Sheet::load(&c.input)?, vars, store)
        }
        PipelineKind::ReviseFeedback => {
            let c = &pipelines.revise_feedback;
            let revisions = Sheet::load(&c.revisions)?;
            revise_feedback::setup(c, &revisions, &Sheet::load(&c.feedback)?, &Sheet::load(&c.source)?, vars, store)
        }
        PipelineKind::IllustrationPrompts => {
            let c = &pipelines.illustration_prompts;
            illustration_prompts::setup(c, &Sheet::load(&c.input)?, vars, store)
        }
        PipelineKind::GroupKnowledge => {
            let c = &pipelines.group_knowledge;
            group_knowledge::setup(c, &Sheet::load(&c.input)?, vars, store)
        }
    }
}

pub fn process(
    kind: PipelineKind,
    cfg: &WorkerConfig,
    ctx: &RunContext,
    trigger: &dyn Trigger,
) -> anyhow::Result<Option<InvocationReport>> {
    let pipelines = &cfg.pipelines;
    let report = match kind {
        PipelineKind::GenerateCategories => {
            let c = &pipelines.generate_categories;
            let sink = JsonFileSink::new(&c.output);
            generate_categories::process(ctx, text_generator_from_env(&cfg.api)?, &sink, trigger)?
        }
        PipelineKind::AssignCategories => {
            let c = &pipelines.assign_categories;
            let sink = JsonFileSink::new(&c.output);
            assign_categories::process(ctx, text_generator_from_env(&cfg.api)?, &sink, trigger)?
        }
        PipelineKind::GenerateFeedback => {
            let c = &pipelines.generate_feedback;
            let sink = JsonFileSink::new(&c.output);
            let options = generate_feedback::LoopOptions::new(c, cfg.budget.inner_margin);
            generate_feedback::process(ctx, options, text_generator_from_env(&cfg.api)?, &sink, trigger)?
        }
        PipelineKind::FreePrompt => {
            let c = &pipelines.free_prompt;
            let sink = JsonFileSink::new(&c.output);
            free_prompt::process(ctx, text_generator_from_env(&cfg.api)?, &sink, trigger)?
        }
        PipelineKind::RowImages => {
            let c = &pipelines.row_images;
            let sink = JsonFileSink::new(&c.output);
            let generator = image_generator_from_env(&cfg.api)?;
            row_images::process(ctx, &c.output_dir, c.generations, generator, &sink, trigger)?
        }
        PipelineKind::ReviseFeedback => {
            let sink = JsonFileSink::new(&pipelines.revise_feedback.output);
            revise_feedback::process(ctx, text_generator_from_env(&cfg.api)?, &sink, trigger)?
        }
        PipelineKind::IllustrationPrompts => {
            let sink = JsonFileSink::new(&pipelines.illustration_prompts.output);
            illustration_prompts::process(ctx, text_generator_from_env(&cfg.api)?, &sink, trigger)?
        }
        PipelineKind::GroupKnowledge => {
            let sink = JsonFileSink::new(&pipelines.group_knowledge.output);
            group_knowledge::process(ctx, text_generator_from_env(&cfg.api)?, &sink, trigger)?
        }
    };
    log_invocation(kind, &report);
    Ok(report)
}

fn load_category_list(path: &Path) -> anyhow::Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading category list {}", path.display()))?;
    let list = lib_utils::json::parse_json_list(&text)
        .with_context(|| format!("parsing category list {}", path.display()))?;
    if list.is_empty() {
        bail!("category list {} is empty", path.display());
    }
    Ok(list)
}
