//! Multi-round feedback per group of rows.
//!
//! Rows are grouped by one column. For each group the model is asked
//! repeatedly for feedback as a markdown table, each round seeing what was
//! already said, until it signals it has nothing to add. Rounds are
//! persisted as they happen, so a group interrupted by the time budget picks
//! up at the next round in the following invocation.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use indexmap::IndexMap;
use indoc::formatdoc;
use lib_batch::{
    invoke, Aggregator, InvocationReport, NewTask, OutputSink, RunContext, StoreError, Task, TaskBody,
    TaskContext, TaskError, TaskStore, Trigger,
};
use lib_utils::markdown::table_rows;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{concat_done_results, SetupParams};
use crate::input::Sheet;
use crate::prompt::{render_base_prompt, TextGenerator};
use crate::worker_config::FeedbackConfig;

const SCRATCH_ROUNDS: &str = "feedback_rounds";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupPayload {
    group: String,
    rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Round {
    group: String,
    text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackRow {
    pub group: String,
    pub cells: Vec<String>,
}

/// How the per-group loop ends.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub end_marker: String,
    pub max_rounds: usize,
    /// Budget margin checked before every round.
    pub inner_margin: f64,
}

impl LoopOptions {
    pub fn new(cfg: &FeedbackConfig, inner_margin: f64) -> Self {
        Self {
            end_marker: cfg.end_marker.clone(),
            max_rounds: cfg.max_rounds.max(1),
            inner_margin,
        }
    }
}

pub fn setup(
    cfg: &FeedbackConfig,
    sheet: &Sheet,
    vars: &BTreeMap<String, String>,
    store: &dyn TaskStore,
) -> anyhow::Result<usize> {
    let Some(column) = sheet.column_index(&cfg.group_column) else {
        bail!("group column {:?} not found in sheet header", cfg.group_column);
    };

    let mut groups: IndexMap<String, Vec<Vec<String>>> = IndexMap::new();
    let mut ungrouped = 0;
    for row in &sheet.rows {
        match row.get(column).map(|cell| cell.trim()) {
            Some(group) if !group.is_empty() => groups.entry(group.to_string()).or_default().push(row.clone()),
            _ => ungrouped += 1,
        }
    }
    if ungrouped > 0 {
        tracing::warn!(rows = ungrouped, column = %cfg.group_column, "Skipping rows without a group");
    }
    if groups.is_empty() {
        bail!("no rows with a value in column {:?}", cfg.group_column);
    }

    let tasks = groups
        .into_iter()
        .map(|(group, rows)| {
            let payload = serde_json::to_value(GroupPayload {
                group: group.clone(),
                rows,
            })?;
            Ok(NewTask::new(group, payload))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let base_prompt = render_base_prompt(&cfg.prompt, vars)?;
    let created = store.create_all(tasks)?;
    SetupParams {
        base_prompt,
        header: sheet.header.clone(),
    }
    .save(store)?;
    Ok(created)
}

pub fn process(
    ctx: &RunContext,
    options: LoopOptions,
    generator: Arc<dyn TextGenerator>,
    sink: &dyn OutputSink<Vec<Value>>,
    trigger: &dyn Trigger,
) -> anyhow::Result<Option<InvocationReport>> {
    let Some(params) = SetupParams::load(ctx.store.as_ref())? else {
        return Ok(None);
    };
    let mut body = FeedbackBody {
        params,
        options,
        generator,
        rounds: Vec::new(),
    };
    Ok(Some(invoke(ctx, &mut body, &mut FeedbackTable, sink, trigger)?))
}

struct FeedbackBody {
    params: SetupParams,
    options: LoopOptions,
    generator: Arc<dyn TextGenerator>,
    rounds: Vec<Round>,
}

impl FeedbackBody {
    fn prompt(&self, group: &str, csv: &str) -> String {
        let mut prompt = self.params.base_prompt.clone();
        if !self.rounds.is_empty() {
            let previous = self
                .rounds
                .iter()
                .map(|round| format!("## {}\n{}", round.group, round.text.trim()))
                .collect::<Vec<_>>()
                .join("\n\n");
            prompt.push_str(&formatdoc! {"


                # これまでに出したフィードバック
                同じ内容を繰り返さないでください。
                {previous}"});
        }
        let end_marker = &self.options.end_marker;
        prompt.push_str(&formatdoc! {"


            # 対象グループ: {group}
            ---
            {csv}
            ---

            フィードバックをマークダウンの表で出力してください。ヘッダー行は不要です。
            追加で指摘することがなければ「{end_marker}」とだけ出力してください。"});
        prompt
    }

    fn rounds_for<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Round> + 'a {
        self.rounds.iter().filter(move |round| round.group == group)
    }
}

impl TaskBody for FeedbackBody {
    fn resume(&mut self, store: &dyn TaskStore) -> Result<(), StoreError> {
        self.rounds = match store.read_scratch(SCRATCH_ROUNDS)? {
            Some(saved) => serde_json::from_str(&saved)?,
            None => Vec::new(),
        };
        Ok(())
    }

    fn run(&mut self, task: &Task, ctx: &TaskContext<'_>) -> Result<Option<Value>, TaskError> {
        let payload: GroupPayload =
            serde_json::from_value(task.payload.clone()).context("task payload is not a row group")?;
        let group = payload.group;
        let csv = self.params.csv(&payload.rows);

        let already = self.rounds_for(&group).count();
        if already > 0 {
            tracing::info!(%group, rounds = already, "Continuing interrupted group");
        }

        for round in already..self.options.max_rounds {
            ctx.ensure_budget(self.options.inner_margin)?;

            let reply = self.generator.generate(ctx.caller(), &self.prompt(&group, &csv))?;
            let rows = table_rows(&reply).len();
            let finished = rows <= 1 || reply.contains(self.options.end_marker.as_str());

            self.rounds.push(Round {
                group: group.clone(),
                text: reply,
            });
            let saved = serde_json::to_string(&self.rounds).context("serializing feedback rounds")?;
            ctx.store().write_scratch(SCRATCH_ROUNDS, &saved)?;
            tracing::debug!(%group, round = round + 1, rows, "Feedback round done");

            if finished {
                break;
            }
        }

        let feedback: Vec<FeedbackRow> = self
            .rounds_for(&group)
            .flat_map(|round| table_rows(&round.text))
            .map(|cells| FeedbackRow {
                group: group.clone(),
                cells,
            })
            .collect();
        tracing::info!(%group, rows = feedback.len(), "Group feedback complete");
        Ok(Some(serde_json::to_value(feedback).context("serializing feedback rows")?))
    }
}

/// Every group's feedback rows, groups in sheet order.
struct FeedbackTable;

impl Aggregator for FeedbackTable {
    type Output = Vec<Value>;

    fn aggregate(&mut self, tasks: &[Task], _store: &dyn TaskStore) -> anyhow::Result<Vec<Value>> {
        Ok(concat_done_results(tasks))
    }
}
