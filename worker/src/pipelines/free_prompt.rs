//! Runs an arbitrary prompt over the sheet chunk by chunk.
//!
//! The last few output objects are shown to the model with each chunk so
//! later chunks keep the format and tone of earlier ones.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Context};
use indoc::formatdoc;
use lib_batch::{
    invoke, Aggregator, InvocationReport, OutputSink, RunContext, StoreError, Task, TaskBody, TaskContext,
    TaskError, TaskStore, Trigger,
};
use lib_utils::json::parse_json_list;
use serde_json::Value;

use super::{concat_done_results, SetupParams};
use crate::input::{chunk_tasks, ChunkPayload, Sheet};
use crate::prompt::{render_base_prompt, TextGenerator};
use crate::worker_config::ChunkedConfig;

const STYLE_EXAMPLES: usize = 5;

pub fn setup(
    cfg: &ChunkedConfig,
    sheet: &Sheet,
    vars: &BTreeMap<String, String>,
    store: &dyn TaskStore,
) -> anyhow::Result<usize> {
    if sheet.rows.is_empty() {
        bail!("input sheet has no data rows");
    }
    let base_prompt = render_base_prompt(&cfg.prompt, vars)?;
    let created = store.create_all(chunk_tasks(&sheet.rows, cfg.chunk_size)?)?;
    SetupParams {
        base_prompt,
        header: sheet.header.clone(),
    }
    .save(store)?;
    Ok(created)
}

pub fn process(
    ctx: &RunContext,
    generator: Arc<dyn TextGenerator>,
    sink: &dyn OutputSink<Vec<Value>>,
    trigger: &dyn Trigger,
) -> anyhow::Result<Option<InvocationReport>> {
    let Some(params) = SetupParams::load(ctx.store.as_ref())? else {
        return Ok(None);
    };
    let mut body = FreePromptBody {
        params,
        generator,
        recent: VecDeque::with_capacity(STYLE_EXAMPLES),
    };
    Ok(Some(invoke(ctx, &mut body, &mut Outputs, sink, trigger)?))
}

struct FreePromptBody {
    params: SetupParams,
    generator: Arc<dyn TextGenerator>,
    recent: VecDeque<Value>,
}

impl FreePromptBody {
    fn remember(&mut self, items: impl IntoIterator<Item = Value>) {
        for item in items {
            if self.recent.len() == STYLE_EXAMPLES {
                self.recent.pop_front();
            }
            self.recent.push_back(item);
        }
    }

    fn prompt(&self, csv: &str) -> String {
        let mut prompt = self.params.base_prompt.clone();
        if !self.recent.is_empty() {
            let examples = serde_json::to_string_pretty(&self.recent).unwrap_or_default();
            prompt.push_str(&formatdoc! {"


                # 前回までの出力例
                形式と文体をそろえてください。
                {examples}"});
        }
        prompt.push_str(&formatdoc! {"


            # 入力データ (CSV形式)
            ---
            {csv}
            ---

            結果をJSON配列で出力してください。"});
        prompt
    }
}

impl TaskBody for FreePromptBody {
    fn resume(&mut self, store: &dyn TaskStore) -> Result<(), StoreError> {
        self.recent.clear();
        let previous = concat_done_results(&store.list_all()?);
        self.remember(previous);
        Ok(())
    }

    fn run(&mut self, task: &Task, ctx: &TaskContext<'_>) -> Result<Option<Value>, TaskError> {
        let chunk = ChunkPayload::from_task(&task.payload)?;
        let prompt = self.prompt(&self.params.csv(&chunk.rows));
        let reply = self.generator.generate(ctx.caller(), &prompt)?;
        let items = parse_json_list(&reply).context("reply is not JSON")?;
        self.remember(items.iter().cloned());
        Ok(Some(Value::Array(items)))
    }
}

struct Outputs;

impl Aggregator for Outputs {
    type Output = Vec<Value>;

    fn aggregate(&mut self, tasks: &[Task], _store: &dyn TaskStore) -> anyhow::Result<Vec<Value>> {
        Ok(concat_done_results(tasks))
    }
}
