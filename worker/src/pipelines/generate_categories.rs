//! Builds a category list by feeding the sheet to the model chunk by chunk.
//!
//! Each chunk's prompt carries the list produced so far, and the reply
//! replaces it. The list survives between invocations in scratch.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use indoc::formatdoc;
use lib_batch::{
    dedup_first_by, invoke, Aggregator, InvocationReport, OutputSink, RunContext, StoreError, Task,
    TaskBody, TaskContext, TaskError, TaskStatus, TaskStore, Trigger,
};
use lib_utils::json::parse_json_list;
use serde_json::Value;

use super::SetupParams;
use crate::input::{chunk_tasks, ChunkPayload, Sheet};
use crate::prompt::{render_base_prompt, TextGenerator};
use crate::worker_config::ChunkedConfig;

const SCRATCH_CATEGORIES: &str = "categories";

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
    let mut body = CategoryBody::new(params, generator);
    Ok(Some(invoke(ctx, &mut body, &mut CategoryList, sink, trigger)?))
}

fn category_key(item: &Value) -> (String, String) {
    let field = |name: &str| {
        item.get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string()
    };
    match (field("major_category"), field("minor_category")) {
        (major, minor) if major.is_empty() && minor.is_empty() => (item.to_string(), minor),
        key => key,
    }
}

fn last_done_list(tasks: &[Task]) -> Vec<Value> {
    tasks
        .iter()
        .rev()
        .filter(|t| t.status == TaskStatus::Done)
        .find_map(|t| t.result.as_ref()?.as_array().cloned())
        .unwrap_or_default()
}

fn build_prompt(base: &str, categories: &[Value], csv: &str) -> String {
    let mut prompt = base.to_string();
    if !categories.is_empty() {
        let previous = serde_json::to_string_pretty(categories).unwrap_or_default();
        prompt.push_str(&formatdoc! {"


            # 前回までの分類結果の概要
            以下はこれまでのデータから作成した分類リストです。分類の基準と粒度を引き継ぎ、必要に応じて分類を追加・統合してください。
            {previous}"});
    }
    prompt.push_str(&formatdoc! {"


        # 今回分類するデータ (CSV形式)
        ---
        {csv}
        ---

        更新後の分類リスト全体をJSON配列で出力してください。"});
    prompt
}

pub struct CategoryBody {
    params: SetupParams,
    generator: Arc<dyn TextGenerator>,
    categories: Vec<Value>,
}

impl CategoryBody {
    pub fn new(params: SetupParams, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            params,
            generator,
            categories: Vec::new(),
        }
    }
}

impl TaskBody for CategoryBody {
    fn resume(&mut self, store: &dyn TaskStore) -> Result<(), StoreError> {
        self.categories = match store.read_scratch(SCRATCH_CATEGORIES)? {
            Some(saved) => serde_json::from_str(&saved)?,
            None => last_done_list(&store.list_all()?),
        };
        tracing::debug!(categories = self.categories.len(), "Resumed category list");
        Ok(())
    }

    fn run(&mut self, task: &Task, ctx: &TaskContext<'_>) -> Result<Option<Value>, TaskError> {
        let chunk = ChunkPayload::from_task(&task.payload)?;
        let prompt = build_prompt(
            &self.params.base_prompt,
            &self.categories,
            &self.params.csv(&chunk.rows),
        );
        let reply = self.generator.generate(ctx.caller(), &prompt)?;
        let updated = parse_json_list(&reply).context("reply is not a JSON category list")?;
        if updated.is_empty() {
            return Err(anyhow::anyhow!("model returned an empty category list").into());
        }

        self.categories = updated.clone();
        let saved = serde_json::to_string(&self.categories).context("serializing categories")?;
        ctx.store().write_scratch(SCRATCH_CATEGORIES, &saved)?;
        tracing::info!(range = %chunk.range, categories = updated.len(), "Category list updated");
        Ok(Some(Value::Array(updated)))
    }
}

/// The latest list, with repeated (major, minor) pairs dropped.
pub struct CategoryList;

impl Aggregator for CategoryList {
    type Output = Vec<Value>;

    fn aggregate(&mut self, tasks: &[Task], store: &dyn TaskStore) -> anyhow::Result<Vec<Value>> {
        let latest = match store.read_scratch(SCRATCH_CATEGORIES)? {
            Some(saved) => serde_json::from_str(&saved).context("stored category list is corrupt")?,
            None => last_done_list(tasks),
        };
        Ok(dedup_first_by(latest, category_key))
    }
}
