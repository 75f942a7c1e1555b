//! One knowledge summary per group of rows sharing the same values in a set
//! of columns.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use indexmap::IndexMap;
use indoc::formatdoc;
use lib_batch::{
    invoke, Aggregator, InvocationReport, NewTask, OutputSink, RunContext, Task, TaskBody, TaskContext,
    TaskError, TaskStore, Trigger,
};
use lib_utils::json::parse_json_list;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{concat_done_results, SetupParams};
use crate::input::Sheet;
use crate::prompt::{render_base_prompt, TextGenerator};
use crate::worker_config::KnowledgeConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupPayload {
    /// The group's column values.
    values: Vec<String>,
    rows: Vec<Vec<String>>,
}

pub fn setup(
    cfg: &KnowledgeConfig,
    sheet: &Sheet,
    vars: &BTreeMap<String, String>,
    store: &dyn TaskStore,
) -> anyhow::Result<usize> {
    if cfg.group_columns.is_empty() {
        bail!("no group columns configured");
    }
    if sheet.rows.is_empty() {
        bail!("input sheet has no data rows");
    }
    let columns = cfg
        .group_columns
        .iter()
        .map(|name| {
            sheet
                .column_index(name)
                .ok_or_else(|| anyhow!("group column {name:?} not found in sheet header"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut groups: IndexMap<Vec<String>, Vec<Vec<String>>> = IndexMap::new();
    for row in &sheet.rows {
        let values = columns
            .iter()
            .map(|&c| row.get(c).cloned().unwrap_or_default())
            .collect();
        groups.entry(values).or_default().push(row.clone());
    }

    let tasks = groups
        .into_iter()
        .enumerate()
        .map(|(i, (values, rows))| {
            let payload = serde_json::to_value(GroupPayload { values, rows })?;
            Ok(NewTask::new(format!("Group_{}", i + 1), payload))
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
    generator: Arc<dyn TextGenerator>,
    sink: &dyn OutputSink<Vec<Value>>,
    trigger: &dyn Trigger,
) -> anyhow::Result<Option<InvocationReport>> {
    let Some(params) = SetupParams::load(ctx.store.as_ref())? else {
        return Ok(None);
    };
    let mut body = KnowledgeBody { params, generator };
    Ok(Some(invoke(ctx, &mut body, &mut KnowledgeList, sink, trigger)?))
}

struct KnowledgeBody {
    params: SetupParams,
    generator: Arc<dyn TextGenerator>,
}

impl TaskBody for KnowledgeBody {
    fn run(&mut self, task: &Task, ctx: &TaskContext<'_>) -> Result<Option<Value>, TaskError> {
        let payload: GroupPayload =
            serde_json::from_value(task.payload.clone()).context("task payload is not a row group")?;
        let base = &self.params.base_prompt;
        let label = payload.values.join(", ");
        let csv = self.params.csv(&payload.rows);
        let prompt = formatdoc! {"
            {base}

            # 今回分析するデータセット (CSV形式)
            以下のデータは「{label}」の値がすべて同じグループです。
            ---
            {csv}"};

        let reply = self.generator.generate(ctx.caller(), &prompt)?;
        let items = parse_json_list(&reply).context("reply is not JSON")?;
        if items.is_empty() {
            return Err(anyhow!("reply held no knowledge entries").into());
        }
        tracing::info!(group = %label, entries = items.len(), "Group summarized");
        Ok(Some(Value::Array(items)))
    }
}

/// Every group's entries, groups in first-seen order.
struct KnowledgeList;

impl Aggregator for KnowledgeList {
    type Output = Vec<Value>;

    fn aggregate(&mut self, tasks: &[Task], _store: &dyn TaskStore) -> anyhow::Result<Vec<Value>> {
        Ok(concat_done_results(tasks))
    }
}

#[cfg(test)]
mod tests {
    use lib_batch::{BudgetConfig, Completion, MemorySink, NoopTrigger};
    use serde_json::json;

    use super::*;
    use crate::testing::{test_context, ScriptedText};

    fn sheet() -> Sheet {
        let row = |a: &str, b: &str, c: &str| vec![a.to_string(), b.to_string(), c.to_string()];
        Sheet::new(
            vec!["大分類".into(), "中分類".into(), "内容".into()],
            vec![
                row("配線", "固定", "クランプ外れ"),
                row("配線", "干渉", "端子接触"),
                row("配線", "固定", "バンド切れ"),
            ],
        )
    }

    fn config(columns: &[&str]) -> KnowledgeConfig {
        KnowledgeConfig {
            prompt: "共通する原因と対策をまとめてください。".into(),
            group_columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_groups_follow_all_columns_in_first_seen_order() {
        let (ctx, _) = test_context(BudgetConfig::default());
        let created = setup(&config(&["大分類", "中分類"]), &sheet(), &Default::default(), ctx.store.as_ref()).unwrap();
        assert_eq!(created, 2);

        let first = ctx.store.get("Group_1").unwrap();
        assert_eq!(first.payload["values"], json!(["配線", "固定"]));
        assert_eq!(first.payload["rows"].as_array().unwrap().len(), 2);

        assert!(setup(&config(&["部位"]), &sheet(), &Default::default(), ctx.store.as_ref()).is_err());
        assert!(setup(&config(&[]), &sheet(), &Default::default(), ctx.store.as_ref()).is_err());
    }

    #[test]
    fn test_entries_are_collected_and_empty_replies_fail() {
        let (ctx, _) = test_context(BudgetConfig::default());
        setup(&config(&["大分類", "中分類"]), &sheet(), &Default::default(), ctx.store.as_ref()).unwrap();

        let generator = Arc::new(ScriptedText::new([
            "```json\n{\"title\": \"固定点の見直し\"}\n```",
            "",
        ]));
        let sink = MemorySink::default();
        let report = process(&ctx, generator.clone(), &sink, &NoopTrigger).unwrap().unwrap();

        assert!(generator.prompts()[0].contains("「配線, 固定」"));
        assert!(generator.prompts()[0].contains("\"配線\",\"固定\",\"バンド切れ\""));
        let Completion::Finished(counts) = report.completion else {
            panic!("job should be finished");
        };
        assert_eq!((counts.done, counts.failed), (1, 1));
        assert_eq!(sink.emitted(), vec![json!([{"title": "固定点の見直し"}])]);
    }
}
