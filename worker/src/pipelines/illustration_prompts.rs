//! Asks, per feedback row, for a good and a bad example to illustrate.
//!
//! The output is a sheet: the input rows with `OK事例` and `NG事例` columns
//! appended, ready to drive image generation.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use lib_batch::{
    invoke, Aggregator, InvocationReport, NewTask, OutputSink, RunContext, Task, TaskBody, TaskContext,
    TaskError, TaskStatus, TaskStore, Trigger,
};
use lib_utils::markdown::table_rows;
use lib_utils::ranges::parse_column_ranges;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SetupParams;
use crate::input::Sheet;
use crate::prompt::{render_base_prompt, TextGenerator};
use crate::worker_config::IllustrationConfig;

pub const OK_COLUMN: &str = "OK事例";
pub const NG_COLUMN: &str = "NG事例";
const NOT_GENERATED: &str = "（生成失敗）";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RowPayload {
    row: Vec<String>,
    /// (column name, value) pairs shown to the model.
    fields: Vec<(String, String)>,
}

fn selected_columns(selection: &str, width: usize) -> anyhow::Result<Vec<usize>> {
    if selection.trim().is_empty() {
        return Ok((0..width).collect());
    }
    let columns = parse_column_ranges(selection);
    if columns.is_empty() {
        bail!("column selection {selection:?} names no columns");
    }
    if let Some(outside) = columns.iter().find(|c| **c >= width) {
        bail!("column {} is outside the sheet's {width} columns", outside + 1);
    }
    Ok(columns)
}

pub fn setup(
    cfg: &IllustrationConfig,
    sheet: &Sheet,
    vars: &BTreeMap<String, String>,
    store: &dyn TaskStore,
) -> anyhow::Result<usize> {
    if sheet.rows.is_empty() {
        bail!("input sheet has no data rows");
    }
    let columns = selected_columns(&cfg.columns, sheet.header.len())?;

    let tasks = sheet
        .rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let fields = columns
                .iter()
                .map(|&c| (sheet.header[c].clone(), row.get(c).cloned().unwrap_or_default()))
                .collect();
            let payload = serde_json::to_value(RowPayload {
                row: row.clone(),
                fields,
            })?;
            Ok(NewTask::new(format!("Row_{}", index + 2), payload))
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
    sink: &dyn OutputSink<Sheet>,
    trigger: &dyn Trigger,
) -> anyhow::Result<Option<InvocationReport>> {
    let Some(params) = SetupParams::load(ctx.store.as_ref())? else {
        return Ok(None);
    };
    let mut aggregator = CaseSheet {
        header: params.header.clone(),
    };
    let mut body = CaseBody { params, generator };
    Ok(Some(invoke(ctx, &mut body, &mut aggregator, sink, trigger)?))
}

struct CaseBody {
    params: SetupParams,
    generator: Arc<dyn TextGenerator>,
}

/// OK and NG cases from the first data row of a `| 項目 | OK | NG |` table.
fn cases_from_reply(reply: &str) -> (String, String) {
    let rows = table_rows(reply);
    let cell = |i: usize| {
        rows.get(1)
            .and_then(|row| row.get(i))
            .filter(|c| !c.is_empty())
            .cloned()
            .unwrap_or_else(|| NOT_GENERATED.to_string())
    };
    (cell(1), cell(2))
}

impl TaskBody for CaseBody {
    fn run(&mut self, task: &Task, ctx: &TaskContext<'_>) -> Result<Option<Value>, TaskError> {
        let payload: RowPayload =
            serde_json::from_value(task.payload.clone()).context("task payload is not a row")?;

        let mut prompt = self.params.base_prompt.clone();
        if !prompt.ends_with('\n') {
            prompt.push('\n');
        }
        for (name, value) in &payload.fields {
            prompt.push_str(&format!("- {name}: {value}\n"));
        }

        let reply = self.generator.generate(ctx.caller(), &prompt)?;
        let (ok, ng) = cases_from_reply(&reply);
        if ok == NOT_GENERATED || ng == NOT_GENERATED {
            tracing::warn!(key = %task.key, "Reply had no complete case row");
        }

        let mut row = payload.row;
        row.resize(self.params.header.len(), String::new());
        row.extend([ok, ng]);
        Ok(Some(Value::from(row)))
    }
}

struct CaseSheet {
    header: Vec<String>,
}

impl Aggregator for CaseSheet {
    type Output = Sheet;

    fn aggregate(&mut self, tasks: &[Task], _store: &dyn TaskStore) -> anyhow::Result<Sheet> {
        let mut header = self.header.clone();
        header.extend([OK_COLUMN.to_string(), NG_COLUMN.to_string()]);
        let rows = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .filter_map(|t| t.result.clone())
            .map(|result| serde_json::from_value(result).context("stored case row is corrupt"))
            .collect::<anyhow::Result<Vec<Vec<String>>>>()?;
        Ok(Sheet::new(header, rows))
    }
}

#[cfg(test)]
mod tests {
    use lib_batch::{BudgetConfig, Completion, MemorySink, NoopTrigger};
    use serde_json::json;

    use super::*;
    use crate::testing::{test_context, ScriptedText};

    fn sheet() -> Sheet {
        Sheet::new(
            vec!["番号".into(), "タイトル".into(), "概要".into()],
            vec![
                vec!["1".into(), "固定不足".into(), "クランプが外れる".into()],
                vec!["2".into(), "干渉".into(), "端子が当たる".into()],
            ],
        )
    }

    fn config(columns: &str) -> IllustrationConfig {
        IllustrationConfig {
            prompt: "イラストの題材を表で答えてください。".into(),
            columns: columns.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_column_selection() {
        assert_eq!(selected_columns("", 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(selected_columns("b-c", 3).unwrap(), vec![1, 2]);
        assert!(selected_columns("D", 3).is_err());
        assert!(selected_columns("??", 3).is_err());
    }

    #[test]
    fn test_cases_are_appended_as_columns() {
        let (ctx, _) = test_context(BudgetConfig::default());
        assert_eq!(setup(&config("B-C"), &sheet(), &Default::default(), ctx.store.as_ref()).unwrap(), 2);

        let generator = Arc::new(ScriptedText::new([
            "| 項目 | OK事例 | NG事例 |\n|---|---|---|\n| 固定 | 等間隔で固定 | 固定なしで垂れる |",
            "うまく表にできませんでした",
        ]));
        let sink = MemorySink::default();
        let report = process(&ctx, generator.clone(), &sink, &NoopTrigger).unwrap().unwrap();

        assert!(matches!(report.completion, Completion::Finished(_)));
        let prompt = &generator.prompts()[0];
        assert!(prompt.ends_with("- タイトル: 固定不足\n- 概要: クランプが外れる\n"));
        assert!(!prompt.contains("- 番号"));

        assert_eq!(
            sink.emitted(),
            vec![json!({
                "header": ["番号", "タイトル", "概要", "OK事例", "NG事例"],
                "rows": [
                    ["1", "固定不足", "クランプが外れる", "等間隔で固定", "固定なしで垂れる"],
                    ["2", "干渉", "端子が当たる", "（生成失敗）", "（生成失敗）"],
                ],
            })]
        );
    }

    #[test]
    fn test_output_loads_back_as_a_sheet() {
        let out = Sheet::new(vec!["番号".into(), OK_COLUMN.into()], vec![vec!["1".into(), "良".into()]]);
        let text = serde_json::to_string(&out).unwrap();
        assert_eq!(Sheet::parse(&text).unwrap(), out);
    }
}
