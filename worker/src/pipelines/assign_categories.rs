//! Assigns every row to one of a fixed list of categories.

use std::collections::BTreeMap;
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
use crate::worker_config::AssignConfig;

const SCRATCH_CATEGORY_LIST: &str = "category_list";

pub fn setup(
    cfg: &AssignConfig,
    sheet: &Sheet,
    categories: &[Value],
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
    store.write_scratch(SCRATCH_CATEGORY_LIST, &serde_json::to_string_pretty(categories)?)?;
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
    let mut body = AssignBody {
        params,
        generator,
        categories: String::new(),
    };
    Ok(Some(invoke(ctx, &mut body, &mut Assignments, sink, trigger)?))
}

fn build_prompt(base: &str, categories: &str, csv: &str) -> String {
    formatdoc! {"
        {base}

        # 分類リスト
        {categories}

        # 分類するデータ (CSV形式)
        ---
        {csv}
        ---

        各行について、最も当てはまる分類を1つ選び、行ごとにJSONオブジェクトの配列で出力してください。"}
}

struct AssignBody {
    params: SetupParams,
    generator: Arc<dyn TextGenerator>,
    categories: String,
}

impl TaskBody for AssignBody {
    fn resume(&mut self, store: &dyn TaskStore) -> Result<(), StoreError> {
        self.categories = store
            .read_scratch(SCRATCH_CATEGORY_LIST)?
            .ok_or_else(|| StoreError::NotFound(SCRATCH_CATEGORY_LIST.to_string()))?;
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
        let assigned = parse_json_list(&reply).context("reply is not a JSON list of assignments")?;
        if assigned.len() != chunk.rows.len() {
            tracing::warn!(
                range = %chunk.range,
                rows = chunk.rows.len(),
                assigned = assigned.len(),
                "Assignment count does not match row count"
            );
        }
        Ok(Some(Value::Array(assigned)))
    }
}

/// Every chunk's assignments, in row order.
struct Assignments;

impl Aggregator for Assignments {
    type Output = Vec<Value>;

    fn aggregate(&mut self, tasks: &[Task], _store: &dyn TaskStore) -> anyhow::Result<Vec<Value>> {
        Ok(concat_done_results(tasks))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lib_batch::{BudgetConfig, Claim, Completion, MemorySink, NoopTrigger, StatusKind, TaskStatus};
    use serde_json::json;

    use super::*;
    use crate::testing::{test_context, ScriptedText};

    fn categories() -> Vec<Value> {
        vec![
            json!({"major_category":"運営","minor_category":"時間"}),
            json!({"major_category":"内容","minor_category":"難易度"}),
        ]
    }

    fn config() -> AssignConfig {
        AssignConfig {
            prompt: "次のデータを分類してください。".into(),
            chunk_size: 2,
            ..Default::default()
        }
    }

    fn sheet() -> Sheet {
        Sheet::new(
            vec!["No".into(), "意見".into()],
            vec![
                vec!["1".into(), "長い".into()],
                vec!["2".into(), "難しい".into()],
                vec!["3".into(), "遅い".into()],
            ],
        )
    }

    #[test]
    fn test_assignments_are_concatenated_in_row_order() {
        let (ctx, _) = test_context(BudgetConfig::default());
        let created = setup(&config(), &sheet(), &categories(), &Default::default(), ctx.store.as_ref()).unwrap();
        assert_eq!(created, 2);

        let generator = Arc::new(ScriptedText::new([
            r#"[{"No":"1","minor_category":"時間"},{"No":"2","minor_category":"難易度"}]"#,
            r#"{"No":"3","minor_category":"時間"}"#,
        ]));
        let sink = MemorySink::default();
        let report = process(&ctx, generator.clone(), &sink, &NoopTrigger).unwrap().unwrap();

        assert!(matches!(report.completion, Completion::Finished(_)));
        let prompt = &generator.prompts()[0];
        assert!(prompt.starts_with("次のデータを分類してください。"));
        assert!(prompt.contains("\"難易度\""));
        assert!(prompt.contains("\"2\",\"難しい\""));

        let emitted = sink.emitted();
        let numbers: Vec<&str> = emitted[0]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["No"].as_str().unwrap())
            .collect();
        assert_eq!(numbers, ["1", "2", "3"]);
    }

    #[test]
    fn test_full_run_over_twenty_three_rows() {
        let (ctx, _) = test_context(BudgetConfig::default());
        let rows: Vec<Vec<String>> = (1..=23).map(|i| vec![i.to_string(), format!("意見{i}")]).collect();
        let sheet = Sheet::new(vec!["No".into(), "意見".into()], rows);
        let cfg = AssignConfig {
            chunk_size: 5,
            ..config()
        };
        assert_eq!(setup(&cfg, &sheet, &categories(), &Default::default(), ctx.store.as_ref()).unwrap(), 5);

        let replies: Vec<String> = [(1, 5), (6, 10), (11, 15), (16, 20), (21, 23)]
            .into_iter()
            .map(|(first, last)| {
                let objects: Vec<Value> = (first..=last)
                    .map(|n| json!({"No": n.to_string(), "minor_category": "時間"}))
                    .collect();
                Value::Array(objects).to_string()
            })
            .collect();
        let sink = MemorySink::default();
        let report = process(&ctx, Arc::new(ScriptedText::new(replies)), &sink, &NoopTrigger)
            .unwrap()
            .unwrap();

        let Completion::Finished(counts) = report.completion else {
            panic!("job should be finished");
        };
        assert_eq!(counts.done, 5);
        assert_eq!(counts.pending + counts.in_progress + counts.failed, 0);
        let emitted = sink.emitted();
        let items = emitted[0].as_array().unwrap();
        assert_eq!(items.len(), 23);
        assert_eq!(items[22]["No"], "23");
    }

    #[test]
    fn test_failed_chunk_is_left_out() {
        let (ctx, _) = test_context(BudgetConfig::default());
        setup(&config(), &sheet(), &categories(), &Default::default(), ctx.store.as_ref()).unwrap();

        let generator = Arc::new(ScriptedText::new(["!quota exhausted", r#"[{"No":"3"}]"#]));
        let sink = MemorySink::default();
        let report = process(&ctx, generator, &sink, &NoopTrigger).unwrap().unwrap();

        assert_eq!(report.run.failed, 1);
        let Completion::Finished(counts) = report.completion else {
            panic!("job should be finished");
        };
        assert_eq!(counts.failed, 1);
        assert_eq!(sink.emitted(), vec![json!([{"No":"3"}])]);
    }

    #[test]
    fn test_failed_chunk_can_be_rearmed() {
        let (ctx, _) = test_context(BudgetConfig::default());
        setup(&config(), &sheet(), &categories(), &Default::default(), ctx.store.as_ref()).unwrap();
        let store = ctx.store.as_ref();
        store.claim("Chunk_0_1", &Claim::new("r", 0), Duration::ZERO).unwrap();
        store.set_status("Chunk_0_1", TaskStatus::failed("boom")).unwrap();

        assert_eq!(store.rearm_failed().unwrap(), 1);
        assert_eq!(store.get("Chunk_0_1").unwrap().status.kind(), StatusKind::Pending);
    }
}
