//! Rewrites selected feedback rows following a per-row instruction.
//!
//! Each revision looks up its feedback row and the source rows the feedback
//! was built from, so the model revises with the original evidence at hand.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use indoc::formatdoc;
use lib_batch::{
    invoke, Aggregator, InvocationReport, NewTask, OutputSink, RunContext, Task, TaskBody, TaskContext,
    TaskError, TaskStore, Trigger,
};
use lib_utils::json::extract_json_text;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{concat_done_results, SetupParams};
use crate::input::Sheet;
use crate::prompt::{render_base_prompt, TextGenerator};
use crate::worker_config::ReviseConfig;

/// A feedback row as the feedback sheet lays it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Feedback {
    title: String,
    summary: String,
    detail: String,
    base_serials: String,
}

impl Feedback {
    fn from_row(row: &[String]) -> Self {
        let cell = |i: usize| row.get(i).cloned().unwrap_or_default();
        Self {
            title: cell(1),
            summary: cell(2),
            detail: cell(3),
            base_serials: cell(4),
        }
    }

    fn serials(&self) -> impl Iterator<Item = &str> {
        self.base_serials
            .split(['\n', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevisionPayload {
    number: String,
    instruction: String,
    /// `None` when the feedback sheet has no row with this number.
    feedback: Option<Feedback>,
    sources: Vec<Vec<String>>,
}

/// The revised row under the feedback sheet's column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisedFeedback {
    #[serde(rename = "フィードバック番号")]
    pub number: String,
    #[serde(rename = "フィードバックタイトル")]
    pub title: String,
    #[serde(rename = "フィードバック概要")]
    pub summary: String,
    #[serde(rename = "フィードバック詳細")]
    pub detail: String,
    #[serde(rename = "ベース通し番号")]
    pub base_serials: String,
    #[serde(rename = "ベース概要（管理番号）")]
    pub base_summary: String,
}

fn first_cell(row: &[String]) -> String {
    row.first().map(|c| c.trim().to_string()).unwrap_or_default()
}

pub fn setup(
    cfg: &ReviseConfig,
    revisions: &Sheet,
    feedback: &Sheet,
    source: &Sheet,
    vars: &BTreeMap<String, String>,
    store: &dyn TaskStore,
) -> anyhow::Result<usize> {
    let feedback_by_number: HashMap<String, &Vec<String>> =
        feedback.rows.iter().map(|row| (first_cell(row), row)).collect();
    let source_by_serial: HashMap<String, &Vec<String>> =
        source.rows.iter().map(|row| (first_cell(row), row)).collect();

    let tasks = revisions
        .rows
        .iter()
        .filter_map(|row| {
            let number = first_cell(row);
            let instruction = row.get(1).map(|c| c.trim().to_string()).unwrap_or_default();
            (!number.is_empty() && !instruction.is_empty()).then_some((number, instruction))
        })
        .map(|(number, instruction)| {
            let feedback = feedback_by_number.get(&number).map(|row| Feedback::from_row(row));
            let sources = feedback
                .iter()
                .flat_map(Feedback::serials)
                .filter_map(|serial| source_by_serial.get(serial).map(|row| (*row).clone()))
                .collect();
            let payload = serde_json::to_value(RevisionPayload {
                number: number.clone(),
                instruction,
                feedback,
                sources,
            })?;
            Ok(NewTask::new(format!("Feedback_{number}"), payload))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if tasks.is_empty() {
        bail!("no revision rows with both a feedback number and an instruction");
    }
    let base_prompt = render_base_prompt(&cfg.prompt, vars)?;
    let created = store.create_all(tasks)?;
    SetupParams {
        base_prompt,
        header: source.header.clone(),
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
    let mut body = ReviseBody { params, generator };
    Ok(Some(invoke(ctx, &mut body, &mut RevisedRows, sink, trigger)?))
}

struct ReviseBody {
    params: SetupParams,
    generator: Arc<dyn TextGenerator>,
}

impl ReviseBody {
    fn prompt(&self, payload: &RevisionPayload, feedback: &Feedback) -> String {
        let rule = self.params.base_prompt.trim();
        let number = &payload.number;
        let instruction = &payload.instruction;
        let sources = payload
            .sources
            .iter()
            .map(|row| self.params.csv(std::slice::from_ref(row)))
            .collect::<Vec<_>>()
            .join("\n\n");
        formatdoc! {r#"
            # あなたの役割
            一度作成したフィードバックを、追加の指示に基づいてより高品質なものに改訂してください。

            # 元のフィードバック
            - フィードバック番号: {number}
            - フィードバックタイトル: {title}
            - フィードバック概要: {summary}
            - フィードバック詳細: {detail}

            # 修正指示
            「{instruction}」

            フィードバック生成ルールは以下に従うこと。
            「{rule}」

            # 参照情報
            このフィードバックの元となったデータは以下の通りです。
            {sources}

            # 出力形式
            改訂後のフィードバックを、以下のJSONオブジェクト形式で出力してください。キーの名前と順番は厳密に守ってください。
            {{
              "フィードバック番号": "{number}",
              "フィードバックタイトル": "（改訂後のタイトル）",
              "フィードバック概要": "（改訂後の概要）",
              "フィードバック詳細": "（改訂後の詳細）",
              "ベース通し番号": "{serials}",
              "ベース概要（管理番号）": "（改訂後のベース概要）"
            }}"#,
            title = feedback.title,
            summary = feedback.summary,
            detail = feedback.detail,
            serials = feedback.base_serials,
        }
    }
}

fn text_field(object: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl TaskBody for ReviseBody {
    fn run(&mut self, task: &Task, ctx: &TaskContext<'_>) -> Result<Option<Value>, TaskError> {
        let payload: RevisionPayload =
            serde_json::from_value(task.payload.clone()).context("task payload is not a revision")?;
        let Some(feedback) = &payload.feedback else {
            return Err(anyhow!("feedback number {} not found", payload.number).into());
        };

        let reply = self.generator.generate(ctx.caller(), &self.prompt(&payload, feedback))?;
        let parsed: Value =
            serde_json::from_str(extract_json_text(&reply)).context("reply is not a JSON object")?;
        let Value::Object(object) = parsed else {
            return Err(anyhow!("reply is not a JSON object").into());
        };

        let field = |key: &str| text_field(&object, key).unwrap_or_default();
        let revised = RevisedFeedback {
            number: text_field(&object, "フィードバック番号").unwrap_or_else(|| payload.number.clone()),
            title: field("フィードバックタイトル"),
            summary: field("フィードバック概要"),
            detail: field("フィードバック詳細"),
            base_serials: text_field(&object, "ベース通し番号").unwrap_or_else(|| feedback.base_serials.clone()),
            base_summary: field("ベース概要（管理番号）"),
        };
        tracing::info!(number = %revised.number, "Feedback revised");
        Ok(Some(serde_json::to_value(revised).context("serializing revised feedback")?))
    }
}

/// Revised rows in revision-list order.
struct RevisedRows;

impl Aggregator for RevisedRows {
    type Output = Vec<Value>;

    fn aggregate(&mut self, tasks: &[Task], _store: &dyn TaskStore) -> anyhow::Result<Vec<Value>> {
        Ok(concat_done_results(tasks))
    }
}

#[cfg(test)]
mod tests {
    use lib_batch::{BudgetConfig, Completion, MemorySink, NoopTrigger, StatusKind};
    use serde_json::json;

    use super::*;
    use crate::testing::{test_context, ScriptedText};

    fn strings(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn feedback() -> Sheet {
        Sheet::new(
            strings(&["番号", "タイトル", "概要", "詳細", "ベース通し番号"]),
            vec![
                strings(&["1", "固定不足", "クランプが外れる", "間隔を詰める", "101,103"]),
                strings(&["2", "干渉", "端子が当たる", "逃げを設ける", "102"]),
            ],
        )
    }

    fn source() -> Sheet {
        Sheet::new(
            strings(&["通し番号", "内容"]),
            vec![
                strings(&["101", "振動でクランプ脱落"]),
                strings(&["102", "端子干渉"]),
                strings(&["103", "クランプ破損"]),
            ],
        )
    }

    fn revisions(rows: &[[&str; 2]]) -> Sheet {
        Sheet::new(
            strings(&["番号", "指示"]),
            rows.iter().map(|r| strings(r)).collect(),
        )
    }

    fn config() -> ReviseConfig {
        ReviseConfig {
            prompt: "タイトルは簡潔に。".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_setup_skips_incomplete_rows_and_attaches_sources() {
        let (ctx, _) = test_context(BudgetConfig::default());
        let list = revisions(&[["1", "具体例を追加"], ["2", ""], ["", "無視"]]);
        let created = setup(&config(), &list, &feedback(), &source(), &Default::default(), ctx.store.as_ref()).unwrap();
        assert_eq!(created, 1);

        let task = ctx.store.get("Feedback_1").unwrap();
        assert_eq!(task.payload["instruction"], "具体例を追加");
        assert_eq!(task.payload["sources"], json!([["101", "振動でクランプ脱落"], ["103", "クランプ破損"]]));

        let empty = revisions(&[["", ""]]);
        assert!(setup(&config(), &empty, &feedback(), &source(), &Default::default(), ctx.store.as_ref()).is_err());
    }

    #[test]
    fn test_revision_fills_missing_keys_and_fails_unknown_numbers() {
        let (ctx, _) = test_context(BudgetConfig::default());
        let list = revisions(&[["2", "原因を明記"], ["9", "存在しない番号"]]);
        setup(&config(), &list, &feedback(), &source(), &Default::default(), ctx.store.as_ref()).unwrap();

        let generator = Arc::new(ScriptedText::new([r#"```json
{"フィードバックタイトル": "端子干渉", "フィードバック概要": "端子が筐体に当たる", "フィードバック詳細": "逃げ形状を追加", "ベース概要（管理番号）": "102"}
```"#]));
        let sink = MemorySink::default();
        let report = process(&ctx, generator.clone(), &sink, &NoopTrigger).unwrap().unwrap();

        let prompt = &generator.prompts()[0];
        assert!(prompt.contains("「原因を明記」"));
        assert!(prompt.contains("「タイトルは簡潔に。」"));
        assert!(prompt.contains("\"102\",\"端子干渉\""));

        let Completion::Finished(counts) = report.completion else {
            panic!("job should be finished");
        };
        assert_eq!((counts.done, counts.failed), (1, 1));
        let missing = ctx.store.get("Feedback_9").unwrap();
        assert_eq!(missing.status.kind(), StatusKind::Failed);
        assert!(missing.error_message().unwrap().contains("9"));

        assert_eq!(
            sink.emitted(),
            vec![json!([{
                "フィードバック番号": "2",
                "フィードバックタイトル": "端子干渉",
                "フィードバック概要": "端子が筐体に当たる",
                "フィードバック詳細": "逃げ形状を追加",
                "ベース通し番号": "102",
                "ベース概要（管理番号）": "102",
            }])]
        );
    }
}
