//! Generated images per selected row, saved as `<serial>.png`, then
//! `<serial>_2.png` and on when several are asked for.
//!
//! A prompt with `<OK_Image>` or `<NG_Image>` placeholders is filled from the
//! row's case columns instead of receiving the row as CSV.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use indoc::formatdoc;
use lib_batch::{
    invoke, Aggregator, InvocationReport, NewTask, OutputSink, RunContext, Task, TaskBody, TaskContext,
    TaskError, TaskStatus, TaskStore, Trigger,
};
use lib_utils::ranges::parse_number_ranges;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::illustration_prompts::{NG_COLUMN, OK_COLUMN};
use super::SetupParams;
use crate::input::Sheet;
use crate::prompt::{render_base_prompt, ImageGenerator};
use crate::worker_config::RowImagesConfig;

const OK_PLACEHOLDER: &str = "<OK_Image>";
const NG_PLACEHOLDER: &str = "<NG_Image>";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RowPayload {
    serial: String,
    row: Vec<String>,
    /// OK and NG case texts, when the prompt has placeholders for them.
    cases: Option<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedImage {
    pub serial: String,
    pub paths: Vec<PathBuf>,
}

/// The first column holds each row's serial number; blank serials fall back
/// to the row's position.
fn serial_of(row: &[String], index: usize) -> String {
    match row.first().map(|cell| cell.trim()) {
        Some(serial) if !serial.is_empty() => serial.to_string(),
        _ => (index + 1).to_string(),
    }
}

fn file_name(serial: &str, generation: usize) -> String {
    match generation {
        0 => format!("{}.png", file_stem(serial)),
        n => format!("{}_{}.png", file_stem(serial), n + 1),
    }
}

fn file_stem(serial: &str) -> String {
    serial
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub fn setup(
    cfg: &RowImagesConfig,
    sheet: &Sheet,
    vars: &BTreeMap<String, String>,
    store: &dyn TaskStore,
) -> anyhow::Result<usize> {
    let base_prompt = render_base_prompt(&cfg.prompt, vars)?;
    let case_columns = if base_prompt.contains(OK_PLACEHOLDER) || base_prompt.contains(NG_PLACEHOLDER) {
        match (sheet.column_index(OK_COLUMN), sheet.column_index(NG_COLUMN)) {
            (Some(ok), Some(ng)) => Some((ok, ng)),
            _ => bail!("prompt uses case placeholders but the sheet lacks {OK_COLUMN} or {NG_COLUMN}"),
        }
    } else {
        None
    };

    let targets = parse_number_ranges(&cfg.targets);
    let tasks = sheet
        .rows
        .iter()
        .enumerate()
        .map(|(index, row)| (index, serial_of(row, index), row))
        .filter(|(_, serial, _)| {
            targets.is_empty() || serial.parse::<u32>().is_ok_and(|n| targets.binary_search(&n).is_ok())
        })
        .map(|(index, serial, row)| {
            let cell = |i: usize| row.get(i).cloned().unwrap_or_default();
            let payload = serde_json::to_value(RowPayload {
                serial,
                row: row.clone(),
                cases: case_columns.map(|(ok, ng)| (cell(ok), cell(ng))),
            })?;
            // Sheet row number: the header is row 1.
            Ok(NewTask::new(format!("Row_{}", index + 2), payload))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if tasks.is_empty() {
        bail!("no rows match targets {:?}", cfg.targets);
    }
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
    output_dir: &Path,
    generations: usize,
    generator: Arc<dyn ImageGenerator>,
    sink: &dyn OutputSink<Vec<SavedImage>>,
    trigger: &dyn Trigger,
) -> anyhow::Result<Option<InvocationReport>> {
    let Some(params) = SetupParams::load(ctx.store.as_ref())? else {
        return Ok(None);
    };
    let mut body = ImageBody {
        params,
        generator,
        output_dir: output_dir.to_path_buf(),
        generations: generations.max(1),
    };
    Ok(Some(invoke(ctx, &mut body, &mut ImageIndex, sink, trigger)?))
}

struct ImageBody {
    params: SetupParams,
    generator: Arc<dyn ImageGenerator>,
    output_dir: PathBuf,
    generations: usize,
}

impl ImageBody {
    fn prompt(&self, payload: &RowPayload) -> String {
        let base = &self.params.base_prompt;
        if let Some((ok, ng)) = &payload.cases {
            return base.replace(NG_PLACEHOLDER, ng).replace(OK_PLACEHOLDER, ok);
        }
        let csv = self.params.csv(std::slice::from_ref(&payload.row));
        formatdoc! {"
            {base}

            # 入力データ (CSV形式)
            ---
            {csv}
            ---"}
    }
}

impl TaskBody for ImageBody {
    fn run(&mut self, task: &Task, ctx: &TaskContext<'_>) -> Result<Option<Value>, TaskError> {
        let payload: RowPayload =
            serde_json::from_value(task.payload.clone()).context("task payload is not a row")?;
        let prompt = self.prompt(&payload);

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;
        let mut paths = Vec::with_capacity(self.generations);
        for generation in 0..self.generations {
            let encoded = self.generator.generate_png(ctx.caller(), &prompt)?;
            let png = STANDARD
                .decode(encoded.trim())
                .context("image payload is not valid base64")?;
            let path = self.output_dir.join(file_name(&payload.serial, generation));
            std::fs::write(&path, &png).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(serial = %payload.serial, path = %path.display(), bytes = png.len(), "Image saved");
            paths.push(path);
        }

        let saved = SavedImage {
            serial: payload.serial,
            paths,
        };
        Ok(Some(serde_json::to_value(saved).context("serializing image record")?))
    }
}

struct ImageIndex;

impl Aggregator for ImageIndex {
    type Output = Vec<SavedImage>;

    fn aggregate(&mut self, tasks: &[Task], _store: &dyn TaskStore) -> anyhow::Result<Vec<SavedImage>> {
        tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .filter_map(|t| t.result.clone())
            .map(|result| serde_json::from_value(result).context("stored image record is corrupt"))
            .collect()
    }
}
