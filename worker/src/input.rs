//! Tabular input and row chunking.

use std::path::Path;

use anyhow::{bail, Context};
use lib_batch::NewTask;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A header row plus data rows, every cell as text. Serializes to the same
/// shape [`Sheet::load`] reads, so one pipeline's output can feed another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sheet {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct RawSheet {
    header: Vec<Value>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl Sheet {
    pub fn new(header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { header, rows }
    }

    /// Load `{ "header": [...], "rows": [[...], ...] }`. Numbers and booleans
    /// become their JSON text; nulls become empty cells.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading input sheet {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing input sheet {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let raw: RawSheet = serde_json::from_str(text)?;
        if raw.header.is_empty() {
            bail!("sheet has no header row");
        }
        Ok(Self {
            header: raw.header.into_iter().map(cell_text).collect(),
            rows: raw
                .rows
                .into_iter()
                .map(|row| row.into_iter().map(cell_text).collect())
                .collect(),
        })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }
}

/// Payload of a task covering a contiguous block of rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// 1-based inclusive row range, for people reading the store.
    pub range: String,
    pub rows: Vec<Vec<String>>,
}

impl ChunkPayload {
    pub fn from_task(payload: &Value) -> anyhow::Result<Self> {
        serde_json::from_value(payload.clone()).context("task payload is not a row chunk")
    }
}

/// One task per `size` rows, keyed `Chunk_<first>_<last>` (0-based).
pub fn chunk_tasks(rows: &[Vec<String>], size: usize) -> anyhow::Result<Vec<NewTask>> {
    if size == 0 {
        bail!("chunk size must be at least 1");
    }
    rows.chunks(size)
        .enumerate()
        .map(|(i, chunk)| {
            let first = i * size;
            let last = first + chunk.len() - 1;
            let payload = ChunkPayload {
                range: format!("{}-{}", first + 1, last + 1),
                rows: chunk.to_vec(),
            };
            Ok(NewTask::new(format!("Chunk_{first}_{last}"), serde_json::to_value(payload)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> Vec<Vec<String>> {
        (1..=n).map(|i| vec![i.to_string(), format!("row {i}")]).collect()
    }

    #[test]
    fn test_23_rows_in_chunks_of_5() {
        let tasks = chunk_tasks(&rows(23), 5).unwrap();

        assert_eq!(tasks.len(), 5);
        assert_eq!(tasks[0].key, "Chunk_0_4");
        assert_eq!(tasks[4].key, "Chunk_20_22");
        let last = ChunkPayload::from_task(&tasks[4].payload).unwrap();
        assert_eq!(last.range, "21-23");
        assert_eq!(last.rows.len(), 3);
        let total: usize = tasks
            .iter()
            .map(|t| ChunkPayload::from_task(&t.payload).unwrap().rows.len())
            .sum();
        assert_eq!(total, 23);
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        assert!(chunk_tasks(&rows(3), 0).is_err());
    }

    #[test]
    fn test_parse_mixed_cells() {
        let sheet = Sheet::parse(r#"{"header":["No","件名"],"rows":[[1,"漏れ"],[2,null]]}"#).unwrap();
        assert_eq!(sheet.rows[0], vec!["1", "漏れ"]);
        assert_eq!(sheet.rows[1], vec!["2", ""]);
        assert_eq!(sheet.column_index("件名"), Some(1));
    }

    #[test]
    fn test_empty_header_is_rejected() {
        assert!(Sheet::parse(r#"{"header":[],"rows":[]}"#).is_err());
    }
}
