//! Minimal CSV rendering for prompt payloads.
//!
//! Every cell is quoted and embedded quotes are doubled, which is all the
//! models need to read a chunk back unambiguously.

pub fn quote_cell(cell: &str) -> String {
    format!("\"{}\"", cell.replace('"', "\"\""))
}

pub fn render_row<S: AsRef<str>>(row: &[S]) -> String {
    row.iter()
        .map(|c| quote_cell(c.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Render a header row followed by data rows, one line each.
pub fn render_table<H: AsRef<str>, S: AsRef<str>>(header: &[H], rows: &[Vec<S>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(render_row(header));
    lines.extend(rows.iter().map(|r| render_row(r.as_slice())));
    lines.join("\n")
}
