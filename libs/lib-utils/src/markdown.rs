/// Split a markdown table into rows of trimmed cells.
///
/// Lines without a `|` and separator lines (`|---|:--:|`) are skipped; `<br>`
/// in a cell becomes a newline.
pub fn table_rows(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .filter(|line| line.contains('|') && !is_separator(line))
        .filter_map(|line| {
            let cells: Vec<&str> = line.split('|').collect();
            if cells.len() < 3 {
                return None;
            }
            Some(
                cells[1..cells.len() - 1]
                    .iter()
                    .map(|c| c.trim().replace("<br>", "\n"))
                    .collect(),
            )
        })
        .collect()
}

/// Every non-empty cell is made of dashes and colons only.
fn is_separator(line: &str) -> bool {
    let mut cells = line
        .split('|')
        .map(str::trim)
        .filter(|cell| !cell.is_empty())
        .peekable();
    cells.peek().is_some()
        && cells.all(|cell| cell.contains('-') && cell.chars().all(|c| c == '-' || c == ':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_rows() {
        let text = "intro\n| a | b |\n|---|---|\n| 1 | x<br>y |\n";
        let rows = table_rows(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["a", "b"]);
        assert_eq!(rows[1], vec!["1", "x\ny"]);
    }

    #[test]
    fn test_dashes_inside_cells_are_kept() {
        let text = "| 事例 | 説明 |\n| :--- | ---: |\n| OK | 手順A --- 手順B |\n| NG | --- |\n";
        let rows = table_rows(text);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["OK", "手順A --- 手順B"]);
        assert_eq!(rows[2], vec!["NG", "---"]);
    }

    #[test]
    fn test_no_table() {
        assert!(table_rows("nothing to see").is_empty());
    }
}
