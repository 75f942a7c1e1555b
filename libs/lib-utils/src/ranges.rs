use std::collections::BTreeSet;

/// Parse a selection such as `"1, 3, 5-9"` into sorted, unique numbers.
///
/// Malformed parts and reversed ranges are ignored.
pub fn parse_number_ranges(selection: &str) -> Vec<u32> {
    let mut numbers = BTreeSet::new();
    for part in selection.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
                    if start <= end {
                        numbers.extend(start..=end);
                    }
                }
            }
            None => {
                if let Ok(n) = part.parse::<u32>() {
                    numbers.insert(n);
                }
            }
        }
    }
    numbers.into_iter().collect()
}

/// Zero-based index of a spreadsheet column name (`A` is 0, `AA` is 26).
pub fn column_index(letters: &str) -> Option<usize> {
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    letters
        .to_ascii_uppercase()
        .bytes()
        .try_fold(0usize, |acc, b| acc.checked_mul(26)?.checked_add((b - b'A') as usize + 1))
        .map(|n| n - 1)
}

/// Parse a column selection such as `"A-C, E"` into sorted, unique
/// zero-based indices. Malformed parts and reversed ranges are ignored.
pub fn parse_column_ranges(selection: &str) -> Vec<usize> {
    let mut indices = BTreeSet::new();
    for part in selection.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Some(start), Some(end)) = (column_index(start.trim()), column_index(end.trim())) {
                    if start <= end {
                        indices.extend(start..=end);
                    }
                }
            }
            None => {
                if let Some(index) = column_index(part) {
                    indices.insert(index);
                }
            }
        }
    }
    indices.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_ranges() {
        assert_eq!(parse_number_ranges("1, 3, 5-9"), vec![1, 3, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_duplicates_and_junk() {
        assert_eq!(parse_number_ranges("2,2, x, 4-3, 1"), vec![1, 2]);
        assert!(parse_number_ranges("").is_empty());
    }

    #[test]
    fn test_column_letters() {
        assert_eq!(column_index("A"), Some(0));
        assert_eq!(column_index("z"), Some(25));
        assert_eq!(column_index("AA"), Some(26));
        assert_eq!(column_index("A1"), None);
        assert_eq!(parse_column_ranges("b-d, a, D, Q-P, ?"), vec![0, 1, 2, 3]);
    }
}
