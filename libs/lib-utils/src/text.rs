/// Truncate `s` to at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Single-line preview of a response body for log output.
pub fn preview(s: &str, max_chars: usize) -> String {
    let flat = s.replace(['\n', '\r'], " ");
    let cut = truncate_chars(&flat, max_chars);
    if cut.len() < flat.len() {
        format!("{cut}...")
    } else {
        cut.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_truncate_multibyte() {
        // Each of these is three bytes in UTF-8
        let s = "処理中です";
        assert_eq!(truncate_chars(s, 3), "処理中");
        assert_eq!(truncate_chars(s, 3).chars().count(), 3);
    }

    #[test]
    fn test_preview_flattens_newlines() {
        assert_eq!(preview("a\nb\nc", 10), "a b c");
        assert_eq!(preview("abcdef", 3), "abc...");
    }
}
