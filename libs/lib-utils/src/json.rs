use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid regex"));

/// Pull the JSON payload out of a model reply.
///
/// Prefers a fenced ```json block; otherwise takes the span from the first
/// `{` or `[` to the last matching closer. Returns the trimmed reply when
/// neither is present.
pub fn extract_json_text(reply: &str) -> &str {
    if let Some(inner) = RE_FENCED_JSON.captures(reply).and_then(|c| c.get(1)) {
        return inner.as_str();
    }

    let start = match (reply.find('{'), reply.find('[')) {
        (Some(o), Some(a)) => Some(o.min(a)),
        (o, a) => o.or(a),
    };
    let Some(start) = start else {
        return reply.trim();
    };

    let closer = if reply[start..].starts_with('{') { '}' } else { ']' };
    match reply.rfind(closer) {
        Some(end) if end > start => &reply[start..=end],
        _ => &reply[start..],
    }
}

/// Parse a model reply into a list of JSON values. A single object becomes
/// a one-element list.
pub fn parse_json_list(reply: &str) -> Result<Vec<Value>, serde_json::Error> {
    let text = extract_json_text(reply);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fenced_block_wins() {
        let reply = "Here you go:\n```json\n[{\"a\": 1}]\n```\nthanks";
        assert_eq!(extract_json_text(reply), "[{\"a\": 1}]");
    }

    #[test]
    fn test_bare_object_in_prose() {
        let reply = "Result: {\"a\": {\"b\": 2}} end";
        assert_eq!(extract_json_text(reply), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn test_array_before_object() {
        let reply = "[{\"a\": 1}, {\"a\": 2}]";
        assert_eq!(parse_json_list(reply).unwrap().len(), 2);
    }

    #[test]
    fn test_single_object_is_wrapped() {
        let items = parse_json_list("{\"k\": \"v\"}").unwrap();
        assert_eq!(items, vec![json!({"k": "v"})]);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_json_list("no json here").is_err());
    }
}
