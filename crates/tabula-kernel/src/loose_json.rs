//! Lenient decoding of tool outputs that arrive as text.
//!
//! Some clients hand back a grant as a string holding Python-flavoured
//! literals: single-quoted strings and `True`/`False`/`None`. Strict JSON is
//! tried first; the rewrite only runs when that fails.

use serde_json::Value;

/// Decode `text` as JSON, accepting Python-style literals as a fallback.
pub fn normalize(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    serde_json::from_str(&rewrite_python_literals(trimmed)).ok()
}

/// Decode a tool output: structured values pass through, strings are parsed
/// leniently. A string that does not parse is kept as-is.
pub fn normalize_output(value: &Value) -> Value {
    match value {
        Value::String(text) => normalize(text).unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

fn rewrite_python_literals(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                let quote = c;
                out.push('"');
                while let Some(inner) = chars.next() {
                    match inner {
                        '\\' => match chars.next() {
                            // \' is not a JSON escape
                            Some('\'') => out.push('\''),
                            Some(escaped) => {
                                out.push('\\');
                                out.push(escaped);
                            }
                            None => out.push('\\'),
                        },
                        q if q == quote => break,
                        '"' => out.push_str("\\\""),
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_json_passes_through() {
        assert_eq!(normalize(r#" {"a": [1, true]} "#), Some(json!({"a": [1, true]})));
    }

    #[test]
    fn test_python_literals() {
        let text = "{'approved': True, 'token': 't-1', 'reason': None, 'n': 2.5}";
        assert_eq!(
            normalize(text),
            Some(json!({"approved": true, "token": "t-1", "reason": null, "n": 2.5}))
        );
    }

    #[test]
    fn test_quotes_inside_strings() {
        assert_eq!(
            normalize(r#"{'say': 'he said "hi"', 'it': 'it\'s'}"#),
            Some(json!({"say": "he said \"hi\"", "it": "it's"}))
        );
        // Literal words inside strings are left alone.
        assert_eq!(normalize("['True', False]"), Some(json!(["True", false])));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert_eq!(normalize("approved: yes"), None);
        assert_eq!(normalize_output(&json!("not json")), json!("not json"));
        assert_eq!(normalize_output(&json!({"x": 1})), json!({"x": 1}));
    }
}
