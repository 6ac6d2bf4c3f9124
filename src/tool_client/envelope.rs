//! Content-envelope unwrapping for `tools/call` results.
//!
//! Many tool servers wrap their real payload as JSON text inside a generic
//! content list:
//!
//! ```json
//! {"content": [{"type": "text", "text": "{\"results\": [...]}"}]}
//! ```
//!
//! [`unwrap_content`] turns that back into the payload itself.

use serde_json::{json, Value};

use super::codec;

/// Normalize a raw `tools/call` result.
///
/// - First content item with JSON `text`: the parsed (sanitized) text.
/// - First content item with non-JSON `text`: `{"text": <raw>}`.
/// - `"isError": true` with text: `{"error": <text>}`.
/// - Anything else: the result unchanged.
pub fn unwrap_content(result: Value) -> Value {
    let Some(text) = first_text(&result) else {
        return result;
    };

    if is_error_flagged(&result) {
        return json!({ "error": text });
    }

    match codec::parse_lenient(text) {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::debug!(len = text.len(), "content text is not JSON; wrapping as text");
            json!({ "text": text })
        }
    }
}

fn first_text(result: &Value) -> Option<&str> {
    result
        .get("content")?
        .as_array()?
        .first()?
        .get("text")?
        .as_str()
}

fn is_error_flagged(result: &Value) -> bool {
    result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
