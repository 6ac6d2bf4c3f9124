//! Envelope codec: newline-delimited JSON-RPC frames.
//!
//! Outgoing frames are serialized as one JSON object followed by `\n`.
//! Incoming lines are sanitized before strict parsing: servers written in
//! dynamic languages happily emit bare `Infinity`, `-Infinity` and `NaN`
//! tokens, which are not JSON, and number literals such as `1e999` that
//! overflow `f64`. Both are rewritten into the sentinel strings below, so no
//! decoded value ever carries a non-finite float.
//!
//! `serde_json::Value` cannot represent a non-finite number at all, which is
//! why sanitization happens on text (incoming) and on `f64` (outgoing) rather
//! than on `Value` trees.

use std::borrow::Cow;

use serde::Serialize;

use super::errors::ToolClientError;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcResponseOut, RequestId};

// ─── Sentinels ───────────────────────────────────────────────────────────────

/// Replacement for positive infinity.
pub const POS_INFINITY: &str = "infinity";
/// Replacement for negative infinity.
pub const NEG_INFINITY: &str = "-infinity";
/// Replacement for NaN.
pub const NOT_A_NUMBER: &str = "NaN";

/// Bare tokens recognized outside string literals, longest first so that
/// `-Infinity` wins over `Infinity`.
const SPECIAL_TOKENS: [(&str, &str); 3] = [
    ("-Infinity", NEG_INFINITY),
    ("Infinity", POS_INFINITY),
    ("NaN", NOT_A_NUMBER),
];

/// Convert an `f64` into a JSON value, replacing non-finite values with the
/// sentinel strings.
pub fn float_value(v: f64) -> serde_json::Value {
    if v.is_nan() {
        serde_json::Value::String(NOT_A_NUMBER.into())
    } else if v.is_infinite() {
        let sentinel = if v > 0.0 { POS_INFINITY } else { NEG_INFINITY };
        serde_json::Value::String(sentinel.into())
    } else {
        // Finite, so `from_f64` cannot fail.
        serde_json::Number::from_f64(v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Whether a string value is one of the non-finite sentinels.
pub fn is_sentinel(s: &str) -> bool {
    s == POS_INFINITY || s == NEG_INFINITY || s == NOT_A_NUMBER
}

/// Rewrite bare non-finite tokens and overflowing number literals in JSON
/// text into quoted sentinels.
///
/// String literals are left untouched, so running this twice is the same as
/// running it once. Returns the input unchanged (borrowed) when there is
/// nothing to rewrite.
pub fn sanitize_json_text(raw: &str) -> Cow<'_, str> {
    let bytes = raw.as_bytes();
    let mut out: Option<String> = None;
    let mut copied = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if b == b'"' {
            in_string = true;
            i += 1;
            continue;
        }

        if let Some((token, sentinel)) = match_special(&bytes[i..]) {
            let end = i + token.len();
            let starts_word = i == 0 || !is_word_byte(bytes[i - 1]);
            let ends_word = end >= bytes.len() || !is_word_byte(bytes[end]);
            if starts_word && ends_word {
                let buf = out.get_or_insert_with(|| String::with_capacity(raw.len() + 16));
                buf.push_str(&raw[copied..i]);
                buf.push('"');
                buf.push_str(sentinel);
                buf.push('"');
                copied = end;
                i = end;
                continue;
            }
        }

        if (b == b'-' || b.is_ascii_digit()) && (i == 0 || !is_word_byte(bytes[i - 1])) {
            let end = i + number_len(&bytes[i..]);
            if end > i {
                if let Some(sentinel) = overflow_sentinel(&raw[i..end]) {
                    let buf = out.get_or_insert_with(|| String::with_capacity(raw.len() + 16));
                    buf.push_str(&raw[copied..i]);
                    buf.push('"');
                    buf.push_str(sentinel);
                    buf.push('"');
                    copied = end;
                }
                i = end;
                continue;
            }
        }

        i += 1;
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&raw[copied..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(raw),
    }
}

fn match_special(rest: &[u8]) -> Option<(&'static str, &'static str)> {
    SPECIAL_TOKENS
        .iter()
        .copied()
        .find(|(token, _)| rest.starts_with(token.as_bytes()))
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

/// Length of the JSON number literal at the start of `rest`, or 0.
fn number_len(rest: &[u8]) -> usize {
    let digits = |from: usize| {
        rest.get(from..)
            .map_or(0, |tail| tail.iter().take_while(|b| b.is_ascii_digit()).count())
    };

    let mut n = usize::from(rest.first() == Some(&b'-'));
    let int = digits(n);
    if int == 0 {
        return 0;
    }
    n += int;

    if rest.get(n) == Some(&b'.') {
        let frac = digits(n + 1);
        if frac > 0 {
            n += 1 + frac;
        }
    }
    if matches!(rest.get(n), Some(b'e' | b'E')) {
        let mut m = n + 1;
        if matches!(rest.get(m), Some(b'+' | b'-')) {
            m += 1;
        }
        let exp = digits(m);
        if exp > 0 {
            n = m + exp;
        }
    }
    n
}

/// Sentinel for a literal too large for `f64`, keeping its sign.
fn overflow_sentinel(literal: &str) -> Option<&'static str> {
    // Anything shorter without an exponent fits comfortably.
    if literal.len() < 300 && !literal.contains(['e', 'E']) {
        return None;
    }
    let v: f64 = literal.parse().ok()?;
    match v.is_infinite() {
        true if v > 0.0 => Some(POS_INFINITY),
        true => Some(NEG_INFINITY),
        false => None,
    }
}

/// Parse JSON text after sanitizing non-finite tokens.
pub fn parse_lenient(raw: &str) -> Result<serde_json::Value, ToolClientError> {
    serde_json::from_str(&sanitize_json_text(raw)).map_err(|e| ToolClientError::Protocol {
        reason: format!("invalid JSON: {e}"),
    })
}

// ─── Encoding ────────────────────────────────────────────────────────────────

fn encode_line<T: Serialize>(frame: &T, what: &str) -> Result<Vec<u8>, ToolClientError> {
    let mut bytes = serde_json::to_vec(frame).map_err(|e| ToolClientError::Protocol {
        reason: format!("failed to serialize {what}: {e}"),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Serialize a request as a single newline-terminated line.
pub fn encode_request(request: &JsonRpcRequest) -> Result<Vec<u8>, ToolClientError> {
    encode_line(request, "request")
}

/// Serialize a notification as a single newline-terminated line.
pub fn encode_notification(notification: &JsonRpcNotification) -> Result<Vec<u8>, ToolClientError> {
    encode_line(notification, "notification")
}

/// Serialize an outgoing response as a single newline-terminated line.
pub fn encode_response(response: &JsonRpcResponseOut) -> Result<Vec<u8>, ToolClientError> {
    encode_line(response, "response")
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// A decoded incoming frame.
#[derive(Debug, PartialEq)]
pub enum Frame {
    /// A response to one of our requests.
    Response(JsonRpcResponse),
    /// A request initiated by the server (has both `id` and `method`).
    Request {
        id: RequestId,
        method: String,
    },
    /// A server notification (has `method`, no `id`).
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

/// Decode one line into a [`Frame`].
///
/// Fails with `Protocol` when the line is not a JSON object or when a
/// response-shaped object cannot be decoded.
pub fn decode_frame(line: &[u8]) -> Result<Frame, ToolClientError> {
    let text = std::str::from_utf8(line).map_err(|e| ToolClientError::Protocol {
        reason: format!("frame is not UTF-8: {e}"),
    })?;
    let value = parse_lenient(text.trim())?;

    let Some(obj) = value.as_object() else {
        return Err(ToolClientError::Protocol {
            reason: "frame is not a JSON object".into(),
        });
    };

    let method = obj.get("method").and_then(|m| m.as_str()).map(str::to_string);
    let id = obj
        .get("id")
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok());

    match (id, method) {
        (Some(id), Some(method)) => Ok(Frame::Request { id, method }),
        (None, Some(method)) => Ok(Frame::Notification {
            method,
            params: obj.get("params").cloned(),
        }),
        (_, None) => {
            let response: JsonRpcResponse =
                serde_json::from_value(value).map_err(|e| ToolClientError::Protocol {
                    reason: format!("malformed response: {e}"),
                })?;
            Ok(Frame::Response(response))
        }
    }
}

/// Best-effort id extraction from a line that failed to decode as a frame.
///
/// Falls back to scanning for a top-level `"id"` key when the line is not
/// even valid JSON, e.g. a truncated response.
pub fn frame_id(line: &[u8]) -> Option<RequestId> {
    let text = std::str::from_utf8(line).ok()?.trim();
    match parse_lenient(text) {
        Ok(value) => serde_json::from_value(value.get("id")?.clone()).ok(),
        Err(_) => scan_top_level_id(text),
    }
}

fn scan_top_level_id(text: &str) -> Option<RequestId> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            b'"' => {
                let close = string_end(bytes, i)?;
                if depth == 1 && &bytes[i + 1..close] == b"id" {
                    if let Some(value) = text[close + 1..].trim_start().strip_prefix(':') {
                        return id_literal(value.trim_start());
                    }
                }
                i = close;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index of the quote closing the string literal opened at `open`.
fn string_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut escaped = false;
    for (j, &b) in bytes.iter().enumerate().skip(open + 1) {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            return Some(j);
        }
    }
    None
}

fn id_literal(value: &str) -> Option<RequestId> {
    if let Some(rest) = value.strip_prefix('"') {
        let end = rest.find('"')?;
        return Some(RequestId::Text(rest[..end].to_string()));
    }
    let len = value.bytes().take_while(u8::is_ascii_digit).count();
    value[..len].parse().ok().map(RequestId::Number)
}

/// Decode one line that must be a response.
pub fn decode_response(line: &[u8]) -> Result<JsonRpcResponse, ToolClientError> {
    match decode_frame(line)? {
        Frame::Response(response) => Ok(response),
        other => Err(ToolClientError::Protocol {
            reason: format!("expected a response frame, got {other:?}"),
        }),
    }
}

/// Enforce that exactly one of `result` / `error` is present and split the
/// response accordingly. Server errors become [`ToolClientError::Tool`].
pub fn into_result(response: JsonRpcResponse) -> Result<serde_json::Value, ToolClientError> {
    match (response.result, response.error) {
        (Some(_), Some(_)) => Err(ToolClientError::Protocol {
            reason: "response carries both result and error".into(),
        }),
        (None, Some(err)) => Err(ToolClientError::Tool {
            code: err.code,
            message: err.message,
            data: err.data,
        }),
        (Some(result), None) => Ok(result),
        (None, None) => Err(ToolClientError::Protocol {
            reason: "response missing both result and error".into(),
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
