//! Chat-completion envelope unwrapping
//!
//! A successful body looks like `{"choices":[{"message":{"content":"<json>"}}]}`
//! where the content is itself a JSON document serialized as a string. Both
//! layers are parsed explicitly:
//!
//! 1. the outer body, failing fast on an `error` object
//! 2. the content string of the first choice
//!
//! Neither failure is ever papered over with an empty payload.

use crate::error::{excerpt, EnvelopeError};
use serde_json::Value;

/// Extract the first choice's message content from a raw body
pub fn message_content(raw: &str) -> Result<String, EnvelopeError> {
    let outer: Value = serde_json::from_str(raw).map_err(|e| EnvelopeError::OuterParse {
        reason: e.to_string(),
        raw: excerpt(raw),
    })?;

    if let Some(error) = outer.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string);
        return Err(EnvelopeError::Api {
            message,
            raw: excerpt(raw),
        });
    }

    outer
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EnvelopeError::MissingContent { raw: excerpt(raw) })
}

/// Unwrap both envelope layers and return the inner JSON payload
pub fn unwrap(raw: &str) -> Result<Value, EnvelopeError> {
    let content = message_content(raw)?;
    let body = strip_code_fence(&content);
    serde_json::from_str(body).map_err(|e| EnvelopeError::InnerParse {
        reason: e.to_string(),
        raw: excerpt(&content),
    })
}

/// Remove one surrounding markdown code fence, if present
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // drop the info string (e.g. `json`) on the opening line
    match inner.find('\n') {
        Some(nl) => inner[nl + 1..].trim(),
        None => inner.trim(),
    }
}
