use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::StructuringError;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("fence pattern is valid")
});

/// Parse a model reply that should be a single JSON object.
///
/// Tolerates a Markdown code fence or stray prose around the object.
pub fn parse_json_object(reply: &str) -> Result<Value, StructuringError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(StructuringError::MalformedResponse("Empty reply".into()));
    }

    let candidate = if let Some(caps) = FENCED_JSON.captures(trimmed) {
        caps.get(1).map(|m| m.as_str()).unwrap_or(trimmed)
    } else if trimmed.starts_with('{') {
        trimmed
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if end > start => &trimmed[start..=end],
            _ => {
                return Err(StructuringError::MalformedResponse(
                    "No JSON object found".into(),
                ))
            }
        }
    };

    let value: Value = serde_json::from_str(candidate)
        .map_err(|e| StructuringError::JsonParsing(e.to_string()))?;

    if !value.is_object() {
        return Err(StructuringError::MalformedResponse(
            "Top-level JSON is not an object".into(),
        ));
    }
    Ok(value)
}
