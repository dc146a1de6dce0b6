//! Payload redaction and size validation for intake

use serde_json::Value;

use crate::error::{EngineError, EngineResult};

/// Placeholder written over redacted values
pub const REDACTION_TOKEN: &str = "[REDACTED]";

/// Maximum serialized context size
pub const MAX_CONTEXT_BYTES: usize = 64 * 1024;
/// Maximum total submission size
pub const MAX_SUBMISSION_BYTES: usize = 1024 * 1024;
/// Maximum top-level context keys
pub const MAX_TOP_LEVEL_KEYS: usize = 100;
/// Maximum length of any string value
pub const MAX_STRING_CHARS: usize = 10_000;

/// Replace the values at the given dot-paths with the redaction token.
///
/// Paths address nested objects only ("credentials.password"); a path whose
/// prefix is missing is ignored. Arrays are not traversed.
pub fn redact_paths(value: &mut Value, paths: &[String]) {
    for path in paths {
        redact_path(value, path);
    }
}

fn redact_path(value: &mut Value, path: &str) {
    let mut segments = path.split('.').peekable();
    let mut current = value;
    while let Some(segment) = segments.next() {
        let Some(object) = current.as_object_mut() else {
            return;
        };
        if segments.peek().is_none() {
            if let Some(slot) = object.get_mut(segment) {
                *slot = Value::String(REDACTION_TOKEN.to_string());
            }
            return;
        }
        match object.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
}

/// Serialized size of a JSON value in bytes
pub fn json_size(value: &Value) -> usize {
    value.to_string().len()
}

/// Validate the structural bounds on a submission's context and metadata
pub fn validate_bounds(context: &Value, metadata: &Value, goal: &str) -> EngineResult<()> {
    let context_bytes = json_size(context);
    if context_bytes > MAX_CONTEXT_BYTES {
        return Err(EngineError::Validation(format!(
            "context exceeds {} bytes ({})",
            MAX_CONTEXT_BYTES, context_bytes
        )));
    }

    let total = context_bytes + json_size(metadata) + goal.len();
    if total > MAX_SUBMISSION_BYTES {
        return Err(EngineError::Validation(format!(
            "submission exceeds {} bytes ({})",
            MAX_SUBMISSION_BYTES, total
        )));
    }

    if let Some(object) = context.as_object() {
        if object.len() > MAX_TOP_LEVEL_KEYS {
            return Err(EngineError::Validation(format!(
                "context has more than {} top-level keys",
                MAX_TOP_LEVEL_KEYS
            )));
        }
    }

    check_string_lengths(context)?;
    check_string_lengths(metadata)?;
    if goal.chars().count() > MAX_STRING_CHARS {
        return Err(EngineError::Validation(format!(
            "goal exceeds {} characters",
            MAX_STRING_CHARS
        )));
    }
    Ok(())
}

fn check_string_lengths(value: &Value) -> EngineResult<()> {
    match value {
        Value::String(s) if s.chars().count() > MAX_STRING_CHARS => Err(EngineError::Validation(
            format!("string value exceeds {} characters", MAX_STRING_CHARS),
        )),
        Value::Array(items) => {
            for item in items {
                check_string_lengths(item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for item in map.values() {
                check_string_lengths(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redact_nested_path() {
        let mut value = json!({"credentials": {"password": "hunter2", "user": "sam"}});
        redact_paths(&mut value, &["credentials.password".to_string()]);
        assert_eq!(value["credentials"]["password"], REDACTION_TOKEN);
        assert_eq!(value["credentials"]["user"], "sam");
    }

    #[test]
    fn test_redact_missing_path_is_noop() {
        let mut value = json!({"a": 1});
        redact_paths(&mut value, &["b.c".to_string()]);
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_top_level_key_bound() {
        let mut map = serde_json::Map::new();
        for i in 0..101 {
            map.insert(format!("k{}", i), json!(1));
        }
        let context = Value::Object(map);
        assert!(validate_bounds(&context, &json!({}), "g").is_err());
    }

    #[test]
    fn test_long_string_rejected() {
        let context = json!({"blob": "x".repeat(10_001)});
        assert!(validate_bounds(&context, &json!({}), "g").is_err());
    }

    #[test]
    fn test_context_size_bound() {
        // ~70 KiB of padding split under the string-length limit
        let context = json!({"a": "x".repeat(9_000), "b": "y".repeat(9_000),
            "c": "z".repeat(9_000), "d": "w".repeat(9_000),
            "e": "v".repeat(9_000), "f": "u".repeat(9_000),
            "g": "t".repeat(9_000), "h": "s".repeat(9_000)});
        assert!(validate_bounds(&context, &json!({}), "g").is_err());
    }

    #[test]
    fn test_valid_bounds_pass() {
        let context = json!({"k": "v"});
        validate_bounds(&context, &json!({}), "do the thing").unwrap();
    }
}
