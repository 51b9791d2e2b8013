//! Error-type extraction for cluster affinity.
//!
//! Aggregation buckets events by `(service, error_type)` and the prompt
//! builder labels incidents with the same value, so the lookup lives
//! here rather than in either consumer.

use serde_json::Value as JsonValue;

/// Metadata keys probed for an error type, in priority order.
const ERROR_TYPE_KEYS: [&str; 6] = [
    "errorType",
    "error_type",
    "type",
    "category",
    "errorCode",
    "error_code",
];

/// Extract the error type of an event from its metadata.
///
/// Returns the first non-empty string among the known keys, else the
/// synthetic `severity_<n>` bucket so every event clusters somewhere.
pub fn error_type(metadata: &JsonValue, severity: i16) -> String {
    if let JsonValue::Object(map) = metadata {
        for key in ERROR_TYPE_KEYS {
            if let Some(JsonValue::String(s)) = map.get(key) {
                if !s.is_empty() {
                    return s.clone();
                }
            }
        }
    }
    format!("severity_{}", severity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_type_prefers_camel_case_key() {
        let meta = json!({"errorType": "Timeout", "type": "other"});
        assert_eq!(error_type(&meta, 3), "Timeout");
    }

    #[test]
    fn test_error_type_ordered_fallthrough() {
        let meta = json!({"error_code": "E42", "category": "db"});
        assert_eq!(error_type(&meta, 3), "db");
    }

    #[test]
    fn test_error_type_skips_empty_strings() {
        let meta = json!({"errorType": "", "type": "DeadlockDetected"});
        assert_eq!(error_type(&meta, 3), "DeadlockDetected");
    }

    #[test]
    fn test_error_type_ignores_non_string_values() {
        let meta = json!({"errorType": 500, "category": "upstream"});
        assert_eq!(error_type(&meta, 3), "upstream");
    }

    #[test]
    fn test_error_type_synthetic_fallback() {
        assert_eq!(error_type(&json!({}), 4), "severity_4");
        assert_eq!(error_type(&JsonValue::Null, 2), "severity_2");
        assert_eq!(error_type(&json!("not a map"), 1), "severity_1");
    }
}
