//! Tolerant parsing of model responses.
//!
//! Models occasionally wrap their JSON in prose or code fences; the
//! extractor scans for the first balanced object instead of trusting
//! the whole body.

use serde::Deserialize;

use pulse_core::{Error, Result};

/// Per-incident summary fields returned by the model.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncidentSummary {
    pub incident_id: Option<String>,
    pub summary: String,
    pub root_cause: Option<String>,
    pub impact: Option<String>,
    pub suggested_actions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    incidents: Vec<IncidentSummary>,
}

/// Extract the first balanced `{...}` object, skipping string contents.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a batch response `{"incidents": [...]}`.
pub fn parse_batch_response(text: &str) -> Result<Vec<IncidentSummary>> {
    let json = extract_json(text)
        .ok_or_else(|| Error::Serialization("no JSON object in AI response".to_string()))?;
    let parsed: BatchResponse = serde_json::from_str(json)?;
    Ok(parsed.incidents)
}

/// Parse a single-incident response with top-level summary fields.
pub fn parse_single_response(text: &str) -> Result<IncidentSummary> {
    let json = extract_json(text)
        .ok_or_else(|| Error::Serialization("no JSON object in AI response".to_string()))?;
    let parsed: IncidentSummary = serde_json::from_str(json)?;
    if parsed.summary.is_empty() {
        return Err(Error::Serialization(
            "AI response missing summary field".to_string(),
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_batch_plain_json() {
        let text = r#"{"incidents": [{"incidentId": "abc", "summary": "Deadlocks in order-service", "rootCause": "lock contention", "impact": "checkout latency", "suggestedActions": ["add retry", "tune pool"]}]}"#;
        let incidents = parse_batch_response(text).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident_id.as_deref(), Some("abc"));
        assert_eq!(incidents[0].suggested_actions.len(), 2);
    }

    #[test]
    fn test_parse_batch_with_code_fence() {
        let text = "Here is the analysis:\n```json\n{\"incidents\": [{\"incidentId\": \"x\", \"summary\": \"s\"}]}\n```\nLet me know if you need more.";
        let incidents = parse_batch_response(text).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].summary, "s");
        // Missing fields default rather than failing the whole batch.
        assert!(incidents[0].root_cause.is_none());
        assert!(incidents[0].suggested_actions.is_empty());
    }

    #[test]
    fn test_parse_batch_braces_inside_strings() {
        let text = r#"{"incidents": [{"incidentId": "a", "summary": "error was {code: 500}"}]}"#;
        let incidents = parse_batch_response(text).unwrap();
        assert_eq!(incidents[0].summary, "error was {code: 500}");
    }

    #[test]
    fn test_parse_batch_no_json_is_error() {
        assert!(parse_batch_response("I cannot analyze these incidents.").is_err());
    }

    #[test]
    fn test_parse_batch_empty_incidents() {
        let incidents = parse_batch_response(r#"{"incidents": []}"#).unwrap();
        assert!(incidents.is_empty());
    }

    #[test]
    fn test_parse_single() {
        let text = r#"{"summary": "API gateway overloaded", "rootCause": "traffic spike", "impact": "5xx responses", "suggestedActions": ["scale out"]}"#;
        let parsed = parse_single_response(text).unwrap();
        assert_eq!(parsed.summary, "API gateway overloaded");
        assert_eq!(parsed.impact.as_deref(), Some("5xx responses"));
    }

    #[test]
    fn test_parse_single_requires_summary() {
        assert!(parse_single_response(r#"{"rootCause": "unknown"}"#).is_err());
    }

    #[test]
    fn test_extract_json_unbalanced_returns_none() {
        assert!(extract_json(r#"{"incidents": ["#).is_none());
        assert!(extract_json("no braces at all").is_none());
    }
}
