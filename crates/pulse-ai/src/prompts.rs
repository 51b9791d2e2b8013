//! Prompt construction for incident summarization.
//!
//! The events handed in here must already be redacted; this module
//! only formats.

use pulse_core::{error_type, Event, Incident};

/// System preamble declaring the analyst role.
pub const SYSTEM_PROMPT: &str = "You are an experienced SRE analyst. You review clusters of \
operational events and produce concise, factual incident summaries for an on-call dashboard. \
Base every statement strictly on the provided events. Respond with a single JSON object and \
nothing else.";

/// One incident plus its (redacted) member events.
pub struct IncidentPromptInput<'a> {
    pub incident: &'a Incident,
    pub events: &'a [Event],
}

impl IncidentPromptInput<'_> {
    fn time_range(&self) -> String {
        let mut timestamps: Vec<_> = self.events.iter().map(|e| e.timestamp).collect();
        timestamps.sort();
        match (timestamps.first(), timestamps.last()) {
            (Some(first), Some(last)) => format!(
                "{} to {}",
                first.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                last.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            ),
            _ => "unknown".to_string(),
        }
    }

    fn max_severity(&self) -> i16 {
        self.events.iter().map(|e| e.severity).max().unwrap_or(0)
    }

    fn render(&self, index: usize, out: &mut String) {
        let incident = self.incident;
        out.push_str(&format!("Incident {}:\n", index + 1));
        out.push_str(&format!("- incidentId: {}\n", incident.id));
        out.push_str(&format!(
            "- services: {}\n",
            incident.affected_services.join(", ")
        ));
        out.push_str(&format!("- time range: {}\n", self.time_range()));
        out.push_str(&format!("- event count: {}\n", incident.event_ids.len()));
        out.push_str(&format!("- max severity: {}\n", self.max_severity()));
        if let Some(event) = self.events.first() {
            out.push_str(&format!(
                "- error type: {}\n",
                error_type(&event.metadata, event.severity)
            ));
        }
        let events_json =
            serde_json::to_string(&self.events).unwrap_or_else(|_| "[]".to_string());
        out.push_str(&format!("- events (redacted): {}\n\n", events_json));
    }
}

/// Batch prompt: every incident rendered, one JSON object expected back.
pub fn batch_prompt(items: &[IncidentPromptInput<'_>]) -> String {
    let mut out = format!(
        "Analyze the following {} incident(s) from an operational event stream.\n\n",
        items.len()
    );
    for (index, item) in items.iter().enumerate() {
        item.render(index, &mut out);
    }
    out.push_str(
        "For each incident, provide a short summary (2-3 sentences), the most likely root \
cause, the user-facing impact, and 2-4 suggested remediation actions.\n\
Respond with a single JSON object of exactly this form:\n\
{\"incidents\": [{\"incidentId\": \"<id>\", \"summary\": \"...\", \"rootCause\": \"...\", \
\"impact\": \"...\", \"suggestedActions\": [\"...\"]}]}\n\
Include every incidentId from above exactly once.",
    );
    out
}

/// Single-incident prompt: the response object is unwrapped.
pub fn single_prompt(item: &IncidentPromptInput<'_>) -> String {
    let mut out = String::from("Analyze the following incident from an operational event stream.\n\n");
    item.render(0, &mut out);
    out.push_str(
        "Provide a short summary (2-3 sentences), the most likely root cause, the \
user-facing impact, and 2-4 suggested remediation actions.\n\
Respond with a single JSON object of exactly this form:\n\
{\"summary\": \"...\", \"rootCause\": \"...\", \"impact\": \"...\", \
\"suggestedActions\": [\"...\"]}",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn fixture() -> (Incident, Vec<Event>) {
        let events = vec![
            Event {
                id: Uuid::now_v7(),
                service: "order-service".to_string(),
                severity: 4,
                timestamp: Utc::now(),
                metadata: json!({"errorType": "DeadlockDetected"}),
                tags: vec![],
                incident_id: None,
            },
            Event {
                id: Uuid::now_v7(),
                service: "order-service".to_string(),
                severity: 2,
                timestamp: Utc::now(),
                metadata: json!({"errorType": "DeadlockDetected"}),
                tags: vec![],
                incident_id: None,
            },
        ];
        let incident = Incident::new(
            events.iter().map(|e| e.id).collect(),
            3,
            vec!["order-service".to_string()],
            "2 DeadlockDetected events from order-service. Severity: MEDIUM".to_string(),
        );
        (incident, events)
    }

    #[test]
    fn test_batch_prompt_lists_every_incident() {
        let (incident_a, events_a) = fixture();
        let (incident_b, events_b) = fixture();
        let prompt = batch_prompt(&[
            IncidentPromptInput {
                incident: &incident_a,
                events: &events_a,
            },
            IncidentPromptInput {
                incident: &incident_b,
                events: &events_b,
            },
        ]);
        assert!(prompt.contains(&incident_a.id.to_string()));
        assert!(prompt.contains(&incident_b.id.to_string()));
        assert!(prompt.contains("Incident 1:"));
        assert!(prompt.contains("Incident 2:"));
        assert!(prompt.contains(r#"{"incidents""#));
        assert!(prompt.contains("- error type: DeadlockDetected"));
        assert!(prompt.contains("- max severity: 4"));
    }

    #[test]
    fn test_single_prompt_shape() {
        let (incident, events) = fixture();
        let prompt = single_prompt(&IncidentPromptInput {
            incident: &incident,
            events: &events,
        });
        assert!(prompt.contains(&incident.id.to_string()));
        assert!(prompt.contains(r#"{"summary""#));
        assert!(!prompt.contains(r#"{"incidents""#));
    }

    #[test]
    fn test_prompt_embeds_event_json() {
        let (incident, events) = fixture();
        let prompt = single_prompt(&IncidentPromptInput {
            incident: &incident,
            events: &events,
        });
        assert!(prompt.contains("DeadlockDetected"));
        assert!(prompt.contains("order-service"));
    }
}
