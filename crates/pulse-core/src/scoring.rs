//! Severity scoring: pure functions from events and spike context to a
//! composite incident score.
//!
//! No I/O happens here; the aggregation worker feeds in events and the
//! per-service spike data it already holds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{CriticalService, Event};

/// Base score per severity value 1..=5.
const BASE_SCORES: [u32; 5] = [10, 25, 50, 75, 100];

/// Frequency ratio ladder: (threshold, multiplier, level).
const FREQUENCY_LADDER: [(f64, f64, FrequencyLevel); 3] = [
    (4.0, 2.0, FrequencyLevel::Critical),
    (2.5, 1.6, FrequencyLevel::High),
    (1.5, 1.3, FrequencyLevel::Elevated),
];

/// Scoring configuration: which services are business-critical and how
/// strongly their events are weighted.
#[derive(Debug, Clone, Default)]
pub struct ScoringConfig {
    /// Keyed by lowercased service name.
    critical_services: HashMap<String, CriticalService>,
}

impl ScoringConfig {
    pub fn new(critical_services: HashMap<String, CriticalService>) -> Self {
        let critical_services = critical_services
            .into_iter()
            .map(|(name, svc)| (name.to_lowercase(), svc))
            .collect();
        Self { critical_services }
    }

    /// Parse the `CRITICAL_SERVICES` environment variable, a JSON map
    /// `{"payment-service": {"multiplier": 2.0, "alertThreshold": 10}}`.
    /// Missing or malformed values degrade to an empty map with a warning.
    pub fn from_env() -> Self {
        match std::env::var("CRITICAL_SERVICES") {
            Ok(raw) if !raw.trim().is_empty() => {
                match serde_json::from_str::<HashMap<String, CriticalService>>(&raw) {
                    Ok(map) => Self::new(map),
                    Err(e) => {
                        tracing::warn!(error = %e, "Invalid CRITICAL_SERVICES, ignoring");
                        Self::default()
                    }
                }
            }
            _ => Self::default(),
        }
    }

    /// Case-insensitive multiplier lookup; non-critical services weigh 1.0.
    pub fn multiplier(&self, service: &str) -> f64 {
        self.critical_services
            .get(&service.to_lowercase())
            .map(|svc| svc.multiplier)
            .unwrap_or(1.0)
    }
}

/// Per-service frequency context from the spike detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeContext {
    pub current_count: f64,
    pub mean: f64,
}

/// Event-rate classification derived from the frequency ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

/// Breakdown of a single event's score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EventScore {
    pub base: u32,
    pub service_multiplier: f64,
    pub frequency_multiplier: f64,
    pub frequency_level: FrequencyLevel,
    /// `min(round(base · service · frequency), 100)`.
    pub final_score: u32,
}

/// Incident classification bands over the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Low,
    Medium,
    High,
    Critical,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Low => "low",
            Classification::Medium => "medium",
            Classification::High => "high",
            Classification::Critical => "critical",
        }
    }

    /// Uppercase form used in deterministic incident summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Low => "LOW",
            Classification::Medium => "MEDIUM",
            Classification::High => "HIGH",
            Classification::Critical => "CRITICAL",
        }
    }
}

/// Composite score for a set of events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IncidentScore {
    /// 0..=100.
    pub composite: u32,
    /// 1..=5 severity level for the incident record.
    pub level: i16,
    pub classification: Classification,
    pub max_score: u32,
    pub avg_score: f64,
}

fn base_score(severity: i16) -> u32 {
    let idx = severity.clamp(1, 5) as usize - 1;
    BASE_SCORES[idx]
}

fn frequency(spike: Option<&SpikeContext>) -> (f64, FrequencyLevel) {
    let Some(ctx) = spike else {
        return (1.0, FrequencyLevel::Normal);
    };
    // A service with no baseline but live traffic is treated as elevated
    // rather than dividing toward infinity.
    if ctx.mean <= 0.0 {
        if ctx.current_count > 0.0 {
            return (1.3, FrequencyLevel::Elevated);
        }
        return (1.0, FrequencyLevel::Normal);
    }
    let ratio = ctx.current_count / ctx.mean;
    for (threshold, multiplier, level) in FREQUENCY_LADDER {
        if ratio >= threshold {
            return (multiplier, level);
        }
    }
    (1.0, FrequencyLevel::Normal)
}

/// Score one event against its optional per-service spike context.
pub fn score_event(event: &Event, spike: Option<&SpikeContext>, config: &ScoringConfig) -> EventScore {
    let base = base_score(event.severity);
    let service_multiplier = config.multiplier(&event.service);
    let (frequency_multiplier, frequency_level) = frequency(spike);
    let raw = (base as f64 * service_multiplier * frequency_multiplier).round() as u32;
    EventScore {
        base,
        service_multiplier,
        frequency_multiplier,
        frequency_level,
        final_score: raw.min(100),
    }
}

/// Score a set of events as one incident.
///
/// Composite blends the worst event with the average, scaled by a
/// logarithmic count factor capped at 1.5, then maps onto the 1..=5
/// severity level and the classification bands.
pub fn score_incident(
    events: &[Event],
    spikes: &HashMap<String, SpikeContext>,
    config: &ScoringConfig,
) -> IncidentScore {
    if events.is_empty() {
        return IncidentScore {
            composite: 0,
            level: 1,
            classification: Classification::Low,
            max_score: 0,
            avg_score: 0.0,
        };
    }

    let scores: Vec<u32> = events
        .iter()
        .map(|event| score_event(event, spikes.get(&event.service), config).final_score)
        .collect();

    let max_score = *scores.iter().max().expect("non-empty");
    let avg_score = scores.iter().sum::<u32>() as f64 / scores.len() as f64;
    let count_factor = (1.0 + 0.2 * (scores.len() as f64).log10()).min(1.5);
    let composite =
        ((0.6 * max_score as f64 + 0.4 * avg_score) * count_factor).round() as u32;
    let composite = composite.min(100);

    IncidentScore {
        composite,
        level: level_for(composite),
        classification: classification_for(composite),
        max_score,
        avg_score,
    }
}

/// Map a composite score onto the 1..=5 incident severity level.
fn level_for(composite: u32) -> i16 {
    match composite {
        90.. => 5,
        75..=89 => 4,
        50..=74 => 3,
        25..=49 => 2,
        _ => 1,
    }
}

/// Note the asymmetry with [`level_for`]: 25..50 maps to level 2 but
/// still reads as "low".
fn classification_for(composite: u32) -> Classification {
    match composite {
        90.. => Classification::Critical,
        75..=89 => Classification::High,
        50..=74 => Classification::Medium,
        _ => Classification::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn event(service: &str, severity: i16) -> Event {
        Event {
            id: Uuid::now_v7(),
            service: service.to_string(),
            severity,
            timestamp: Utc::now(),
            metadata: json!({}),
            tags: vec![],
            incident_id: None,
        }
    }

    fn config_with_payment() -> ScoringConfig {
        let mut map = HashMap::new();
        map.insert(
            "Payment-Service".to_string(),
            CriticalService {
                multiplier: 2.0,
                alert_threshold: None,
            },
        );
        ScoringConfig::new(map)
    }

    #[test]
    fn test_base_score_table() {
        for (severity, expected) in [(1, 10), (2, 25), (3, 50), (4, 75), (5, 100)] {
            assert_eq!(base_score(severity), expected);
        }
        assert_eq!(base_score(0), 10);
        assert_eq!(base_score(9), 100);
    }

    #[test]
    fn test_score_event_payment_spike_saturates() {
        // severity 4 on a 2.0x critical service at 5x baseline rate
        let config = config_with_payment();
        let spike = SpikeContext {
            current_count: 50.0,
            mean: 10.0,
        };
        let score = score_event(&event("payment-service", 4), Some(&spike), &config);
        assert_eq!(score.base, 75);
        assert_eq!(score.service_multiplier, 2.0);
        assert_eq!(score.frequency_multiplier, 2.0);
        assert_eq!(score.frequency_level, FrequencyLevel::Critical);
        assert_eq!(score.final_score, 100);
    }

    #[test]
    fn test_score_event_case_insensitive_service_lookup() {
        let config = config_with_payment();
        let score = score_event(&event("PAYMENT-SERVICE", 2), None, &config);
        assert_eq!(score.service_multiplier, 2.0);
        assert_eq!(score.final_score, 50);
    }

    #[test]
    fn test_frequency_ladder_boundaries() {
        let cases = [
            (1.4, 1.0, FrequencyLevel::Normal),
            (1.5, 1.3, FrequencyLevel::Elevated),
            (2.5, 1.6, FrequencyLevel::High),
            (4.0, 2.0, FrequencyLevel::Critical),
        ];
        for (ratio, expected_mul, expected_level) in cases {
            let ctx = SpikeContext {
                current_count: ratio * 10.0,
                mean: 10.0,
            };
            let (mul, level) = frequency(Some(&ctx));
            assert_eq!(mul, expected_mul, "ratio {ratio}");
            assert_eq!(level, expected_level, "ratio {ratio}");
        }
    }

    #[test]
    fn test_frequency_zero_mean_is_elevated() {
        let ctx = SpikeContext {
            current_count: 7.0,
            mean: 0.0,
        };
        let (mul, level) = frequency(Some(&ctx));
        assert_eq!(mul, 1.3);
        assert_eq!(level, FrequencyLevel::Elevated);
    }

    #[test]
    fn test_frequency_no_context_is_normal() {
        let (mul, level) = frequency(None);
        assert_eq!(mul, 1.0);
        assert_eq!(level, FrequencyLevel::Normal);
    }

    #[test]
    fn test_score_incident_empty() {
        let score = score_incident(&[], &HashMap::new(), &ScoringConfig::default());
        assert_eq!(score.composite, 0);
        assert_eq!(score.level, 1);
        assert_eq!(score.classification, Classification::Low);
    }

    #[test]
    fn test_score_incident_single_event() {
        // one severity-3 event, no spikes: composite = round(0.6*50 + 0.4*50) = 50
        let events = vec![event("api", 3)];
        let score = score_incident(&events, &HashMap::new(), &ScoringConfig::default());
        assert_eq!(score.composite, 50);
        assert_eq!(score.level, 3);
        assert_eq!(score.classification, Classification::Medium);
    }

    #[test]
    fn test_score_incident_count_factor_capped() {
        // 1000 severity-5 events: count factor would be 1.6, capped at 1.5,
        // and the composite still saturates at 100
        let events: Vec<Event> = (0..1000).map(|_| event("api", 5)).collect();
        let score = score_incident(&events, &HashMap::new(), &ScoringConfig::default());
        assert_eq!(score.composite, 100);
        assert_eq!(score.level, 5);
        assert_eq!(score.classification, Classification::Critical);
    }

    #[test]
    fn test_score_incident_bounds_and_determinism() {
        let events = vec![event("api", 2), event("db", 4), event("api", 1)];
        let spikes = HashMap::from([(
            "api".to_string(),
            SpikeContext {
                current_count: 30.0,
                mean: 10.0,
            },
        )]);
        let config = ScoringConfig::default();
        let first = score_incident(&events, &spikes, &config);
        let second = score_incident(&events, &spikes, &config);
        assert_eq!(first, second);
        assert!(first.composite <= 100);
        assert!((1..=5).contains(&first.level));
    }

    #[test]
    fn test_classification_bands() {
        let cases = [
            (0, 1, Classification::Low),
            (24, 1, Classification::Low),
            (25, 2, Classification::Low),
            (49, 2, Classification::Low),
            (50, 3, Classification::Medium),
            (74, 3, Classification::Medium),
            (75, 4, Classification::High),
            (89, 4, Classification::High),
            (90, 5, Classification::Critical),
            (100, 5, Classification::Critical),
        ];
        for (composite, level, classification) in cases {
            assert_eq!(level_for(composite), level, "composite {composite}");
            assert_eq!(
                classification_for(composite),
                classification,
                "composite {composite}"
            );
        }
    }
}
