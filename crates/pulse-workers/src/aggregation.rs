//! Periodic aggregation: clusters recent unassigned events into
//! incidents.
//!
//! Each run queries events from the look-back window, records window
//! counts with the spike detector, clusters by `(service, error_type)`,
//! scores each cluster, and either extends a matching open incident or
//! creates a new one. Events are back-linked to their incident with a
//! single bulk update per cluster.
//!
//! The worker is a singleton: a run in progress inhibits the next tick.
//! One cluster's failure never aborts the run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pulse_core::{
    defaults, error_type, score_incident, BroadcastHub, Event, EventRepository, Incident,
    IncidentAction, IncidentExtension, IncidentRepository, Result, ScoringConfig, SpikeContext,
};

use crate::spike::{SpikeDetector, SpikeResult};
use crate::WorkerHandle;

/// Aggregation tuning.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Tick interval.
    pub interval: Duration,
    /// Look-back window for "recent" events, in milliseconds.
    pub window_ms: i64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(defaults::AGGREGATION_INTERVAL_MS),
            window_ms: defaults::AGGREGATION_WINDOW_MS,
        }
    }
}

impl AggregationConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `AGGREGATION_INTERVAL_MS` | `30000` |
    /// | `AGGREGATION_WINDOW_MS` | `300000` |
    pub fn from_env() -> Self {
        let interval_ms = std::env::var("AGGREGATION_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::AGGREGATION_INTERVAL_MS);
        let window_ms = std::env::var("AGGREGATION_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::AGGREGATION_WINDOW_MS);
        Self {
            interval: Duration::from_millis(interval_ms),
            window_ms,
        }
    }
}

/// Outcome counters for one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub events_seen: usize,
    pub clusters: usize,
    pub incidents_created: usize,
    pub incidents_extended: usize,
    pub cluster_errors: usize,
}

/// The aggregation worker. Owns its spike detector and scoring config.
pub struct AggregationWorker {
    events: Arc<dyn EventRepository>,
    incidents: Arc<dyn IncidentRepository>,
    spike: SpikeDetector,
    scoring: ScoringConfig,
    hub: Arc<BroadcastHub>,
    config: AggregationConfig,
    runs: u64,
}

impl AggregationWorker {
    pub fn new(
        events: Arc<dyn EventRepository>,
        incidents: Arc<dyn IncidentRepository>,
        spike: SpikeDetector,
        scoring: ScoringConfig,
        hub: Arc<BroadcastHub>,
        config: AggregationConfig,
    ) -> Self {
        Self {
            events,
            incidents,
            spike,
            scoring,
            hub,
            config,
            runs: 0,
        }
    }

    /// Start the tick loop and return a control handle.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle::new(shutdown_tx, handle)
    }

    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            subsystem = "aggregation",
            interval_ms = self.config.interval.as_millis() as u64,
            window_ms = self.config.window_ms,
            "aggregation worker started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        // A run that overruns the interval delays the next tick rather
        // than stacking concurrent runs.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let start = std::time::Instant::now();
                    match self.run_once().await {
                        Ok(report) => {
                            if report.events_seen > 0 {
                                info!(
                                    subsystem = "aggregation",
                                    event_count = report.events_seen,
                                    cluster_count = report.clusters,
                                    created = report.incidents_created,
                                    extended = report.incidents_extended,
                                    errors = report.cluster_errors,
                                    duration_ms = start.elapsed().as_millis() as u64,
                                    "aggregation run complete"
                                );
                            }
                        }
                        Err(e) => {
                            error!(
                                subsystem = "aggregation",
                                error = %e,
                                "aggregation run failed, retrying next tick"
                            );
                        }
                    }
                }
            }
        }
        info!(subsystem = "aggregation", "aggregation worker stopped");
    }

    /// One full aggregation pass. Public so tests and manual triggers
    /// can drive it without the timer.
    pub async fn run_once(&mut self) -> Result<RunReport> {
        self.runs += 1;
        let now = Utc::now();
        let since = now - chrono::Duration::milliseconds(self.config.window_ms);

        let events = self.events.find_recent_unassigned(since).await?;
        let mut report = RunReport {
            events_seen: events.len(),
            ..Default::default()
        };

        if !events.is_empty() {
            // Per-service counts feed the rolling baselines first, so
            // this run's traffic is part of the persisted history.
            let mut counts: HashMap<String, i64> = HashMap::new();
            for event in &events {
                *counts.entry(event.service.clone()).or_insert(0) += 1;
            }
            self.spike.record_counts(&counts).await;
            let spikes = self.spike.check_spikes(&counts).await;

            let spike_contexts: HashMap<String, SpikeContext> = spikes
                .iter()
                .map(|(service, result)| {
                    (
                        service.clone(),
                        SpikeContext {
                            current_count: result.current_count as f64,
                            mean: result.mean,
                        },
                    )
                })
                .collect();

            // BTreeMap keeps cluster processing order stable run to run.
            let mut clusters: BTreeMap<(String, String), Vec<Event>> = BTreeMap::new();
            for event in events {
                let key = (
                    event.service.clone(),
                    error_type(&event.metadata, event.severity),
                );
                clusters.entry(key).or_default().push(event);
            }
            report.clusters = clusters.len();

            for ((service, kind), cluster) in clusters {
                match self
                    .process_cluster(&service, &kind, cluster, &spike_contexts, &spikes)
                    .await
                {
                    Ok(extended) => {
                        if extended {
                            report.incidents_extended += 1;
                        } else {
                            report.incidents_created += 1;
                        }
                    }
                    Err(e) => {
                        report.cluster_errors += 1;
                        warn!(
                            subsystem = "aggregation",
                            service = %service,
                            error_type = %kind,
                            error = %e,
                            "cluster failed, continuing with next"
                        );
                    }
                }
            }
        }

        if self.runs % defaults::AGGREGATION_CLEANUP_EVERY == 0 {
            self.spike.cleanup().await;
        }

        Ok(report)
    }

    /// Materialize one cluster. Returns true if an existing incident
    /// was extended, false if a new one was created.
    async fn process_cluster(
        &self,
        service: &str,
        kind: &str,
        cluster: Vec<Event>,
        spike_contexts: &HashMap<String, SpikeContext>,
        spikes: &HashMap<String, SpikeResult>,
    ) -> Result<bool> {
        let now = Utc::now();
        let score = score_incident(&cluster, spike_contexts, &self.scoring);
        let spike = spikes.get(service).filter(|s| s.is_spike);
        let cluster_ids: Vec<Uuid> = cluster.iter().map(|e| e.id).collect();

        let extension_horizon = now - chrono::Duration::milliseconds(2 * self.config.window_ms);
        let candidate = self
            .incidents
            .find_extension_candidate(service, extension_horizon)
            .await?;

        let (incident_id, extended) = match candidate {
            Some(existing) => {
                let mut seen: HashSet<Uuid> = existing.event_ids.iter().copied().collect();
                let mut event_ids = existing.event_ids.clone();
                for id in &cluster_ids {
                    if seen.insert(*id) {
                        event_ids.push(*id);
                    }
                }

                let mut affected_services = existing.affected_services.clone();
                if !affected_services.iter().any(|s| s == service) {
                    affected_services.push(service.to_string());
                }

                let duration_minutes = (now - existing.created_at).num_minutes();
                let summary = deterministic_summary(
                    event_ids.len(),
                    kind,
                    service,
                    score.classification.label(),
                    spike,
                    Some(duration_minutes),
                );

                self.incidents
                    .extend(
                        existing.id,
                        &IncidentExtension {
                            event_ids,
                            severity_score: score.level,
                            affected_services,
                            summary,
                        },
                    )
                    .await?;

                if let Some(updated) = self.incidents.find_by_id(existing.id).await? {
                    self.hub.publish_incident(&updated, IncidentAction::Updated);
                }
                (existing.id, true)
            }
            None => {
                let summary = deterministic_summary(
                    cluster.len(),
                    kind,
                    service,
                    score.classification.label(),
                    spike,
                    None,
                );
                let incident = Incident::new(
                    cluster_ids.clone(),
                    score.level,
                    vec![service.to_string()],
                    summary,
                );
                self.incidents.create(&incident).await?;
                self.hub.publish_incident(&incident, IncidentAction::Created);
                debug!(
                    subsystem = "aggregation",
                    incident_id = %incident.id,
                    service = %service,
                    error_type = %kind,
                    event_count = cluster.len(),
                    severity = score.level,
                    "incident created"
                );
                (incident.id, false)
            }
        };

        // Back-link the cluster's events in one bulk update. The store
        // skips events that already carry an incident id.
        self.events.assign_incident(&cluster_ids, incident_id).await?;
        Ok(extended)
    }
}

/// The deterministic textual summary written by aggregation (distinct
/// from the AI summary slot).
fn deterministic_summary(
    event_count: usize,
    kind: &str,
    service: &str,
    classification: &str,
    spike: Option<&SpikeResult>,
    duration_minutes: Option<i64>,
) -> String {
    let mut out = format!(
        "{event_count} {kind} events from {service}. Severity: {classification}"
    );
    if let Some(spike) = spike {
        out.push_str(&format!(
            ". Spike detected: {:.1}σ above normal",
            spike.deviations
        ));
    }
    if let Some(minutes) = duration_minutes {
        if minutes > 0 {
            out.push_str(&format!(". Duration: {minutes} minutes"));
        }
    }
    out
}
