//! Batched AI summarization of active incidents.
//!
//! Every tick the worker selects open incidents lacking an AI summary,
//! fetches and redacts their events, and runs batch prompts through the
//! breaker-gated client. Parse failures and breaker outages produce a
//! deterministic fallback so the dashboard never shows an empty slot —
//! and the incident stops being reselected on every tick; retries are
//! scheduled by the breaker's half-open probing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_ai::{
    batch_prompt, parse_batch_response, parse_single_response, single_prompt, AiClient,
    ChatRequest, IncidentPromptInput, IncidentSummary, SYSTEM_PROMPT,
};
use pulse_core::{
    defaults, redact_events, AiSummaryPatch, BroadcastHub, Error, Event, EventRepository,
    Incident, IncidentAction, IncidentRepository, Result,
};

use crate::queue::EventQueue;
use crate::WorkerHandle;

/// Summarization tuning.
#[derive(Debug, Clone)]
pub struct SummarizeConfig {
    pub interval: Duration,
    /// Incidents per AI batch prompt.
    pub batch_size: usize,
    /// Only incidents created within this window are considered.
    pub lookback_ms: i64,
    /// Most-recent events fetched per incident.
    pub events_per_incident: i64,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(defaults::SUMMARIZATION_INTERVAL_MS),
            batch_size: defaults::SUMMARIZATION_BATCH_SIZE,
            lookback_ms: defaults::SUMMARIZATION_LOOKBACK_MS,
            events_per_incident: defaults::SUMMARIZATION_EVENTS_PER_INCIDENT,
        }
    }
}

impl SummarizeConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SUMMARIZATION_INTERVAL_MS` | `30000` |
    /// | `SUMMARIZATION_BATCH_SIZE` | `5` |
    pub fn from_env() -> Self {
        let interval_ms = std::env::var("SUMMARIZATION_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::SUMMARIZATION_INTERVAL_MS);
        let batch_size = std::env::var("SUMMARIZATION_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::SUMMARIZATION_BATCH_SIZE);
        Self {
            interval: Duration::from_millis(interval_ms),
            batch_size,
            ..Default::default()
        }
    }

    /// Candidate query limit: headroom for per-batch failures.
    fn candidate_limit(&self) -> i64 {
        (self.batch_size * 3) as i64
    }
}

/// The summarization worker.
pub struct SummarizationWorker {
    events: Arc<dyn EventRepository>,
    incidents: Arc<dyn IncidentRepository>,
    ai: Arc<AiClient>,
    hub: Arc<BroadcastHub>,
    /// Ingest pressure gate: AI calls are skipped while the queue is hot.
    queue: Option<Arc<EventQueue>>,
    config: SummarizeConfig,
}

impl SummarizationWorker {
    pub fn new(
        events: Arc<dyn EventRepository>,
        incidents: Arc<dyn IncidentRepository>,
        ai: Arc<AiClient>,
        hub: Arc<BroadcastHub>,
        queue: Option<Arc<EventQueue>>,
        config: SummarizeConfig,
    ) -> Self {
        Self {
            events,
            incidents,
            ai,
            hub,
            queue,
            config,
        }
    }

    /// Start the tick loop and return a control handle. The worker is
    /// shared: the manual-trigger endpoint holds the same `Arc`.
    pub fn start(self: &Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });
        WorkerHandle::new(shutdown_tx, handle)
    }

    async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            subsystem = "summarization",
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "summarization worker started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(
                            subsystem = "summarization",
                            error = %e,
                            "summarization tick failed, retrying next tick"
                        );
                    }
                }
            }
        }
        info!(subsystem = "summarization", "summarization worker stopped");
    }

    /// One summarization pass.
    pub async fn tick(&self) -> Result<()> {
        if let Some(queue) = &self.queue {
            if queue.under_pressure() {
                debug!(
                    subsystem = "summarization",
                    queue_size = queue.len(),
                    "ingest queue under pressure, skipping AI tick"
                );
                return Ok(());
            }
        }
        if !self.ai.available() {
            debug!(
                subsystem = "summarization",
                breaker_state = self.ai.breaker_status().state.as_str(),
                "AI unavailable, skipping tick"
            );
            return Ok(());
        }

        let since = Utc::now() - chrono::Duration::milliseconds(self.config.lookback_ms);
        let candidates = self
            .incidents
            .find_summary_needed(since, self.config.candidate_limit())
            .await?;
        if candidates.is_empty() {
            return Ok(());
        }
        debug!(
            subsystem = "summarization",
            candidates = candidates.len(),
            "summarizing incidents"
        );

        for batch in candidates.chunks(self.config.batch_size.max(1)) {
            self.summarize_batch(batch).await;
        }
        Ok(())
    }

    /// Summarize one batch; on any failure every incident in the batch
    /// receives the deterministic fallback.
    async fn summarize_batch(&self, batch: &[Incident]) {
        let mut inputs_data: Vec<(Incident, Vec<Event>)> = Vec::with_capacity(batch.len());
        for incident in batch {
            let events = match self
                .events
                .find_by_ids(&incident.event_ids, self.config.events_per_incident)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(
                        subsystem = "summarization",
                        incident_id = %incident.id,
                        error = %e,
                        "event fetch failed, skipping incident this tick"
                    );
                    continue;
                }
            };
            let (redacted, counts) = redact_events(&events);
            if counts.total() > 0 {
                debug!(
                    subsystem = "summarization",
                    incident_id = %incident.id,
                    replacements = counts.total(),
                    fields = counts.fields_redacted,
                    "redacted event metadata"
                );
            }
            inputs_data.push((incident.clone(), redacted));
        }
        if inputs_data.is_empty() {
            return;
        }

        let inputs: Vec<IncidentPromptInput<'_>> = inputs_data
            .iter()
            .map(|(incident, events)| IncidentPromptInput { incident, events })
            .collect();
        let prompt = batch_prompt(&inputs);
        let request = ChatRequest::new(SYSTEM_PROMPT, prompt);

        match self.ai.complete(&request).await {
            Ok(response) => match parse_batch_response(&response.text) {
                Ok(summaries) => {
                    let by_id: HashMap<String, IncidentSummary> = summaries
                        .into_iter()
                        .filter_map(|s| s.incident_id.clone().map(|id| (id, s)))
                        .collect();
                    for (incident, events) in &inputs_data {
                        match by_id.get(&incident.id.to_string()) {
                            Some(summary) => {
                                self.apply(incident, ai_patch(summary)).await;
                            }
                            None => {
                                // The model skipped this id; fall back so
                                // the incident stops being reselected.
                                self.apply(incident, fallback_patch(incident, events.len()))
                                    .await;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        subsystem = "summarization",
                        error = %e,
                        "unparseable AI response, applying fallbacks"
                    );
                    self.fallback_batch(&inputs_data).await;
                }
            },
            Err(e) => {
                warn!(
                    subsystem = "summarization",
                    error = %e,
                    "AI batch failed, applying fallbacks"
                );
                self.fallback_batch(&inputs_data).await;
            }
        }
    }

    async fn fallback_batch(&self, inputs: &[(Incident, Vec<Event>)]) {
        for (incident, events) in inputs {
            self.apply(incident, fallback_patch(incident, events.len()))
                .await;
        }
    }

    /// Write the patch and broadcast the mutation.
    async fn apply(&self, incident: &Incident, patch: AiSummaryPatch) {
        if let Err(e) = self.incidents.apply_summary(incident.id, &patch).await {
            warn!(
                subsystem = "summarization",
                incident_id = %incident.id,
                error = %e,
                "failed to persist summary"
            );
            return;
        }
        match self.incidents.find_by_id(incident.id).await {
            Ok(Some(updated)) => {
                self.hub
                    .publish_incident(&updated, IncidentAction::SummaryUpdated);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    subsystem = "summarization",
                    incident_id = %incident.id,
                    error = %e,
                    "failed to reload incident for broadcast"
                );
            }
        }
    }

    /// Manual trigger: summarize a single incident now, bypassing the
    /// schedule but still honoring the breaker.
    pub async fn summarize_one(&self, incident_id: Uuid) -> Result<Incident> {
        let incident = self
            .incidents
            .find_by_id(incident_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("incident {incident_id}")))?;

        if !self.ai.available() {
            return Err(Error::ExternalUnavailable(
                "AI summarization unavailable".to_string(),
            ));
        }

        let events = self
            .events
            .find_by_ids(&incident.event_ids, self.config.events_per_incident)
            .await?;
        let (redacted, _) = redact_events(&events);
        let prompt = single_prompt(&IncidentPromptInput {
            incident: &incident,
            events: &redacted,
        });

        let patch = match self
            .ai
            .complete(&ChatRequest::new(SYSTEM_PROMPT, prompt))
            .await
            .and_then(|response| parse_single_response(&response.text))
        {
            Ok(summary) => ai_patch(&summary),
            Err(e) => {
                warn!(
                    subsystem = "summarization",
                    incident_id = %incident_id,
                    error = %e,
                    "manual summarization fell back"
                );
                fallback_patch(&incident, events.len())
            }
        };

        self.incidents.apply_summary(incident.id, &patch).await?;
        let updated = self
            .incidents
            .find_by_id(incident.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("incident {incident_id}")))?;
        self.hub
            .publish_incident(&updated, IncidentAction::SummaryUpdated);
        Ok(updated)
    }
}

/// Convert a parsed model summary into the store patch. The impact
/// sentence rides along in the summary slot; the incident record keeps
/// no separate impact column.
fn ai_patch(summary: &IncidentSummary) -> AiSummaryPatch {
    let mut text = summary.summary.clone();
    if let Some(impact) = summary.impact.as_deref().filter(|s| !s.is_empty()) {
        text.push_str("\n\nImpact: ");
        text.push_str(impact);
    }
    AiSummaryPatch {
        ai_summary: text,
        root_cause: summary.root_cause.clone(),
        suggested_actions: summary.suggested_actions.clone(),
    }
}

/// Deterministic fallback applied when AI is unavailable or the
/// response is unusable. Still updates the incident so the UI no longer
/// shows the placeholder.
fn fallback_patch(incident: &Incident, event_count: usize) -> AiSummaryPatch {
    AiSummaryPatch {
        ai_summary: format!(
            "{} events detected across {}. AI summary unavailable.",
            event_count.max(incident.event_ids.len()),
            incident.affected_services.join(", ")
        ),
        root_cause: Some("Automated root cause analysis unavailable.".to_string()),
        suggested_actions: vec![
            "Review recent deployments for the affected services".to_string(),
            "Inspect service logs around the incident window".to_string(),
            "Escalate to the on-call engineer if impact persists".to_string(),
        ],
    }
}
