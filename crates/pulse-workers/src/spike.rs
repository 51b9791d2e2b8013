//! Per-service rolling event-rate anomaly detection.
//!
//! Counts are persisted per `(service, window)` so baselines survive
//! restarts. The anomaly test is a z-score over the retained windows:
//! a count above `mean + k·stddev` is a spike, graded by how many
//! deviations it sits above the mean.
//!
//! The detector never propagates store failures to its callers; it
//! logs and degrades to "insufficient data".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use pulse_core::{defaults, StatsRepository};

/// Detector tuning.
#[derive(Debug, Clone)]
pub struct SpikeConfig {
    /// Width of one counting window in milliseconds.
    pub window_ms: i64,
    /// Windows of history retained per service.
    pub history_windows: i64,
    /// Deviations above the mean that count as a spike.
    pub std_dev_threshold: f64,
    /// Minimum retained windows before verdicts are produced.
    pub min_data_points: usize,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            window_ms: defaults::SPIKE_WINDOW_MS,
            history_windows: defaults::SPIKE_HISTORY_WINDOWS,
            std_dev_threshold: defaults::SPIKE_STDDEV_THRESHOLD,
            min_data_points: defaults::SPIKE_MIN_DATA_POINTS,
        }
    }
}

impl SpikeConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SPIKE_WINDOW_MS` | `300000` |
    /// | `SPIKE_HISTORY_WINDOWS` | `12` |
    /// | `SPIKE_STDDEV_THRESHOLD` | `2.0` |
    /// | `SPIKE_MIN_DATA_POINTS` | `3` |
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
        Self {
            window_ms: var("SPIKE_WINDOW_MS", defaults::SPIKE_WINDOW_MS),
            history_windows: var("SPIKE_HISTORY_WINDOWS", defaults::SPIKE_HISTORY_WINDOWS),
            std_dev_threshold: var("SPIKE_STDDEV_THRESHOLD", defaults::SPIKE_STDDEV_THRESHOLD),
            min_data_points: var("SPIKE_MIN_DATA_POINTS", defaults::SPIKE_MIN_DATA_POINTS),
        }
    }

    /// Retention horizon: rows older than this are cleaned up.
    pub fn retention(&self) -> Duration {
        Duration::from_millis((2 * self.window_ms * self.history_windows).max(0) as u64)
    }
}

/// Spike grading by deviations above the mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpikeLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl SpikeLevel {
    fn from_deviations(d: f64) -> Self {
        if d >= 4.0 {
            SpikeLevel::Critical
        } else if d >= 3.0 {
            SpikeLevel::High
        } else if d >= 2.0 {
            SpikeLevel::Elevated
        } else {
            SpikeLevel::Normal
        }
    }
}

/// Verdict for one service's current count.
#[derive(Debug, Clone, Serialize)]
pub struct SpikeResult {
    pub is_spike: bool,
    pub has_enough_data: bool,
    pub current_count: i64,
    pub mean: f64,
    pub std_dev: f64,
    pub threshold: f64,
    /// `(current - mean) / stddev`; 0 when stddev is 0.
    pub deviations: f64,
    pub level: SpikeLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl SpikeResult {
    fn insufficient(current_count: i64) -> Self {
        Self {
            is_spike: false,
            has_enough_data: false,
            current_count,
            mean: 0.0,
            std_dev: 0.0,
            threshold: 0.0,
            deviations: 0.0,
            level: SpikeLevel::Normal,
            reason: Some("insufficient_data"),
        }
    }
}

/// Pure z-score evaluation over retained window counts. Deterministic
/// for a fixed input regardless of call order.
pub fn evaluate_window(counts: &[i64], current_count: i64, config: &SpikeConfig) -> SpikeResult {
    if counts.len() < config.min_data_points {
        return SpikeResult::insufficient(current_count);
    }

    let n = counts.len() as f64;
    let mean = counts.iter().sum::<i64>() as f64 / n;
    let variance = counts
        .iter()
        .map(|&c| {
            let d = c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std_dev = variance.sqrt();
    let threshold = mean + std_dev * config.std_dev_threshold;

    let is_spike = current_count as f64 > threshold && std_dev > 0.0;
    let deviations = if std_dev > 0.0 {
        (current_count as f64 - mean) / std_dev
    } else {
        0.0
    };

    SpikeResult {
        is_spike,
        has_enough_data: true,
        current_count,
        mean,
        std_dev,
        threshold,
        deviations,
        level: SpikeLevel::from_deviations(deviations),
        reason: None,
    }
}

/// Rolling per-service anomaly detector backed by the stats store.
pub struct SpikeDetector {
    stats: Arc<dyn StatsRepository>,
    config: SpikeConfig,
}

impl SpikeDetector {
    pub fn new(stats: Arc<dyn StatsRepository>, config: SpikeConfig) -> Self {
        Self { stats, config }
    }

    pub fn config(&self) -> &SpikeConfig {
        &self.config
    }

    /// Canonical window key: `"w_" + floor(t/window)*window` in ms.
    pub fn window_key(&self, at: DateTime<Utc>) -> String {
        let ms = at.timestamp_millis();
        let bucket = ms.div_euclid(self.config.window_ms) * self.config.window_ms;
        format!("w_{bucket}")
    }

    pub fn current_window_key(&self) -> String {
        self.window_key(Utc::now())
    }

    /// Upsert this run's per-service counts into the current window.
    /// Store failures are logged, not propagated.
    pub async fn record_counts(&self, counts: &HashMap<String, i64>) {
        let window_key = self.current_window_key();
        for (service, &count) in counts {
            if count <= 0 {
                continue;
            }
            if let Err(e) = self.stats.upsert_count(service, &window_key, count).await {
                tracing::warn!(
                    subsystem = "spike",
                    service = %service,
                    error = %e,
                    "failed to record window count"
                );
            }
        }
    }

    /// Evaluate one service's current count against its retained
    /// baseline. A store failure degrades to insufficient data.
    pub async fn is_spike(&self, service: &str, current_count: i64) -> SpikeResult {
        let rows = match self
            .stats
            .find_recent(service, self.config.history_windows)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(
                    subsystem = "spike",
                    service = %service,
                    error = %e,
                    "stats read failed, treating as insufficient data"
                );
                return SpikeResult::insufficient(current_count);
            }
        };
        let counts: Vec<i64> = rows.iter().map(|r| r.count).collect();
        let result = evaluate_window(&counts, current_count, &self.config);
        if result.is_spike {
            tracing::info!(
                subsystem = "spike",
                service = %service,
                current = current_count,
                mean = result.mean,
                deviations = result.deviations,
                "spike detected"
            );
        }
        result
    }

    /// Evaluate every service in this run's count map.
    pub async fn check_spikes(
        &self,
        counts: &HashMap<String, i64>,
    ) -> HashMap<String, SpikeResult> {
        let mut results = HashMap::new();
        for (service, &count) in counts {
            let result = self.is_spike(service, count).await;
            results.insert(service.clone(), result);
        }
        results
    }

    /// Drop stats rows past the retention horizon
    /// (`2 × window × history`).
    pub async fn cleanup(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention()).unwrap_or_default();
        match self.stats.delete_older_than(cutoff).await {
            Ok(removed) if removed > 0 => {
                tracing::debug!(subsystem = "spike", removed, "stats cleanup");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(subsystem = "spike", error = %e, "stats cleanup failed");
            }
        }
    }
}
