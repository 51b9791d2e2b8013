//! Circuit breaker protecting external AI calls.
//!
//! Three states: closed (calls flow, consecutive failures counted),
//! open (fast-fail until the cooldown elapses), half-open (a single
//! probe at a time; successes close the breaker, any failure reopens
//! it). The last ten transitions are retained as an audit trail.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use pulse_core::{defaults, Error, Result};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in closed state that open the breaker.
    pub failure_threshold: u32,
    /// Successes in half-open state that close the breaker.
    pub success_threshold: u32,
    /// Cooldown before an open breaker permits a probe.
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::BREAKER_FAILURE_THRESHOLD,
            success_threshold: defaults::BREAKER_SUCCESS_THRESHOLD,
            timeout: Duration::from_millis(defaults::BREAKER_TIMEOUT_MS),
        }
    }
}

impl BreakerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BREAKER_FAILURE_THRESHOLD` | `5` |
    /// | `BREAKER_SUCCESS_THRESHOLD` | `2` |
    /// | `BREAKER_TIMEOUT_MS` | `60000` |
    pub fn from_env() -> Self {
        let failure_threshold = std::env::var("BREAKER_FAILURE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::BREAKER_FAILURE_THRESHOLD);
        let success_threshold = std::env::var("BREAKER_SUCCESS_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::BREAKER_SUCCESS_THRESHOLD);
        let timeout_ms = std::env::var("BREAKER_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::BREAKER_TIMEOUT_MS);
        Self {
            failure_threshold,
            success_threshold,
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// One audited state transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Serializable snapshot for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub failures: u32,
    pub successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub transitions: Vec<Transition>,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    /// One probe at a time while half-open.
    probe_in_flight: bool,
    transitions: VecDeque<Transition>,
}

impl Inner {
    fn transition(&mut self, to: BreakerState, reason: impl Into<String>) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if self.transitions.len() >= defaults::BREAKER_AUDIT_LEN {
            self.transitions.pop_front();
        }
        let reason = reason.into();
        tracing::info!(
            subsystem = "ai",
            component = "breaker",
            from = from.as_str(),
            to = to.as_str(),
            reason = %reason,
            "circuit breaker transition"
        );
        self.transitions.push_back(Transition {
            from,
            to,
            at: Utc::now(),
            reason,
        });
    }
}

/// Three-state failure isolation primitive.
///
/// Mutation is serialized behind a mutex; [`CircuitBreaker::execute`]
/// acquires it only to check permission and to record the outcome,
/// never across the awaited call.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure_at: None,
                next_attempt_at: None,
                probe_in_flight: false,
                transitions: VecDeque::new(),
            }),
        }
    }

    /// Acquire permission for one call. In open state this transitions
    /// to half-open once the cooldown has elapsed; in half-open only a
    /// single in-flight probe is permitted.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let due = inner
                    .next_attempt_at
                    .map(|at| Utc::now() >= at)
                    .unwrap_or(true);
                if due {
                    inner.transition(BreakerState::HalfOpen, "cooldown elapsed");
                    inner.successes = 0;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Read-only permission check; never mutates state. Used by
    /// `available()` probes that must not consume the half-open slot.
    pub fn would_permit(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => inner
                .next_attempt_at
                .map(|at| Utc::now() >= at)
                .unwrap_or(true),
            BreakerState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.transition(BreakerState::Closed, "success threshold reached");
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.next_attempt_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, error: &str) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.open(&mut inner, format!("failure threshold reached: {error}"));
                }
            }
            BreakerState::HalfOpen => {
                self.open(&mut inner, format!("probe failed: {error}"));
            }
            BreakerState::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner, reason: String) {
        inner.transition(BreakerState::Open, reason);
        inner.successes = 0;
        inner.next_attempt_at =
            Some(Utc::now() + chrono::Duration::from_std(self.config.timeout).unwrap_or_default());
    }

    /// Run one call through the breaker. The state lock is not held
    /// while the future is awaited.
    pub async fn execute<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.can_execute() {
            return Err(Error::ExternalUnavailable(
                "circuit breaker open".to_string(),
            ));
        }
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure(&e.to_string());
                Err(e)
            }
        }
    }

    /// Admin: force the breaker closed and clear counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(BreakerState::Closed, "manual reset");
        inner.failures = 0;
        inner.successes = 0;
        inner.probe_in_flight = false;
        inner.next_attempt_at = None;
    }

    /// Admin: force the breaker open.
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        self.open(&mut inner, "manually tripped".to_string());
    }

    /// Snapshot including the retained transition audit trail.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        BreakerStatus {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            last_failure_at: inner.last_failure_at,
            next_attempt_at: inner.next_attempt_at,
            transitions: inner.transitions.iter().cloned().collect(),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
