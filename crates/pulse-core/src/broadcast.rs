//! Broadcast hub: fan-out of events and incident mutations to
//! real-time subscribers.
//!
//! Each session is a small actor: the hub holds a bounded outbound
//! frame channel per session and publishes by non-blockingly offering
//! to each. A slow session whose buffer overflows is closed rather than
//! blocking publishers. Per-session frame order matches publish order;
//! no cross-session ordering is promised.
//!
//! Channels are service names, with the sentinel `"all"` meaning every
//! service. While a session is paused, event frames are suppressed but
//! incident and control frames still deliver.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::defaults;
use crate::models::{Event, Incident, IncidentAction};

/// Channel sentinel subscribing a session to every service.
pub const CHANNEL_ALL: &str = "all";

/// Opaque session identifier.
pub type SessionId = Uuid;

// =============================================================================
// FRAMES
// =============================================================================

/// Server → client frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Greeting sent on attach.
    Connection {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// A newly persisted event.
    Event {
        data: Event,
        timestamp: DateTime<Utc>,
    },
    /// An incident mutation.
    Incident {
        action: IncidentAction,
        data: Incident,
        timestamp: DateTime<Utc>,
    },
    /// Acknowledgement of a subscription change.
    Subscribed {
        channels: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// Reply to a client ping.
    Pong { timestamp: DateTime<Utc> },
    /// Diagnostic for malformed or unknown client frames.
    Error { message: String },
}

impl Frame {
    /// Event frames are the only kind suppressed while paused.
    fn is_event(&self) -> bool {
        matches!(self, Frame::Event { .. })
    }
}

/// Client → server control frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe {
        #[serde(default)]
        channels: Vec<String>,
    },
    Ping,
    Pause {
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Resume,
}

// =============================================================================
// METRICS
// =============================================================================

/// Atomic counters for hub observability. Monotonic, lock-free,
/// reset on process restart.
#[derive(Debug, Default)]
struct HubMetrics {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    frames_sent: AtomicU64,
    events_suppressed: AtomicU64,
    overflow_closed: AtomicU64,
    sessions_reaped: AtomicU64,
}

/// Serializable snapshot of hub metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubMetricsSnapshot {
    pub active_sessions: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub frames_sent: u64,
    pub events_suppressed: u64,
    pub overflow_closed: u64,
    pub sessions_reaped: u64,
}

// =============================================================================
// HUB
// =============================================================================

struct Session {
    tx: mpsc::Sender<Frame>,
    channels: HashSet<String>,
    paused: bool,
    last_seen: Instant,
}

impl Session {
    fn subscribed_to(&self, service: &str) -> bool {
        self.channels.contains(CHANNEL_ALL) || self.channels.contains(service)
    }
}

/// Subscriber registry with per-channel filtering and non-blocking
/// fan-out.
pub struct BroadcastHub {
    sessions: RwLock<HashMap<SessionId, Session>>,
    buffer_size: usize,
    metrics: HubMetrics,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(defaults::SESSION_BUFFER_SIZE)
    }
}

impl BroadcastHub {
    /// Create a hub whose sessions buffer up to `buffer_size` outbound
    /// frames before being closed as slow.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            buffer_size,
            metrics: HubMetrics::default(),
        }
    }

    /// Register a session and hand back its frame stream. The greeting
    /// frame is already queued; the new session is subscribed to `all`.
    pub fn attach(&self) -> (SessionId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let id = Uuid::now_v7();
        let greeting = Frame::Connection {
            message: "connected to pulse event stream".to_string(),
            timestamp: Utc::now(),
        };
        // Buffer is empty at attach time, cannot overflow.
        let _ = tx.try_send(greeting);
        self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);

        let session = Session {
            tx,
            channels: HashSet::from([CHANNEL_ALL.to_string()]),
            paused: false,
            last_seen: Instant::now(),
        };
        self.sessions.write().insert(id, session);
        self.metrics.sessions_opened.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id = %id, "broadcast session attached");
        (id, rx)
    }

    /// Remove a session (client disconnect or transport error).
    pub fn detach(&self, id: SessionId) {
        if self.sessions.write().remove(&id).is_some() {
            self.metrics.sessions_closed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session_id = %id, "broadcast session detached");
        }
    }

    /// Replace a session's channel set. An empty list subscribes to
    /// `all`. Returns the effective channels, already acknowledged to
    /// the session with a `subscribed` frame.
    pub fn subscribe(&self, id: SessionId, channels: Vec<String>) -> Vec<String> {
        let effective: Vec<String> = if channels.is_empty() {
            vec![CHANNEL_ALL.to_string()]
        } else {
            channels
        };
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(&id) {
            session.channels = effective.iter().cloned().collect();
            session.last_seen = Instant::now();
            let ack = Frame::Subscribed {
                channels: effective.clone(),
                timestamp: Utc::now(),
            };
            if session.tx.try_send(ack).is_ok() {
                self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        effective
    }

    /// Suppress event frames for a session until resumed.
    pub fn pause(&self, id: SessionId, _timestamp: Option<DateTime<Utc>>) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(&id) {
            session.paused = true;
            session.last_seen = Instant::now();
        }
    }

    /// Resume event delivery for a session.
    pub fn resume(&self, id: SessionId) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(&id) {
            session.paused = false;
            session.last_seen = Instant::now();
        }
    }

    /// Record liveness for a session (any inbound traffic counts).
    pub fn touch(&self, id: SessionId) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(&id) {
            session.last_seen = Instant::now();
        }
    }

    /// Reply to a client-level ping.
    pub fn pong(&self, id: SessionId) {
        self.send_to(
            id,
            Frame::Pong {
                timestamp: Utc::now(),
            },
        );
    }

    /// Send a diagnostic frame; the session stays open.
    pub fn send_error(&self, id: SessionId, message: impl Into<String>) {
        self.send_to(
            id,
            Frame::Error {
                message: message.into(),
            },
        );
    }

    fn send_to(&self, id: SessionId, frame: Frame) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(&id) {
            session.last_seen = Instant::now();
            if session.tx.try_send(frame).is_ok() {
                self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Deliver an event frame to every unpaused session subscribed to
    /// the event's service (or `all`). Overflowing sessions are closed.
    pub fn publish_event(&self, event: &Event) {
        let timestamp = Utc::now();
        self.fan_out(|session| {
            if !session.subscribed_to(&event.service) {
                return Delivery::Skip;
            }
            if session.paused {
                return Delivery::Suppressed;
            }
            Delivery::Send(Frame::Event {
                data: event.clone(),
                timestamp,
            })
        });
    }

    /// Deliver an incident frame to every session regardless of channel.
    /// Incident frames are not suppressed by pause.
    pub fn publish_incident(&self, incident: &Incident, action: IncidentAction) {
        let timestamp = Utc::now();
        self.fan_out(|_session| {
            Delivery::Send(Frame::Incident {
                action,
                data: incident.clone(),
                timestamp,
            })
        });
    }

    fn fan_out<F>(&self, mut decide: F)
    where
        F: FnMut(&Session) -> Delivery,
    {
        let mut overflowed: Vec<SessionId> = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, session) in sessions.iter() {
                match decide(session) {
                    Delivery::Skip => {}
                    Delivery::Suppressed => {
                        self.metrics
                            .events_suppressed
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Delivery::Send(frame) => match session.tx.try_send(frame) {
                        Ok(()) => {
                            self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Full(f)) => {
                            tracing::warn!(
                                session_id = %id,
                                frame_event = f.is_event(),
                                "session outbound buffer full, closing"
                            );
                            overflowed.push(*id);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            overflowed.push(*id);
                        }
                    },
                }
            }
        }
        if !overflowed.is_empty() {
            let mut sessions = self.sessions.write();
            for id in overflowed {
                if sessions.remove(&id).is_some() {
                    self.metrics.overflow_closed.fetch_add(1, Ordering::Relaxed);
                    self.metrics.sessions_closed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Remove sessions with no inbound traffic for `max_idle`.
    /// Returns the number reaped.
    pub fn reap_stale(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let alive = session.last_seen.elapsed() < max_idle;
            if !alive {
                tracing::info!(session_id = %id, "reaping unresponsive session");
            }
            alive
        });
        let reaped = before - sessions.len();
        if reaped > 0 {
            self.metrics
                .sessions_reaped
                .fetch_add(reaped as u64, Ordering::Relaxed);
            self.metrics
                .sessions_closed
                .fetch_add(reaped as u64, Ordering::Relaxed);
        }
        reaped
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn metrics_snapshot(&self) -> HubMetricsSnapshot {
        let opened = self.metrics.sessions_opened.load(Ordering::Relaxed);
        let closed = self.metrics.sessions_closed.load(Ordering::Relaxed);
        HubMetricsSnapshot {
            active_sessions: opened.saturating_sub(closed),
            sessions_opened: opened,
            sessions_closed: closed,
            frames_sent: self.metrics.frames_sent.load(Ordering::Relaxed),
            events_suppressed: self.metrics.events_suppressed.load(Ordering::Relaxed),
            overflow_closed: self.metrics.overflow_closed.load(Ordering::Relaxed),
            sessions_reaped: self.metrics.sessions_reaped.load(Ordering::Relaxed),
        }
    }
}

enum Delivery {
    Skip,
    Suppressed,
    Send(Frame),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(service: &str) -> Event {
        Event {
            id: Uuid::now_v7(),
            service: service.to_string(),
            severity: 3,
            timestamp: Utc::now(),
            metadata: json!({}),
            tags: vec![],
            incident_id: None,
        }
    }

    fn sample_incident() -> Incident {
        Incident::new(
            vec![Uuid::now_v7()],
            2,
            vec!["api".to_string()],
            "1 Timeout events from api. Severity: LOW".to_string(),
        )
    }

    #[tokio::test]
    async fn test_attach_sends_greeting() {
        let hub = BroadcastHub::new(8);
        let (_id, mut rx) = hub.attach();
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, Frame::Connection { .. }));
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_event_default_all_channel() {
        let hub = BroadcastHub::new(8);
        let (_id, mut rx) = hub.attach();
        rx.recv().await.unwrap(); // greeting

        hub.publish_event(&sample_event("checkout"));
        let frame = rx.recv().await.unwrap();
        match frame {
            Frame::Event { data, .. } => assert_eq!(data.service, "checkout"),
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_channel_filtering() {
        let hub = BroadcastHub::new(8);
        let (id, mut rx) = hub.attach();
        rx.recv().await.unwrap(); // greeting

        let effective = hub.subscribe(id, vec!["payments".to_string()]);
        assert_eq!(effective, vec!["payments".to_string()]);
        match rx.recv().await.unwrap() {
            Frame::Subscribed { channels, .. } => {
                assert_eq!(channels, vec!["payments".to_string()])
            }
            other => panic!("expected subscribed frame, got {other:?}"),
        }

        hub.publish_event(&sample_event("inventory"));
        hub.publish_event(&sample_event("payments"));
        match rx.recv().await.unwrap() {
            Frame::Event { data, .. } => assert_eq!(data.service, "payments"),
            other => panic!("expected payments event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_empty_means_all() {
        let hub = BroadcastHub::new(8);
        let (id, mut rx) = hub.attach();
        rx.recv().await.unwrap();

        let effective = hub.subscribe(id, vec![]);
        assert_eq!(effective, vec![CHANNEL_ALL.to_string()]);
        rx.recv().await.unwrap(); // subscribed ack

        hub.publish_event(&sample_event("anything"));
        assert!(matches!(rx.recv().await.unwrap(), Frame::Event { .. }));
    }

    #[tokio::test]
    async fn test_pause_suppresses_events_but_not_incidents() {
        let hub = BroadcastHub::new(8);
        let (id, mut rx) = hub.attach();
        rx.recv().await.unwrap();

        hub.pause(id, Some(Utc::now()));
        hub.publish_event(&sample_event("api"));
        hub.publish_incident(&sample_incident(), IncidentAction::Created);

        // The event was suppressed; the incident frame arrives first.
        match rx.recv().await.unwrap() {
            Frame::Incident { action, .. } => assert_eq!(action, IncidentAction::Created),
            other => panic!("expected incident frame, got {other:?}"),
        }
        assert_eq!(hub.metrics_snapshot().events_suppressed, 1);

        hub.resume(id);
        hub.publish_event(&sample_event("api"));
        assert!(matches!(rx.recv().await.unwrap(), Frame::Event { .. }));
    }

    #[tokio::test]
    async fn test_overflowing_session_is_closed() {
        let hub = BroadcastHub::new(2);
        let (_id, mut rx) = hub.attach();
        rx.recv().await.unwrap(); // drain greeting so two slots remain

        for _ in 0..3 {
            hub.publish_event(&sample_event("api"));
        }
        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.metrics_snapshot().overflow_closed, 1);
    }

    #[tokio::test]
    async fn test_per_session_frame_ordering() {
        let hub = BroadcastHub::new(16);
        let (_id, mut rx) = hub.attach();
        rx.recv().await.unwrap();

        let events: Vec<Event> = (0..5).map(|_| sample_event("api")).collect();
        for event in &events {
            hub.publish_event(event);
        }
        for expected in &events {
            match rx.recv().await.unwrap() {
                Frame::Event { data, .. } => assert_eq!(data.id, expected.id),
                other => panic!("expected event frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_pong_and_error_frames() {
        let hub = BroadcastHub::new(8);
        let (id, mut rx) = hub.attach();
        rx.recv().await.unwrap();

        hub.pong(id);
        assert!(matches!(rx.recv().await.unwrap(), Frame::Pong { .. }));

        hub.send_error(id, "unknown message type: snooze");
        match rx.recv().await.unwrap() {
            Frame::Error { message } => assert!(message.contains("snooze")),
            other => panic!("expected error frame, got {other:?}"),
        }
        // Diagnostics do not terminate the session.
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn test_reap_stale_sessions() {
        let hub = BroadcastHub::new(8);
        let (id_stale, _rx1) = hub.attach();
        let (id_live, _rx2) = hub.attach();

        // Only the live session shows recent traffic.
        std::thread::sleep(Duration::from_millis(30));
        hub.touch(id_live);

        let reaped = hub.reap_stale(Duration::from_millis(20));
        assert_eq!(reaped, 1);
        assert_eq!(hub.session_count(), 1);
        let _ = id_stale;
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let hub = BroadcastHub::new(8);
        let (id, _rx) = hub.attach();
        hub.detach(id);
        hub.detach(id);
        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.metrics_snapshot().sessions_closed, 1);
    }

    #[test]
    fn test_client_frame_parsing() {
        let subscribe: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","channels":["payments"]}"#).unwrap();
        assert!(matches!(subscribe, ClientFrame::Subscribe { channels } if channels.len() == 1));

        let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientFrame::Ping));

        let pause: ClientFrame =
            serde_json::from_str(r#"{"type":"pause","timestamp":"2026-08-01T00:00:00Z"}"#).unwrap();
        assert!(matches!(pause, ClientFrame::Pause { timestamp: Some(_) }));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"snooze"}"#).is_err());
    }

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::Pong {
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"pong"#));

        let frame = Frame::Incident {
            action: IncidentAction::SummaryUpdated,
            data: sample_incident(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"incident"#));
        assert!(json.contains(r#""action":"summary_updated"#));
    }
}
