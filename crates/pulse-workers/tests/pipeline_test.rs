//! End-to-end pipeline test: ingest queue → store → aggregation →
//! summarization, over the in-memory store and mock AI backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use pulse_ai::{AiClient, BreakerConfig, CircuitBreaker, MockBackend};
use pulse_core::{
    BroadcastHub, Event, EventRepository, Frame, IncidentAction, IncidentRepository, ScoringConfig,
};
use pulse_db::MemoryStore;
use pulse_workers::{
    AggregationConfig, AggregationWorker, EventQueue, QueueConfig, QueueWorker, SpikeConfig,
    SpikeDetector, SummarizationWorker, SummarizeConfig,
};

fn event(service: &str, kind: &str, severity: i16) -> Event {
    Event {
        id: Uuid::now_v7(),
        service: service.to_string(),
        severity,
        timestamp: Utc::now(),
        metadata: json!({"errorType": kind, "clientIp": "10.1.2.3"}),
        tags: vec!["prod".to_string()],
        incident_id: None,
    }
}

#[tokio::test]
async fn events_flow_from_queue_to_ai_summary() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(BroadcastHub::new(256));
    let queue = Arc::new(EventQueue::new(1000));

    // Subscriber watching the whole pipeline.
    let (_session, mut rx) = hub.attach();
    rx.recv().await.unwrap(); // greeting

    // Stage 1: ingest through the queue worker.
    let queue_worker = QueueWorker::new(
        queue.clone(),
        store.clone(),
        hub.clone(),
        QueueConfig {
            max_queue_size: 1000,
            batch_size: 50,
            batch_interval: Duration::from_millis(10),
            broadcast_batch_size: 50,
            broadcast_batch_interval: Duration::from_millis(5),
        },
    );
    let queue_handle = queue_worker.start();

    for _ in 0..6 {
        assert!(queue
            .enqueue(event("checkout", "DeadlockDetected", 4))
            .is_accepted());
    }
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(store.event_count(), 6);

    // Six event frames reached the subscriber, in order.
    let mut event_frames = 0;
    while let Ok(frame) = rx.try_recv() {
        if matches!(frame, Frame::Event { .. }) {
            event_frames += 1;
        }
    }
    assert_eq!(event_frames, 6);

    // Stage 2: aggregation clusters them into one incident.
    let mut aggregation = AggregationWorker::new(
        store.clone(),
        store.clone(),
        SpikeDetector::new(store.clone(), SpikeConfig::default()),
        ScoringConfig::default(),
        hub.clone(),
        AggregationConfig::default(),
    );
    let report = aggregation.run_once().await.unwrap();
    assert_eq!(report.events_seen, 6);
    assert_eq!(report.incidents_created, 1);

    let incident = store.all_incidents().pop().unwrap();
    assert_eq!(incident.event_ids.len(), 6);
    assert!(incident.summary.contains("DeadlockDetected"));
    assert!(incident.ai_summary.is_none());

    match rx.recv().await.unwrap() {
        Frame::Incident { action, .. } => assert_eq!(action, IncidentAction::Created),
        other => panic!("expected incident frame, got {other:?}"),
    }

    // Stage 3: summarization writes the AI slot.
    let mock = Arc::new(MockBackend::new());
    mock.push_text(format!(
        r#"{{"incidents": [{{"incidentId": "{}", "summary": "Checkout deadlocks", "rootCause": "row lock contention", "impact": "slow checkouts", "suggestedActions": ["shorten transactions"]}}]}}"#,
        incident.id
    ));
    let ai = Arc::new(AiClient::new(
        mock.clone(),
        CircuitBreaker::new(BreakerConfig::default()),
        3,
    ));
    let summarizer = SummarizationWorker::new(
        store.clone(),
        store.clone(),
        ai,
        hub.clone(),
        Some(queue.clone()),
        SummarizeConfig::default(),
    );
    summarizer.tick().await.unwrap();

    let summarized = IncidentRepository::find_by_id(store.as_ref(), incident.id)
        .await
        .unwrap()
        .unwrap();
    assert!(summarized
        .ai_summary
        .as_deref()
        .unwrap()
        .starts_with("Checkout deadlocks"));
    // Aggregation's deterministic summary survives in its own slot.
    assert!(summarized.summary.contains("DeadlockDetected"));
    // The prompt saw redacted metadata only.
    assert!(mock.last_prompt().unwrap().contains("[REDACTED_IP]"));

    match rx.recv().await.unwrap() {
        Frame::Incident { action, .. } => {
            assert_eq!(action, IncidentAction::SummaryUpdated)
        }
        other => panic!("expected summary_updated frame, got {other:?}"),
    }

    queue_handle.shutdown().await;
}

#[tokio::test]
async fn once_assigned_events_never_reassigned_across_runs() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(BroadcastHub::new(64));

    let first_batch = vec![
        event("order-service", "DeadlockDetected", 3),
        event("order-service", "DeadlockDetected", 3),
    ];
    store.insert_many(&first_batch).await.unwrap();

    let mut aggregation = AggregationWorker::new(
        store.clone(),
        store.clone(),
        SpikeDetector::new(store.clone(), SpikeConfig::default()),
        ScoringConfig::default(),
        hub.clone(),
        AggregationConfig::default(),
    );
    aggregation.run_once().await.unwrap();
    let incident_id = store.all_incidents().pop().unwrap().id;

    // Later events extend the same incident; the earlier assignments
    // are untouched.
    let second_batch = vec![
        event("order-service", "DeadlockDetected", 5),
        event("order-service", "DeadlockDetected", 5),
    ];
    store.insert_many(&second_batch).await.unwrap();
    aggregation.run_once().await.unwrap();

    let incidents = store.all_incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].id, incident_id);
    assert_eq!(incidents[0].event_ids.len(), 4);
    for e in store.all_events() {
        assert_eq!(e.incident_id, Some(incident_id));
    }
}
