//! End-to-end tests for heartbeat ingestion and application announcement
//!
//! These tests drive whole pipelines against shared stores and verify:
//! - The register → flush → announce lifecycle
//! - Exactly one announcement per application across concurrent pipelines
//! - Behaviour when stores go offline

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use registrar::models::{AnnouncementEvent, EventType};
use registrar::pipeline::Pipeline;
use registrar::storage::{
    MemoryApplicationStore, MemoryEventSink, MemoryInstanceStore, SqliteStore, Stores,
};

use common::{fast_config, manual_config, registration};

fn events_per_app(events: &[AnnouncementEvent]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for event in events {
        *counts.entry(event.app_name.clone()).or_insert(0) += 1;
    }
    counts
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_register_flush_announce_lifecycle() {
    let pipeline = Pipeline::new(manual_config(), Stores::in_memory());
    let stores = pipeline.stores().clone();

    pipeline
        .register_heartbeat(&registration("demo-app-1", "instance-1"), "127.0.0.1")
        .unwrap();
    pipeline
        .register_heartbeat(&registration("demo-app-2", "instance-1"), "127.0.0.1")
        .unwrap();

    pipeline.flush().await.unwrap();
    assert_eq!(stores.applications.find_unannounced().await.unwrap().len(), 2);

    pipeline
        .register_heartbeat(&registration("demo-app-1", "instance-2"), "127.0.0.2")
        .unwrap();
    pipeline.flush().await.unwrap();

    pipeline.announce().await.unwrap();
    assert!(stores.applications.find_unannounced().await.unwrap().is_empty());

    let events = stores.events.list(Some(EventType::ApplicationCreated)).await.unwrap();
    assert_eq!(events.len(), 2);

    // A returning application is never announced again
    pipeline
        .register_heartbeat(&registration("demo-app-1", "instance-3"), "127.0.0.3")
        .unwrap();
    pipeline.flush().await.unwrap();
    pipeline.announce().await.unwrap();
    pipeline.announce().await.unwrap();

    let events = stores.events.list(None).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(stores.instances.list_for_application("demo-app-1").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_event_payload_carries_announced_application() {
    let pipeline = Pipeline::new(manual_config(), Stores::in_memory());
    pipeline
        .register_heartbeat(&registration("billing", "pod-1"), "10.0.0.1")
        .unwrap();

    pipeline.flush().await.unwrap();
    pipeline.announce().await.unwrap();

    let events = pipeline.stores().events.list(None).await.unwrap();
    let event = &events[0];
    assert_eq!(event.event_type, EventType::ApplicationCreated);
    assert_eq!(event.created_by, "registrar-system");
    assert_eq!(event.created_by_user_id, -1337);
    assert_eq!(event.payload["appName"], "billing");
    assert_eq!(event.payload["announced"], true);
}

#[tokio::test]
async fn test_timers_announce_without_manual_ticks() {
    let mut pipeline = Pipeline::new(fast_config(), Stores::in_memory());
    pipeline.start();

    for i in 0..5 {
        pipeline
            .register_heartbeat(&registration(&format!("app-{i}"), "pod-1"), "10.0.0.1")
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    pipeline.shutdown().await.unwrap();

    let events = pipeline.stores().events.list(None).await.unwrap();
    assert_eq!(events.len(), 5);
    assert!(events_per_app(&events).values().all(|&n| n == 1));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pipelines_announce_once() {
    let stores = Stores::in_memory();
    let pipelines: Vec<Arc<Pipeline>> = (0..3)
        .map(|_| Arc::new(Pipeline::new(manual_config(), stores.clone())))
        .collect();

    let producers = pipelines.iter().enumerate().map(|(p, pipeline)| {
        let pipeline = Arc::clone(pipeline);
        tokio::spawn(async move {
            for round in 0..10 {
                for app in 0..20 {
                    let instance = format!("p{p}-pod-{}", round % 2);
                    pipeline
                        .register_heartbeat(&registration(&format!("app-{app}"), &instance), "10.0.0.1")
                        .unwrap();
                }
                tokio::task::yield_now().await;
            }
        })
    });
    for result in join_all(producers).await {
        result.unwrap();
    }

    for result in join_all(pipelines.iter().map(|p| p.flush())).await {
        result.unwrap();
    }
    for result in join_all(pipelines.iter().map(|p| p.announce())).await {
        result.unwrap();
    }

    let events = stores.events.list(None).await.unwrap();
    let counts = events_per_app(&events);
    assert_eq!(counts.len(), 20);
    assert!(counts.values().all(|&n| n == 1));
    assert_eq!(stores.instances.list_for_application("app-0").await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_sqlite_handles_share_one_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registrar.db");

    // Two handles stand in for two server processes
    let first = Pipeline::new(
        manual_config(),
        Stores::from_shared(Arc::new(SqliteStore::open(&path).unwrap())),
    );
    let second = Pipeline::new(
        manual_config(),
        Stores::from_shared(Arc::new(SqliteStore::open(&path).unwrap())),
    );

    for app in ["billing", "search", "checkout"] {
        first.register_heartbeat(&registration(app, "pod-a"), "10.0.0.1").unwrap();
        second.register_heartbeat(&registration(app, "pod-b"), "10.0.0.2").unwrap();
    }

    let (a, b) = tokio::join!(first.flush(), second.flush());
    a.unwrap();
    b.unwrap();
    let (a, b) = tokio::join!(first.announce(), second.announce());
    let (a, b) = (a.unwrap().completed().unwrap(), b.unwrap().completed().unwrap());

    assert_eq!(a.announced + b.announced, 3);
    let events = first.stores().events.list(None).await.unwrap();
    assert_eq!(events.len(), 3);
    assert!(events_per_app(&events).values().all(|&n| n == 1));
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_offline_store_drops_batch_until_next_heartbeat() {
    let applications = Arc::new(MemoryApplicationStore::new());
    let instances = Arc::new(MemoryInstanceStore::new());
    let events = Arc::new(MemoryEventSink::new());
    let stores = Stores::new(applications.clone(), instances.clone(), events.clone());
    let pipeline = Pipeline::new(manual_config(), stores);

    pipeline
        .register_heartbeat(&registration("billing", "pod-1"), "10.0.0.1")
        .unwrap();
    instances.set_unavailable(true);

    assert!(pipeline.flush().await.is_err());
    assert_eq!(pipeline.buffered(), 0);

    instances.set_unavailable(false);
    pipeline.flush().await.unwrap();
    assert!(applications.is_empty().await);

    // The next heartbeat repopulates what the failed flush dropped
    pipeline
        .register_heartbeat(&registration("billing", "pod-1"), "10.0.0.1")
        .unwrap();
    pipeline.flush().await.unwrap();
    pipeline.announce().await.unwrap();
    assert_eq!(events.len().await, 1);
}

#[tokio::test]
async fn test_registration_unaffected_by_offline_stores() {
    let applications = Arc::new(MemoryApplicationStore::new());
    applications.set_unavailable(true);
    let stores = Stores::new(
        applications,
        Arc::new(MemoryInstanceStore::new()),
        Arc::new(MemoryEventSink::new()),
    );
    let pipeline = Pipeline::new(manual_config(), stores);

    for i in 0..100 {
        pipeline
            .register_heartbeat(&registration("billing", &format!("pod-{i}")), "10.0.0.1")
            .unwrap();
    }

    assert_eq!(pipeline.buffered(), 100);
    assert!(pipeline.announce().await.is_err());
}
