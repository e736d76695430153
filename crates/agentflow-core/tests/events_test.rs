// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the batched event recorder.

use std::sync::Arc;
use std::time::Duration;

use agentflow_core::events::{Event, EventRecorderConfig, recorder};
use agentflow_core::persistence::{Persistence, SqlitePersistence};

#[tokio::test]
async fn test_events_flush_and_drain_on_shutdown() {
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::in_memory().await.unwrap());

    let (events, writer) = recorder(persistence.clone(), EventRecorderConfig::default());
    let shutdown = writer.shutdown_handle();
    let task = tokio::spawn(async move { writer.run().await });

    events.record(Event::DbProvisionSucceeded {
        workspace_id: "w1".to_string(),
        db_name: "ws_abc".to_string(),
        duration_ms: 420,
    });
    events.record(Event::DomainVerified {
        workspace_id: "w1".to_string(),
        domain: "app.example.com".to_string(),
    });
    events.record_for(
        Event::DomainActivated {
            workspace_id: "w1".to_string(),
            domain: "app.example.com".to_string(),
        },
        Some("user-9"),
    );

    // Shutdown drains whatever was queued.
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.notify_waiters();
    task.await.unwrap();

    let stored = persistence.list_runtime_events("w1", 10).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(events.dropped(), 0);

    let activated = stored
        .iter()
        .find(|e| e.event_type == "domain.activated")
        .unwrap();
    assert_eq!(activated.actor_id.as_deref(), Some("user-9"));
    assert_eq!(activated.severity, "info");
}

#[tokio::test]
async fn test_flush_max_triggers_early_write() {
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::in_memory().await.unwrap());

    let config = EventRecorderConfig {
        capacity: 1000,
        flush_max: 10,
        // Long enough that only the size threshold can flush.
        flush_interval: Duration::from_secs(3600),
    };
    let (events, writer) = recorder(persistence.clone(), config);
    let shutdown = writer.shutdown_handle();
    let task = tokio::spawn(async move { writer.run().await });

    for i in 0..25 {
        events.record(Event::DomainVerified {
            workspace_id: "w1".to_string(),
            domain: format!("d{}.example.com", i),
        });
    }

    // Two full batches land without any timer tick.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stored = persistence.list_runtime_events("w1", 100).await.unwrap();
    assert!(stored.len() >= 20, "expected >= 20 flushed, got {}", stored.len());

    shutdown.notify_waiters();
    task.await.unwrap();

    let stored = persistence.list_runtime_events("w1", 100).await.unwrap();
    assert_eq!(stored.len(), 25);
}

#[tokio::test]
async fn test_overflow_drops_instead_of_blocking() {
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::in_memory().await.unwrap());

    let config = EventRecorderConfig {
        capacity: 5,
        flush_max: 100,
        flush_interval: Duration::from_secs(3600),
    };
    // The writer is deliberately never started: the channel fills up.
    let (events, _writer) = recorder(persistence, config);

    for _ in 0..20 {
        events.record(Event::WorkspacePurged {
            workspace_id: "w1".to_string(),
        });
    }

    assert_eq!(events.dropped(), 15);
}

#[tokio::test]
async fn test_metadata_is_scrubbed_before_persistence() {
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::in_memory().await.unwrap());

    let (events, writer) = recorder(persistence.clone(), EventRecorderConfig::default());
    let shutdown = writer.shutdown_handle();
    let task = tokio::spawn(async move { writer.run().await });

    events.record(Event::DbProvisionFailed {
        workspace_id: "w1".to_string(),
        error: "access denied for user".to_string(),
        duration_ms: 900,
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.notify_waiters();
    task.await.unwrap();

    let stored = persistence.list_runtime_events("w1", 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].severity, "error");

    let metadata: serde_json::Value =
        serde_json::from_str(stored[0].metadata.as_deref().unwrap()).unwrap();
    assert_eq!(metadata["duration_ms"], 900);
    assert_eq!(metadata["error"], "access denied for user");
}
