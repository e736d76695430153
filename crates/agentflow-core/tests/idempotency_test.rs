// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the idempotency ledger.

use std::sync::Arc;

use agentflow_core::CoreError;
use agentflow_core::idempotency::{Begin, IdempotencyLedger};
use agentflow_core::persistence::SqlitePersistence;

async fn ledger() -> IdempotencyLedger {
    let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
    IdempotencyLedger::new(persistence)
}

#[tokio::test]
async fn test_begin_complete_replays_same_resource() {
    let ledger = ledger().await;
    let hash = IdempotencyLedger::request_hash(b"provision w1");

    let record = match ledger.begin("owner1", "db.provision", "key1", &hash).await.unwrap() {
        Begin::Started(record) => record,
        Begin::Replayed { .. } => panic!("fresh key must start"),
    };
    ledger
        .complete(&record, "tenant_database", "res-123")
        .await
        .unwrap();

    // Two successive cycles with the same hash resolve to the same id.
    for _ in 0..2 {
        match ledger.begin("owner1", "db.provision", "key1", &hash).await.unwrap() {
            Begin::Replayed {
                resource_type,
                resource_id,
            } => {
                assert_eq!(resource_type.as_deref(), Some("tenant_database"));
                assert_eq!(resource_id, "res-123");
            }
            Begin::Started(_) => panic!("completed key must replay"),
        }
    }
}

#[tokio::test]
async fn test_processing_key_reports_in_progress() {
    let ledger = ledger().await;
    let hash = IdempotencyLedger::request_hash(b"provision w1");

    let _started = ledger.begin("owner1", "db.provision", "key1", &hash).await.unwrap();

    let err = ledger
        .begin("owner1", "db.provision", "key1", &hash)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InProgress { .. }));
}

#[tokio::test]
async fn test_hash_mismatch_conflicts() {
    let ledger = ledger().await;

    let hash_a = IdempotencyLedger::request_hash(b"body a");
    let hash_b = IdempotencyLedger::request_hash(b"body b");

    let record = match ledger.begin("owner1", "db.provision", "key1", &hash_a).await.unwrap() {
        Begin::Started(record) => record,
        Begin::Replayed { .. } => unreachable!(),
    };
    ledger.complete(&record, "tenant_database", "res-1").await.unwrap();

    let err = ledger
        .begin("owner1", "db.provision", "key1", &hash_b)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict { .. }));
}

#[tokio::test]
async fn test_failed_key_can_be_retried() {
    let ledger = ledger().await;
    let hash = IdempotencyLedger::request_hash(b"provision w1");

    let record = match ledger.begin("owner1", "db.provision", "key1", &hash).await.unwrap() {
        Begin::Started(record) => record,
        Begin::Replayed { .. } => unreachable!(),
    };
    ledger.fail(&record).await.unwrap();

    // The key is handed back for a fresh attempt.
    match ledger.begin("owner1", "db.provision", "key1", &hash).await.unwrap() {
        Begin::Started(record) => {
            assert_eq!(record.status, "processing");
            assert!(record.resource_id.is_none());
        }
        Begin::Replayed { .. } => panic!("failed key must restart"),
    }
}

#[tokio::test]
async fn test_keys_are_scoped_by_owner_and_action() {
    let ledger = ledger().await;
    let hash = IdempotencyLedger::request_hash(b"same body");

    let a = ledger.begin("owner1", "db.provision", "key1", &hash).await.unwrap();
    let b = ledger.begin("owner2", "db.provision", "key1", &hash).await.unwrap();
    let c = ledger.begin("owner1", "db.rotate", "key1", &hash).await.unwrap();

    assert!(matches!(a, Begin::Started(_)));
    assert!(matches!(b, Begin::Started(_)));
    assert!(matches!(c, Begin::Started(_)));
}
