// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the quota accountant.

use std::sync::Arc;

use agentflow_core::CoreError;
use agentflow_core::persistence::SqlitePersistence;
use agentflow_core::quota::{QuotaAccountant, QuotaDimension};

async fn accountant() -> QuotaAccountant {
    let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
    QuotaAccountant::new(persistence)
}

#[tokio::test]
async fn test_reserve_then_consume_increases_usage_by_exactly_one() {
    let quota = accountant().await;

    // Starter plan: db_storage_gb limit 5; pre-existing usage of 2.
    quota
        .reserve("w1", "starter", QuotaDimension::DbStorageGb, 2)
        .await
        .unwrap();
    quota.consume("w1", QuotaDimension::DbStorageGb, 2).await.unwrap();
    assert_eq!(quota.usage("w1", QuotaDimension::DbStorageGb).await.unwrap(), (2, 0));

    quota
        .reserve("w1", "starter", QuotaDimension::DbStorageGb, 1)
        .await
        .unwrap();
    // The reservation is visible before consumption.
    assert_eq!(quota.usage("w1", QuotaDimension::DbStorageGb).await.unwrap(), (2, 1));

    quota.consume("w1", QuotaDimension::DbStorageGb, 1).await.unwrap();
    assert_eq!(quota.usage("w1", QuotaDimension::DbStorageGb).await.unwrap(), (3, 0));
}

#[tokio::test]
async fn test_reserve_beyond_limit_fails_with_side_data() {
    let quota = accountant().await;

    // Free plan: db_storage_gb limit 1.
    quota
        .reserve("w1", "free", QuotaDimension::DbStorageGb, 1)
        .await
        .unwrap();

    let err = quota
        .reserve("w1", "free", QuotaDimension::DbStorageGb, 1)
        .await
        .unwrap_err();
    match err {
        CoreError::QuotaExceeded {
            dimension,
            limit,
            used,
        } => {
            assert_eq!(dimension, "db_storage_gb");
            assert_eq!(limit, 1);
            assert_eq!(used, 1);
        }
        other => panic!("expected QuotaExceeded, got {:?}", other),
    }
}

#[tokio::test]
async fn test_release_returns_headroom() {
    let quota = accountant().await;

    quota
        .reserve("w1", "free", QuotaDimension::DbStorageGb, 1)
        .await
        .unwrap();
    quota.release("w1", QuotaDimension::DbStorageGb, 1).await.unwrap();
    assert_eq!(quota.usage("w1", QuotaDimension::DbStorageGb).await.unwrap(), (0, 0));

    // The released headroom is reservable again.
    quota
        .reserve("w1", "free", QuotaDimension::DbStorageGb, 1)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dimensions_are_independent() {
    let quota = accountant().await;

    quota
        .reserve("w1", "free", QuotaDimension::DbStorageGb, 1)
        .await
        .unwrap();
    quota.consume("w1", QuotaDimension::DbStorageGb, 1).await.unwrap();

    // db_storage_gb is exhausted; custom_domains is untouched.
    quota
        .reserve("w1", "free", QuotaDimension::CustomDomains, 1)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_usage_is_per_workspace() {
    let quota = accountant().await;

    quota
        .reserve("w1", "free", QuotaDimension::DbStorageGb, 1)
        .await
        .unwrap();

    assert_eq!(quota.usage("w2", QuotaDimension::DbStorageGb).await.unwrap(), (0, 0));
    quota
        .reserve("w2", "free", QuotaDimension::DbStorageGb, 1)
        .await
        .unwrap();
}
