// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the SQLite persistence backend.

use agentflow_core::CoreError;
use agentflow_core::persistence::{
    CustomDomainRecord, DomainStatus, ExportJobRecord, ExportJobStatus, ExportJobType,
    Persistence, SchemaMigrationRequestRecord, SchemaRequestStatus, SqlitePersistence, SslStatus,
    TenantDatabaseRecord, TenantDbStatus, WorkspaceRecord, WorkspaceStatus, new_record_id,
};
use chrono::{Duration, Utc};

fn workspace(slug: &str) -> WorkspaceRecord {
    let now = Utc::now();
    WorkspaceRecord {
        id: new_record_id(),
        owner_id: new_record_id(),
        slug: slug.to_string(),
        plan: "starter".to_string(),
        status: WorkspaceStatus::Active.to_string(),
        region: "eu-central".to_string(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

fn domain(workspace_id: &str, app_id: &str, name: &str) -> CustomDomainRecord {
    let now = Utc::now();
    CustomDomainRecord {
        id: new_record_id(),
        workspace_id: workspace_id.to_string(),
        app_id: Some(app_id.to_string()),
        domain: name.to_string(),
        verification_token: "TOK".to_string(),
        status: DomainStatus::Verified.to_string(),
        ssl_status: SslStatus::Issued.to_string(),
        verification_attempts: 0,
        next_retry_at: None,
        ssl_issue_attempts: 0,
        ssl_next_retry_at: None,
        ssl_issued_at: Some(now),
        ssl_expires_at: Some(now + Duration::days(90)),
        blocked_reason: None,
        prior_status: None,
        support_url: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn test_workspace_slug_is_unique() {
    let persistence = SqlitePersistence::in_memory().await.unwrap();

    persistence.create_workspace(&workspace("acme")).await.unwrap();
    let err = persistence
        .create_workspace(&workspace("acme"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");
}

#[tokio::test]
async fn test_workspace_soft_delete_and_lookup() {
    let persistence = SqlitePersistence::in_memory().await.unwrap();
    let ws = workspace("acme");
    persistence.create_workspace(&ws).await.unwrap();

    let deleted_at = Utc::now() - Duration::days(8);
    persistence.soft_delete_workspace(&ws.id, deleted_at).await.unwrap();

    let found = persistence
        .workspaces_deleted_before(Utc::now() - Duration::days(7), 10)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, ws.id);
    assert_eq!(found[0].status, "deleted");
}

#[tokio::test]
async fn test_tenant_database_is_one_per_workspace() {
    let persistence = SqlitePersistence::in_memory().await.unwrap();
    let ws = workspace("acme");
    persistence.create_workspace(&ws).await.unwrap();

    let now = Utc::now();
    let record = TenantDatabaseRecord {
        id: new_record_id(),
        workspace_id: ws.id.clone(),
        db_name: format!("ws_{}", ws.id),
        db_user: format!("wsu_{}", &ws.id[..28]),
        host: "127.0.0.1".to_string(),
        port: 3306,
        secret_ref: None,
        status: TenantDbStatus::Provisioning.to_string(),
        last_error: None,
        created_at: now,
        updated_at: now,
    };
    persistence.insert_tenant_database(&record).await.unwrap();

    let mut second = record.clone();
    second.id = new_record_id();
    let err = persistence.insert_tenant_database(&second).await.unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");

    persistence
        .set_tenant_database_ready(&record.id, "enc:abc:def")
        .await
        .unwrap();
    let fetched = persistence.get_tenant_database(&ws.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, "ready");
    assert_eq!(fetched.secret_ref.as_deref(), Some("enc:abc:def"));
    assert!(fetched.last_error.is_none());
}

#[tokio::test]
async fn test_single_active_domain_per_app() {
    let persistence = SqlitePersistence::in_memory().await.unwrap();
    let ws = workspace("acme");
    persistence.create_workspace(&ws).await.unwrap();

    let first = domain(&ws.id, "app1", "one.example.com");
    let second = domain(&ws.id, "app1", "two.example.com");
    persistence.insert_custom_domain(&first).await.unwrap();
    persistence.insert_custom_domain(&second).await.unwrap();

    persistence.activate_custom_domain(&first.id, "app1").await.unwrap();
    let active = persistence.get_active_domain_for_app("app1").await.unwrap().unwrap();
    assert_eq!(active.id, first.id);

    // Activating the second demotes the first in the same transaction.
    persistence.activate_custom_domain(&second.id, "app1").await.unwrap();

    let active = persistence.get_active_domain_for_app("app1").await.unwrap().unwrap();
    assert_eq!(active.id, second.id);

    let demoted = persistence.get_custom_domain(&first.id).await.unwrap().unwrap();
    assert_eq!(demoted.status, "verified");
}

#[tokio::test]
async fn test_domain_names_are_unique() {
    let persistence = SqlitePersistence::in_memory().await.unwrap();
    let ws = workspace("acme");
    persistence.create_workspace(&ws).await.unwrap();

    persistence
        .insert_custom_domain(&domain(&ws.id, "app1", "app.example.com"))
        .await
        .unwrap();
    let err = persistence
        .insert_custom_domain(&domain(&ws.id, "app2", "app.example.com"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");
}

#[tokio::test]
async fn test_one_open_schema_request_per_workspace() {
    let persistence = SqlitePersistence::in_memory().await.unwrap();
    let ws = workspace("acme");
    persistence.create_workspace(&ws).await.unwrap();

    let now = Utc::now();
    let request = SchemaMigrationRequestRecord {
        id: new_record_id(),
        workspace_id: ws.id.clone(),
        statements: "[\"CREATE TABLE t (id INT)\"]".to_string(),
        precheck: None,
        verify_sql: "SELECT 1".to_string(),
        status: SchemaRequestStatus::Pending.to_string(),
        reviewer_id: None,
        review_reason: None,
        error: None,
        created_at: now,
        updated_at: now,
    };
    persistence.insert_schema_request(&request).await.unwrap();

    let mut second = request.clone();
    second.id = new_record_id();
    let err = persistence.insert_schema_request(&second).await.unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");

    // A terminal request frees the slot.
    persistence
        .update_schema_request(
            &request.id,
            &SchemaRequestStatus::Rejected.to_string(),
            Some("rev1"),
            Some("not needed"),
            None,
        )
        .await
        .unwrap();
    persistence.insert_schema_request(&second).await.unwrap();
}

#[tokio::test]
async fn test_export_job_claim_is_exclusive() {
    let persistence = SqlitePersistence::in_memory().await.unwrap();
    let ws = workspace("acme");
    persistence.create_workspace(&ws).await.unwrap();

    let now = Utc::now();
    let job = ExportJobRecord {
        id: new_record_id(),
        workspace_id: ws.id.clone(),
        job_type: ExportJobType::ExecutionLogArchive.to_string(),
        status: ExportJobStatus::Pending.to_string(),
        range_start: Some(now - Duration::days(14)),
        range_end: Some(now - Duration::days(7)),
        file_path: None,
        file_name: None,
        file_size: None,
        checksum: None,
        error: None,
        expires_at: None,
        created_at: now,
        updated_at: now,
    };
    persistence.insert_export_job(&job).await.unwrap();

    assert!(persistence.mark_export_job_processing(&job.id).await.unwrap());
    // Second claim loses.
    assert!(!persistence.mark_export_job_processing(&job.id).await.unwrap());

    persistence
        .complete_export_job(&job.id, "/tmp/a.zip", "a.zip", 123, "deadbeef", None)
        .await
        .unwrap();
    let completed = persistence.get_export_job(&job.id).await.unwrap().unwrap();
    assert_eq!(completed.status, "completed");
    assert_eq!(completed.file_size, Some(123));

    let end = persistence
        .last_completed_range_end(&ws.id, &job.job_type)
        .await
        .unwrap();
    assert_eq!(end, job.range_end);
}

#[tokio::test]
async fn test_purge_workspace_removes_owned_rows() {
    let persistence = SqlitePersistence::in_memory().await.unwrap();
    let ws = workspace("acme");
    persistence.create_workspace(&ws).await.unwrap();
    persistence
        .insert_custom_domain(&domain(&ws.id, "app1", "app.example.com"))
        .await
        .unwrap();
    persistence
        .quota_reserve(&ws.id, "db_storage_gb", 1, 5)
        .await
        .unwrap();

    persistence.purge_workspace(&ws.id).await.unwrap();

    assert!(persistence.get_workspace(&ws.id).await.unwrap().is_none());
    assert!(
        persistence
            .get_custom_domain_by_name("app.example.com")
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(persistence.quota_usage(&ws.id, "db_storage_gb").await.unwrap(), (0, 0));
}

#[tokio::test]
async fn test_not_found_on_missing_rows() {
    let persistence = SqlitePersistence::in_memory().await.unwrap();

    let err = persistence
        .update_workspace_status("missing", "active")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));

    assert!(persistence.get_workspace("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_health_check() {
    let persistence = SqlitePersistence::in_memory().await.unwrap();
    assert!(persistence.health_check().await.unwrap());
}
