// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the retention sweep, archive worker, and replay
//! against in-memory persistence and a temp archive directory.

use std::sync::Arc;

use agentflow_archive::replay::{ReplayQuery, replay};
use agentflow_archive::retention::{RetentionConfig, RetentionScheduler};
use agentflow_archive::worker::{ArchiveWorker, ArchiveWorkerConfig};
use agentflow_core::events::{EventRecorderConfig, recorder};
use agentflow_core::persistence::{
    ExecutionRecord, NodeLogRecord, Persistence, RuntimeEventRecord, SqlitePersistence,
    WorkspaceRecord, new_record_id,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

struct Fixture {
    persistence: Arc<dyn Persistence>,
    retention: RetentionScheduler,
    worker: ArchiveWorker,
    _dir: tempfile::TempDir,
    base: std::path::PathBuf,
}

async fn fixture(config: RetentionConfig) -> Fixture {
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::in_memory().await.unwrap());
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().to_path_buf();

    let (events, _writer) = recorder(persistence.clone(), EventRecorderConfig::default());

    let retention = RetentionScheduler::new(persistence.clone(), events.clone(), config);
    let worker = ArchiveWorker::new(
        persistence.clone(),
        events,
        base.clone(),
        ArchiveWorkerConfig::default(),
    );

    Fixture {
        persistence,
        retention,
        worker,
        _dir: dir,
        base,
    }
}

async fn create_workspace(persistence: &Arc<dyn Persistence>, slug: &str) -> WorkspaceRecord {
    let now = Utc::now();
    let workspace = WorkspaceRecord {
        id: new_record_id(),
        owner_id: new_record_id(),
        slug: slug.to_string(),
        plan: "pro".to_string(),
        status: "active".to_string(),
        region: "eu-central".to_string(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    persistence.create_workspace(&workspace).await.unwrap();
    workspace
}

fn at(y: i32, m: u32, d: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, s / 3600, (s / 60) % 60, s % 60)
        .unwrap()
}

async fn seed_node_logs(
    persistence: &Arc<dyn Persistence>,
    workspace_id: &str,
    count: usize,
) {
    for i in 0..count {
        let created_at = at(2025, 1, 1 + (i % 7) as u32, (i / 7) as u32);
        persistence
            .insert_node_log(&NodeLogRecord {
                id: format!("log{:06}", i),
                execution_id: format!("exec{:04}", i / 5),
                workspace_id: workspace_id.to_string(),
                node_id: if i % 2 == 0 { "fetch" } else { "transform" }.to_string(),
                node_type: "http".to_string(),
                status: "completed".to_string(),
                message: Some(format!("node log {}", i)),
                payload: None,
                created_at,
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_archive_schedule_build_and_replay() {
    // Log archival on: retention 7 days, weekly windows, 1 day delay.
    let config = RetentionConfig {
        log_archive_enabled: true,
        execution_log_retention_days: 7,
        log_archive_batch_days: 7,
        log_archive_delay_days: 1,
        ..RetentionConfig::default()
    };
    let f = fixture(config).await;
    let workspace = create_workspace(&f.persistence, "acme").await;

    seed_node_logs(&f.persistence, &workspace.id, 500).await;
    f.persistence
        .insert_execution(&ExecutionRecord {
            id: "exec0001".to_string(),
            workspace_id: workspace.id.clone(),
            workflow_id: "wf1".to_string(),
            status: "completed".to_string(),
            triggered_by: Some("webhook".to_string()),
            started_at: Some(at(2025, 1, 2, 0)),
            finished_at: Some(at(2025, 1, 2, 90)),
            duration_ms: Some(90_000),
            error: None,
            created_at: at(2025, 1, 2, 0),
        })
        .await
        .unwrap();

    // Retention pass: one job covering [2025-01-01, 2025-01-08).
    let now = at(2025, 1, 20, 0);
    let report = f.retention.run_pass(now).await.unwrap();
    assert_eq!(report.scheduled_jobs, 1);
    assert_eq!(report.deleted_node_logs, 0, "archival replaces deletion");

    let job = f
        .persistence
        .active_export_job(&workspace.id, "execution_log_archive")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.range_start.unwrap(), at(2025, 1, 1, 0));
    assert_eq!(job.range_end.unwrap(), at(2025, 1, 8, 0));

    // A second pass schedules nothing while the job is active.
    let report = f.retention.run_pass(now).await.unwrap();
    assert_eq!(report.scheduled_jobs, 0);

    // Worker turns the job into a checksummed artifact.
    let processed = f.worker.tick().await.unwrap();
    assert_eq!(processed, 1);

    let done = f.persistence.get_export_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, "completed");
    let file_name = done.file_name.clone().unwrap();
    assert!(file_name.starts_with("acme-execution_log_archive-20250101-20250108-"));
    assert_eq!(done.checksum.as_ref().unwrap().len(), 64);

    let path = f.base.join("log-archives").join(&file_name);
    assert!(path.exists());
    assert_eq!(done.file_size.unwrap(), path.metadata().unwrap().len() as i64);

    // Replay: limit 100 offset 100 yields the second page and a cursor.
    let mut query = ReplayQuery::dataset("node_logs");
    query.limit = 100;
    query.offset = 100;
    let page = replay(&path, &query).unwrap();
    assert_eq!(page.entries.len(), 100);
    assert_eq!(page.next_offset, Some(200));

    // All 500 lines are in the artifact.
    let mut query = ReplayQuery::dataset("node_logs");
    query.limit = 1000;
    let page = replay(&path, &query).unwrap();
    assert_eq!(page.entries.len(), 500);
    assert_eq!(page.next_offset, None);

    let exec_page = replay(&path, &ReplayQuery::dataset("executions")).unwrap();
    assert_eq!(exec_page.entries.len(), 1);
    assert_eq!(exec_page.entries[0]["triggered_by"], "webhook");

    // Archived source rows are gone from the live tables.
    let remaining = f
        .persistence
        .node_logs_page(&workspace.id, at(2024, 1, 1, 0), now, 1000, 0)
        .await
        .unwrap();
    assert!(remaining.is_empty());

    // With the window completed, the next pass has nothing left to do.
    let report = f.retention.run_pass(now).await.unwrap();
    assert_eq!(report.scheduled_jobs, 0);
}

#[tokio::test]
async fn test_retention_deletes_when_archival_disabled() {
    let f = fixture(RetentionConfig {
        execution_log_retention_days: 7,
        ..RetentionConfig::default()
    })
    .await;
    let workspace = create_workspace(&f.persistence, "acme").await;

    seed_node_logs(&f.persistence, &workspace.id, 50).await;
    f.persistence
        .insert_runtime_events(&[RuntimeEventRecord {
            id: new_record_id(),
            workspace_id: Some(workspace.id.clone()),
            actor_id: None,
            severity: "info".to_string(),
            event_type: "domain.verified".to_string(),
            message: "old event".to_string(),
            metadata: None,
            trace_id: None,
            span_id: None,
            created_at: at(2025, 1, 3, 0),
        }])
        .await
        .unwrap();

    let report = f.retention.run_pass(at(2025, 2, 1, 0)).await.unwrap();
    assert_eq!(report.deleted_node_logs, 50);
    assert_eq!(report.deleted_events, 1);
    assert_eq!(report.scheduled_jobs, 0);
}

#[tokio::test]
async fn test_workspace_cold_storage_and_purge_timeline() {
    let f = fixture(RetentionConfig {
        deletion_grace_days: 7,
        cold_storage_days: 30,
        ..RetentionConfig::default()
    })
    .await;
    let workspace = create_workspace(&f.persistence, "doomed").await;

    let t0 = Utc::now() - Duration::days(8);
    f.persistence
        .soft_delete_workspace(&workspace.id, t0)
        .await
        .unwrap();

    // Past the grace window: cold storage plus an export job.
    let report = f.retention.run_pass(Utc::now()).await.unwrap();
    assert_eq!(report.cold_stored, 1);
    assert_eq!(report.purged, 0);

    let cold = f.persistence.get_workspace(&workspace.id).await.unwrap().unwrap();
    assert_eq!(cold.status, "cold_storage");

    let job = f
        .persistence
        .active_export_job(&workspace.id, "cold_storage")
        .await
        .unwrap()
        .unwrap();

    // The worker produces the cold-storage artifact.
    f.worker.tick().await.unwrap();
    let done = f.persistence.get_export_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, "completed");
    let artifact = std::path::PathBuf::from(done.file_path.clone().unwrap());
    assert!(artifact.exists());

    // A pass inside cold retention leaves the workspace alone.
    let report = f.retention.run_pass(t0 + Duration::days(20)).await.unwrap();
    assert_eq!(report.purged, 0);
    assert!(f.persistence.get_workspace(&workspace.id).await.unwrap().is_some());

    // Past grace + cold retention: hard delete plus artifact removal.
    let report = f.retention.run_pass(t0 + Duration::days(38)).await.unwrap();
    assert_eq!(report.purged, 1);
    assert!(f.persistence.get_workspace(&workspace.id).await.unwrap().is_none());
    assert!(!artifact.exists());
}

#[tokio::test]
async fn test_expired_archive_artifacts_are_removed() {
    let f = fixture(RetentionConfig::default()).await;
    let workspace = create_workspace(&f.persistence, "acme").await;

    // A completed archive job whose artifact has expired.
    let dir = f.base.join("log-archives");
    std::fs::create_dir_all(&dir).unwrap();
    let artifact = dir.join("acme-old.zip");
    std::fs::write(&artifact, b"zip bytes").unwrap();

    let now = Utc::now();
    let job = agentflow_core::persistence::ExportJobRecord {
        id: new_record_id(),
        workspace_id: workspace.id.clone(),
        job_type: "execution_log_archive".to_string(),
        status: "completed".to_string(),
        range_start: Some(now - Duration::days(200)),
        range_end: Some(now - Duration::days(193)),
        file_path: Some(artifact.to_string_lossy().into_owned()),
        file_name: Some("acme-old.zip".to_string()),
        file_size: Some(9),
        checksum: Some("0".repeat(64)),
        error: None,
        expires_at: Some(now - Duration::days(1)),
        created_at: now - Duration::days(200),
        updated_at: now - Duration::days(193),
    };
    f.persistence.insert_export_job(&job).await.unwrap();

    let report = f.retention.run_pass(now).await.unwrap();
    assert_eq!(report.expired_artifacts, 1);
    assert!(!artifact.exists());
    assert!(f.persistence.get_export_job(&job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_jobs_keep_source_rows() {
    // A job whose workspace slug resolves but whose artifact directory
    // cannot be created: point the base path at a file.
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::in_memory().await.unwrap());
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocked");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let (events, _writer) = recorder(persistence.clone(), EventRecorderConfig::default());
    let worker = ArchiveWorker::new(
        persistence.clone(),
        events,
        blocker,
        ArchiveWorkerConfig::default(),
    );

    let workspace = create_workspace(&persistence, "acme").await;
    seed_node_logs(&persistence, &workspace.id, 10).await;

    let now = Utc::now();
    let job = agentflow_core::persistence::ExportJobRecord {
        id: new_record_id(),
        workspace_id: workspace.id.clone(),
        job_type: "execution_log_archive".to_string(),
        status: "pending".to_string(),
        range_start: Some(at(2025, 1, 1, 0)),
        range_end: Some(at(2025, 1, 8, 0)),
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

    worker.tick().await.unwrap();

    let failed = persistence.get_export_job(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, "failed");
    assert!(failed.error.is_some());

    // Source rows survive the failure.
    let remaining = persistence
        .node_logs_page(&workspace.id, at(2024, 1, 1, 0), now, 100, 0)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 10);
}
