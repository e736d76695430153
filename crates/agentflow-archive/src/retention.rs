// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic retention sweep.
//!
//! One pass per interval, bounded by a pass timeout and driven by a
//! single `now` timestamp:
//!
//! 1. expired execution logs are deleted, or archive jobs scheduled
//!    when log archival is enabled
//! 2. expired audit logs, symmetrically
//! 3. stale anonymous sessions are deleted
//! 4. soft-deleted workspaces past the grace window move to cold
//!    storage and gain a cold-storage export job
//! 5. cold workspaces past cold retention are purged with their
//!    artifacts
//! 6. expired archive artifacts are deleted with their jobs
//!
//! Archive scheduling is idempotent per (workspace, type, window);
//! windows are day-aligned, `batch_days` wide, and only scheduled once
//! they are entirely older than the delay guard.

use std::sync::Arc;
use std::time::Duration;

use agentflow_core::events::{Event, EventRecorder};
use agentflow_core::persistence::{
    ExportJobRecord, ExportJobStatus, ExportJobType, Persistence, WorkspaceStatus, new_record_id,
};
use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Retention scheduler configuration.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Interval between passes.
    pub cleanup_interval: Duration,
    /// Upper bound for one pass.
    pub pass_timeout: Duration,
    /// Retention for executions, node logs, and runtime events.
    pub execution_log_retention_days: u32,
    /// Retention for audit logs.
    pub audit_log_retention_days: u32,
    /// Retention for anonymous sessions.
    pub anonymous_session_retention_days: u32,
    /// Days a soft-deleted workspace stays recoverable.
    pub deletion_grace_days: u32,
    /// Days a cold-storage workspace is kept before purge.
    pub cold_storage_days: u32,
    /// Archive instead of deleting logs.
    pub log_archive_enabled: bool,
    /// Width of one archive window in days.
    pub log_archive_batch_days: u32,
    /// Windows must be entirely older than this many days.
    pub log_archive_delay_days: u32,
    /// Artifact retention for completed archive jobs.
    pub archive_retention_days: u32,
    /// Earliest-row fallback windows start no earlier than
    /// `retention_days * this factor` before now.
    pub earliest_window_floor_factor: u32,
    /// Row/workspace batch limit per step.
    pub batch_limit: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(24 * 3600),
            pass_timeout: Duration::from_secs(10 * 60),
            execution_log_retention_days: 30,
            audit_log_retention_days: 180,
            anonymous_session_retention_days: 30,
            deletion_grace_days: 7,
            cold_storage_days: 30,
            log_archive_enabled: false,
            log_archive_batch_days: 7,
            log_archive_delay_days: 1,
            archive_retention_days: 90,
            earliest_window_floor_factor: 10,
            batch_limit: 100,
        }
    }
}

impl RetentionConfig {
    /// Derive the retention config from the control-plane config.
    pub fn from_core(config: &agentflow_core::Config) -> Self {
        Self {
            cleanup_interval: config.cleanup_interval,
            execution_log_retention_days: config.execution_log_retention_days,
            audit_log_retention_days: config.audit_log_retention_days,
            anonymous_session_retention_days: config.anonymous_session_retention_days,
            deletion_grace_days: config.deletion_grace_days,
            cold_storage_days: config.cold_storage_days,
            log_archive_enabled: config.log_archive_enabled,
            log_archive_batch_days: config.log_archive_batch_days,
            log_archive_delay_days: config.log_archive_delay_days,
            archive_retention_days: config.archive_retention_days,
            ..Self::default()
        }
    }
}

/// Counters from one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Runtime events deleted.
    pub deleted_events: u64,
    /// Node logs deleted.
    pub deleted_node_logs: u64,
    /// Audit logs deleted.
    pub deleted_audit_logs: u64,
    /// Anonymous sessions deleted.
    pub deleted_sessions: u64,
    /// Archive jobs scheduled.
    pub scheduled_jobs: u64,
    /// Workspaces moved to cold storage.
    pub cold_stored: u64,
    /// Workspaces purged.
    pub purged: u64,
    /// Expired artifacts deleted.
    pub expired_artifacts: u64,
}

fn days(n: u32) -> chrono::Duration {
    chrono::Duration::days(i64::from(n))
}

fn day_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(at.date_naive().and_time(NaiveTime::MIN), Utc)
}

/// Background retention scheduler.
pub struct RetentionScheduler {
    persistence: Arc<dyn Persistence>,
    recorder: EventRecorder,
    config: RetentionConfig,
    shutdown: Arc<Notify>,
}

impl RetentionScheduler {
    /// Create a new retention scheduler.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        recorder: EventRecorder,
        config: RetentionConfig,
    ) -> Self {
        Self {
            persistence,
            recorder,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the retention loop until shutdown.
    pub async fn run(&self) {
        info!(
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            log_archive_enabled = self.config.log_archive_enabled,
            "Retention scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.cleanup_interval) => {
                    let pass = tokio::time::timeout(self.config.pass_timeout, self.run_pass(Utc::now()));
                    match pass.await {
                        Ok(Ok(report)) => debug!(?report, "Retention pass completed"),
                        Ok(Err(e)) => error!(error = %e, "Retention pass failed"),
                        Err(_) => warn!(
                            timeout_secs = self.config.pass_timeout.as_secs(),
                            "Retention pass timed out"
                        ),
                    }
                }
            }
        }

        info!("Retention scheduler stopped");
    }

    /// Execute one retention pass with a single `now` timestamp.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();

        // 1. Execution logs: delete, or schedule archive windows.
        let exec_cutoff = now - days(self.config.execution_log_retention_days);
        if self.config.log_archive_enabled {
            let workspaces = self
                .persistence
                .workspaces_with_execution_logs_before(exec_cutoff, self.config.batch_limit)
                .await?;
            for workspace_id in workspaces {
                if self
                    .schedule_archive_job(&workspace_id, ExportJobType::ExecutionLogArchive, now)
                    .await?
                    .is_some()
                {
                    report.scheduled_jobs += 1;
                }
            }
        } else {
            report.deleted_events += self
                .persistence
                .delete_runtime_events_before(exec_cutoff)
                .await?;
            report.deleted_node_logs +=
                self.persistence.delete_node_logs_before(exec_cutoff).await?;
        }

        // 2. Audit logs, symmetrically.
        let audit_cutoff = now - days(self.config.audit_log_retention_days);
        if self.config.log_archive_enabled {
            let workspaces = self
                .persistence
                .workspaces_with_audit_logs_before(audit_cutoff, self.config.batch_limit)
                .await?;
            for workspace_id in workspaces {
                if self
                    .schedule_archive_job(&workspace_id, ExportJobType::AuditLogArchive, now)
                    .await?
                    .is_some()
                {
                    report.scheduled_jobs += 1;
                }
            }
        } else {
            report.deleted_audit_logs +=
                self.persistence.delete_audit_logs_before(audit_cutoff).await?;
        }

        // 3. Anonymous sessions.
        report.deleted_sessions += self
            .persistence
            .delete_anonymous_sessions_before(
                now - days(self.config.anonymous_session_retention_days),
            )
            .await?;

        // 4. Grace window ended: cold storage.
        let grace_cutoff = now - days(self.config.deletion_grace_days);
        for workspace in self
            .persistence
            .workspaces_deleted_before(grace_cutoff, self.config.batch_limit)
            .await?
        {
            self.persistence
                .update_workspace_status(&workspace.id, &WorkspaceStatus::ColdStorage.to_string())
                .await?;

            let cold_type = ExportJobType::ColdStorage.to_string();
            if self
                .persistence
                .active_export_job(&workspace.id, &cold_type)
                .await?
                .is_none()
            {
                let job = ExportJobRecord {
                    id: new_record_id(),
                    workspace_id: workspace.id.clone(),
                    job_type: cold_type,
                    status: ExportJobStatus::Pending.to_string(),
                    range_start: None,
                    range_end: None,
                    file_path: None,
                    file_name: None,
                    file_size: None,
                    checksum: None,
                    error: None,
                    expires_at: None,
                    created_at: now,
                    updated_at: now,
                };
                self.persistence.insert_export_job(&job).await?;
            }

            info!(workspace_id = %workspace.id, "Workspace moved to cold storage");
            self.recorder.record(Event::WorkspaceColdStored {
                workspace_id: workspace.id.clone(),
            });
            report.cold_stored += 1;
        }

        // 5. Cold retention ended: purge with artifacts.
        let purge_cutoff =
            now - days(self.config.deletion_grace_days + self.config.cold_storage_days);
        for workspace in self
            .persistence
            .workspaces_cold_before(purge_cutoff, self.config.batch_limit)
            .await?
        {
            for job in self
                .persistence
                .export_jobs_for_workspace(&workspace.id)
                .await?
            {
                if let Some(path) = &job.file_path
                    && let Err(e) = tokio::fs::remove_file(path).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %path, error = %e, "Failed to remove artifact during purge");
                }
            }

            self.persistence.purge_workspace(&workspace.id).await?;
            info!(workspace_id = %workspace.id, "Workspace purged");
            self.recorder.record(Event::WorkspacePurged {
                workspace_id: workspace.id.clone(),
            });
            report.purged += 1;
        }

        // 6. Expired archive artifacts.
        let archive_types = [
            ExportJobType::ExecutionLogArchive.to_string(),
            ExportJobType::AuditLogArchive.to_string(),
        ];
        let archive_types: Vec<&str> = archive_types.iter().map(|s| s.as_str()).collect();
        for job in self
            .persistence
            .expired_export_jobs(now, &archive_types, self.config.batch_limit)
            .await?
        {
            if let Some(path) = &job.file_path
                && let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path, error = %e, "Failed to remove expired artifact");
            }
            self.persistence.delete_export_job(&job.id).await?;
            report.expired_artifacts += 1;
        }

        self.recorder.record(Event::RetentionPassCompleted {
            deleted_events: report.deleted_events,
            deleted_node_logs: report.deleted_node_logs,
            deleted_audit_logs: report.deleted_audit_logs,
            deleted_sessions: report.deleted_sessions,
            scheduled_jobs: report.scheduled_jobs,
        });

        Ok(report)
    }

    /// Schedule the next archive window for (workspace, type), if due.
    ///
    /// Windows continue from the last completed `range_end`, or start at
    /// the earliest live row (floored) when nothing has completed yet. A
    /// window is only created once it is entirely older than both the
    /// retention cutoff and the delay guard, and no active or identical
    /// job exists.
    pub async fn schedule_archive_job(
        &self,
        workspace_id: &str,
        job_type: ExportJobType,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJobRecord>> {
        let type_name = job_type.to_string();

        if self
            .persistence
            .active_export_job(workspace_id, &type_name)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let retention_days = match job_type {
            ExportJobType::AuditLogArchive => self.config.audit_log_retention_days,
            _ => self.config.execution_log_retention_days,
        };

        let window_start = match self
            .persistence
            .last_completed_range_end(workspace_id, &type_name)
            .await?
        {
            Some(end) => end,
            None => {
                let earliest = match job_type {
                    ExportJobType::AuditLogArchive => {
                        self.persistence.earliest_audit_log_at(workspace_id).await?
                    }
                    _ => {
                        self.persistence
                            .earliest_execution_log_at(workspace_id)
                            .await?
                    }
                };
                let Some(earliest) = earliest else {
                    return Ok(None);
                };
                // Unbounded lookback for cold workspaces is floored.
                let floor =
                    now - days(retention_days * self.config.earliest_window_floor_factor);
                day_floor(earliest.max(floor))
            }
        };

        let window_end = day_floor(window_start) + days(self.config.log_archive_batch_days);
        let retention_cutoff = now - days(retention_days);
        let delay_cutoff = now - days(self.config.log_archive_delay_days);
        if window_end > retention_cutoff.min(delay_cutoff) {
            return Ok(None);
        }

        if self
            .persistence
            .export_job_for_window(workspace_id, &type_name, window_start, window_end)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let job = ExportJobRecord {
            id: new_record_id(),
            workspace_id: workspace_id.to_string(),
            job_type: type_name.clone(),
            status: ExportJobStatus::Pending.to_string(),
            range_start: Some(window_start),
            range_end: Some(window_end),
            file_path: None,
            file_name: None,
            file_size: None,
            checksum: None,
            error: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        self.persistence.insert_export_job(&job).await?;

        info!(
            workspace_id = %workspace_id,
            job_type = %type_name,
            range_start = %window_start,
            range_end = %window_end,
            "Archive job scheduled"
        );
        self.recorder.record(Event::ArchiveJobScheduled {
            workspace_id: workspace_id.to_string(),
            job_id: job.id.clone(),
            job_type: type_name,
            range_start: window_start,
            range_end: window_end,
        });

        Ok(Some(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RetentionConfig::default();
        assert_eq!(config.cleanup_interval, Duration::from_secs(86_400));
        assert_eq!(config.pass_timeout, Duration::from_secs(600));
        assert!(!config.log_archive_enabled);
        assert_eq!(config.log_archive_batch_days, 7);
        assert_eq!(config.earliest_window_floor_factor, 10);
    }

    #[test]
    fn test_day_floor() {
        let at = DateTime::parse_from_rfc3339("2025-01-03T17:45:12Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(day_floor(at).to_rfc3339(), "2025-01-03T00:00:00+00:00");
    }
}
