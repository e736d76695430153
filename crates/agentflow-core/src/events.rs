// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Async, batched runtime event recorder.
//!
//! Lifecycle engines describe events as typed values; the recorder
//! scrubs sensitive metadata, serializes once, and hands the record to a
//! bounded channel. One writer task flushes at [`EventRecorderConfig::flush_max`]
//! events or every [`EventRecorderConfig::flush_interval`], whichever
//! comes first. Overflow drops the event: the recorder promises
//! at-most-once, not at-least-once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::persistence::{EventSeverity, Persistence, RuntimeEventRecord, new_record_id};

/// Metadata keys whose values are redacted before persistence.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "authorization",
    "api_key",
    "cookie",
];

/// Recorder configuration.
#[derive(Debug, Clone)]
pub struct EventRecorderConfig {
    /// Bounded channel capacity; sends beyond it are dropped.
    pub capacity: usize,
    /// Flush once this many events are buffered.
    pub flush_max: usize,
    /// Flush at least this often.
    pub flush_interval: Duration,
}

impl Default for EventRecorderConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            flush_max: 100,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Typed runtime events, one variant per family.
///
/// The metadata map is the persistence form only; it is built and
/// serialized exactly once, at the recorder boundary.
#[derive(Debug, Clone)]
pub enum Event {
    /// Tenant database provisioned and ready.
    DbProvisionSucceeded {
        /// Workspace that owns the database.
        workspace_id: String,
        /// Physical database name.
        db_name: String,
        /// Wall-clock duration of the provisioning sequence.
        duration_ms: u64,
    },
    /// Tenant database provisioning gave up after retries.
    DbProvisionFailed {
        /// Workspace that owns the database.
        workspace_id: String,
        /// Final error text.
        error: String,
        /// Wall-clock duration until the final failure.
        duration_ms: u64,
    },
    /// Tenant database credentials rotated.
    DbCredentialsRotated {
        /// Workspace that owns the database.
        workspace_id: String,
        /// Database user whose password changed.
        db_user: String,
    },
    /// Tenant database backup completed.
    DbBackupCompleted {
        /// Workspace that owns the database.
        workspace_id: String,
        /// Sibling backup database name.
        backup_db: String,
        /// Number of copied tables.
        table_count: usize,
    },
    /// Tenant database restored from a backup.
    DbRestoreCompleted {
        /// Workspace that owns the database.
        workspace_id: String,
        /// Sibling backup database restored from.
        backup_db: String,
    },
    /// Reviewed schema change executed.
    SchemaChangeExecuted {
        /// Workspace the change ran against.
        workspace_id: String,
        /// Schema migration request id.
        request_id: String,
        /// Whether verification passed.
        succeeded: bool,
    },
    /// Custom domain proved DNS control.
    DomainVerified {
        /// Owning workspace.
        workspace_id: String,
        /// The domain name.
        domain: String,
    },
    /// Custom domain verification failed.
    DomainVerificationFailed {
        /// Owning workspace.
        workspace_id: String,
        /// The domain name.
        domain: String,
        /// Consecutive failed attempts.
        attempts: i32,
        /// Earliest next attempt, when a retry is scheduled.
        next_retry_at: Option<DateTime<Utc>>,
    },
    /// Custom domain activated on the routing layer.
    DomainActivated {
        /// Owning workspace.
        workspace_id: String,
        /// The domain name.
        domain: String,
    },
    /// Custom domain rolled back to verified.
    DomainRolledBack {
        /// Owning workspace.
        workspace_id: String,
        /// The domain name.
        domain: String,
    },
    /// Custom domain blocked by an operator.
    DomainBlocked {
        /// Owning workspace.
        workspace_id: String,
        /// The domain name.
        domain: String,
        /// Operator-supplied reason.
        reason: String,
    },
    /// Certificate issued for a domain.
    SslIssued {
        /// Owning workspace.
        workspace_id: String,
        /// The domain name.
        domain: String,
        /// Certificate expiry.
        expires_at: DateTime<Utc>,
    },
    /// Certificate issuance failed.
    SslIssueFailed {
        /// Owning workspace.
        workspace_id: String,
        /// The domain name.
        domain: String,
        /// Consecutive failed attempts.
        attempts: i32,
        /// Issuer error text.
        error: String,
    },
    /// Archive job created by the retention scheduler.
    ArchiveJobScheduled {
        /// Owning workspace.
        workspace_id: String,
        /// Export job id.
        job_id: String,
        /// Export job type.
        job_type: String,
        /// Window start (inclusive).
        range_start: DateTime<Utc>,
        /// Window end (exclusive).
        range_end: DateTime<Utc>,
    },
    /// Archive job finished and its artifact was checksummed.
    ArchiveJobCompleted {
        /// Owning workspace.
        workspace_id: String,
        /// Export job id.
        job_id: String,
        /// Artifact file name.
        file_name: String,
        /// Artifact size in bytes.
        file_size: i64,
    },
    /// Archive job failed; source rows untouched.
    ArchiveJobFailed {
        /// Owning workspace.
        workspace_id: String,
        /// Export job id.
        job_id: String,
        /// Worker error text.
        error: String,
    },
    /// Workspace moved past the grace window into cold storage.
    WorkspaceColdStored {
        /// The workspace.
        workspace_id: String,
    },
    /// Workspace hard-deleted with its artifacts.
    WorkspacePurged {
        /// The workspace.
        workspace_id: String,
    },
    /// One retention pass finished.
    RetentionPassCompleted {
        /// Runtime events deleted.
        deleted_events: u64,
        /// Node logs deleted.
        deleted_node_logs: u64,
        /// Audit logs deleted.
        deleted_audit_logs: u64,
        /// Anonymous sessions deleted.
        deleted_sessions: u64,
        /// Archive jobs scheduled.
        scheduled_jobs: u64,
    },
}

impl Event {
    /// Dotted event family name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DbProvisionSucceeded { .. } => "db.provision_succeeded",
            Self::DbProvisionFailed { .. } => "db.provision_failed",
            Self::DbCredentialsRotated { .. } => "db.credentials_rotated",
            Self::DbBackupCompleted { .. } => "db.backup_completed",
            Self::DbRestoreCompleted { .. } => "db.restore_completed",
            Self::SchemaChangeExecuted { .. } => "db.schema_change_executed",
            Self::DomainVerified { .. } => "domain.verified",
            Self::DomainVerificationFailed { .. } => "domain.verification_failed",
            Self::DomainActivated { .. } => "domain.activated",
            Self::DomainRolledBack { .. } => "domain.rolled_back",
            Self::DomainBlocked { .. } => "domain.blocked",
            Self::SslIssued { .. } => "domain.ssl_issued",
            Self::SslIssueFailed { .. } => "domain.ssl_issue_failed",
            Self::ArchiveJobScheduled { .. } => "archive.job_scheduled",
            Self::ArchiveJobCompleted { .. } => "archive.job_completed",
            Self::ArchiveJobFailed { .. } => "archive.job_failed",
            Self::WorkspaceColdStored { .. } => "workspace.cold_stored",
            Self::WorkspacePurged { .. } => "workspace.purged",
            Self::RetentionPassCompleted { .. } => "retention.pass_completed",
        }
    }

    /// Event severity.
    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::DbProvisionFailed { .. }
            | Self::SslIssueFailed { .. }
            | Self::ArchiveJobFailed { .. } => EventSeverity::Error,
            Self::DomainVerificationFailed { .. } | Self::DomainBlocked { .. } => {
                EventSeverity::Warning
            }
            _ => EventSeverity::Info,
        }
    }

    /// Workspace the event belongs to, when scoped.
    pub fn workspace_id(&self) -> Option<&str> {
        match self {
            Self::DbProvisionSucceeded { workspace_id, .. }
            | Self::DbProvisionFailed { workspace_id, .. }
            | Self::DbCredentialsRotated { workspace_id, .. }
            | Self::DbBackupCompleted { workspace_id, .. }
            | Self::DbRestoreCompleted { workspace_id, .. }
            | Self::SchemaChangeExecuted { workspace_id, .. }
            | Self::DomainVerified { workspace_id, .. }
            | Self::DomainVerificationFailed { workspace_id, .. }
            | Self::DomainActivated { workspace_id, .. }
            | Self::DomainRolledBack { workspace_id, .. }
            | Self::DomainBlocked { workspace_id, .. }
            | Self::SslIssued { workspace_id, .. }
            | Self::SslIssueFailed { workspace_id, .. }
            | Self::ArchiveJobScheduled { workspace_id, .. }
            | Self::ArchiveJobCompleted { workspace_id, .. }
            | Self::ArchiveJobFailed { workspace_id, .. }
            | Self::WorkspaceColdStored { workspace_id }
            | Self::WorkspacePurged { workspace_id } => Some(workspace_id),
            Self::RetentionPassCompleted { .. } => None,
        }
    }

    /// Human-readable message.
    pub fn message(&self) -> String {
        match self {
            Self::DbProvisionSucceeded { db_name, .. } => {
                format!("Tenant database {} provisioned", db_name)
            }
            Self::DbProvisionFailed { error, .. } => {
                format!("Tenant database provisioning failed: {}", error)
            }
            Self::DbCredentialsRotated { db_user, .. } => {
                format!("Credentials rotated for {}", db_user)
            }
            Self::DbBackupCompleted {
                backup_db,
                table_count,
                ..
            } => format!("Backup {} created ({} tables)", backup_db, table_count),
            Self::DbRestoreCompleted { backup_db, .. } => {
                format!("Restored from backup {}", backup_db)
            }
            Self::SchemaChangeExecuted {
                request_id,
                succeeded,
                ..
            } => format!(
                "Schema change {} {}",
                request_id,
                if *succeeded { "succeeded" } else { "failed" }
            ),
            Self::DomainVerified { domain, .. } => format!("Domain {} verified", domain),
            Self::DomainVerificationFailed {
                domain, attempts, ..
            } => format!("Domain {} verification failed (attempt {})", domain, attempts),
            Self::DomainActivated { domain, .. } => format!("Domain {} activated", domain),
            Self::DomainRolledBack { domain, .. } => format!("Domain {} rolled back", domain),
            Self::DomainBlocked { domain, reason, .. } => {
                format!("Domain {} blocked: {}", domain, reason)
            }
            Self::SslIssued { domain, .. } => format!("Certificate issued for {}", domain),
            Self::SslIssueFailed {
                domain, attempts, ..
            } => format!(
                "Certificate issuance for {} failed (attempt {})",
                domain, attempts
            ),
            Self::ArchiveJobScheduled {
                job_type, job_id, ..
            } => format!("{} job {} scheduled", job_type, job_id),
            Self::ArchiveJobCompleted { file_name, .. } => {
                format!("Archive {} completed", file_name)
            }
            Self::ArchiveJobFailed { job_id, error, .. } => {
                format!("Archive job {} failed: {}", job_id, error)
            }
            Self::WorkspaceColdStored { .. } => "Workspace moved to cold storage".to_string(),
            Self::WorkspacePurged { .. } => "Workspace purged".to_string(),
            Self::RetentionPassCompleted { .. } => "Retention pass completed".to_string(),
        }
    }

    /// Metadata map for persistence.
    pub fn metadata(&self) -> serde_json::Value {
        match self {
            Self::DbProvisionSucceeded {
                db_name,
                duration_ms,
                ..
            } => serde_json::json!({ "db_name": db_name, "duration_ms": duration_ms }),
            Self::DbProvisionFailed {
                error, duration_ms, ..
            } => serde_json::json!({ "error": error, "duration_ms": duration_ms }),
            Self::DbCredentialsRotated { db_user, .. } => {
                serde_json::json!({ "db_user": db_user })
            }
            Self::DbBackupCompleted {
                backup_db,
                table_count,
                ..
            } => serde_json::json!({ "backup_db": backup_db, "table_count": table_count }),
            Self::DbRestoreCompleted { backup_db, .. } => {
                serde_json::json!({ "backup_db": backup_db })
            }
            Self::SchemaChangeExecuted {
                request_id,
                succeeded,
                ..
            } => serde_json::json!({ "request_id": request_id, "succeeded": succeeded }),
            Self::DomainVerified { domain, .. } => serde_json::json!({ "domain": domain }),
            Self::DomainVerificationFailed {
                domain,
                attempts,
                next_retry_at,
                ..
            } => serde_json::json!({
                "domain": domain,
                "attempts": attempts,
                "next_retry_at": next_retry_at.map(|t| t.to_rfc3339()),
            }),
            Self::DomainActivated { domain, .. } => serde_json::json!({ "domain": domain }),
            Self::DomainRolledBack { domain, .. } => serde_json::json!({ "domain": domain }),
            Self::DomainBlocked { domain, reason, .. } => {
                serde_json::json!({ "domain": domain, "reason": reason })
            }
            Self::SslIssued {
                domain, expires_at, ..
            } => serde_json::json!({ "domain": domain, "expires_at": expires_at.to_rfc3339() }),
            Self::SslIssueFailed {
                domain,
                attempts,
                error,
                ..
            } => serde_json::json!({ "domain": domain, "attempts": attempts, "error": error }),
            Self::ArchiveJobScheduled {
                job_id,
                job_type,
                range_start,
                range_end,
                ..
            } => serde_json::json!({
                "job_id": job_id,
                "job_type": job_type,
                "range_start": range_start.to_rfc3339(),
                "range_end": range_end.to_rfc3339(),
            }),
            Self::ArchiveJobCompleted {
                job_id,
                file_name,
                file_size,
                ..
            } => serde_json::json!({
                "job_id": job_id,
                "file_name": file_name,
                "file_size": file_size,
            }),
            Self::ArchiveJobFailed { job_id, error, .. } => {
                serde_json::json!({ "job_id": job_id, "error": error })
            }
            Self::WorkspaceColdStored { .. } | Self::WorkspacePurged { .. } => {
                serde_json::json!({})
            }
            Self::RetentionPassCompleted {
                deleted_events,
                deleted_node_logs,
                deleted_audit_logs,
                deleted_sessions,
                scheduled_jobs,
            } => serde_json::json!({
                "deleted_events": deleted_events,
                "deleted_node_logs": deleted_node_logs,
                "deleted_audit_logs": deleted_audit_logs,
                "deleted_sessions": deleted_sessions,
                "scheduled_jobs": scheduled_jobs,
            }),
        }
    }
}

/// Recursively redact values under sensitive keys.
pub fn scrub_metadata(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                let lowered = key.to_ascii_lowercase();
                if SENSITIVE_KEYS.iter().any(|s| lowered.contains(s)) {
                    *entry = serde_json::Value::String("[redacted]".to_string());
                } else {
                    scrub_metadata(entry);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                scrub_metadata(item);
            }
        }
        _ => {}
    }
}

/// Sending half of the event pipeline; cheap to clone.
#[derive(Clone)]
pub struct EventRecorder {
    tx: mpsc::Sender<RuntimeEventRecord>,
    dropped: Arc<AtomicU64>,
}

impl EventRecorder {
    /// Record an event with no attributable actor.
    pub fn record(&self, event: Event) {
        self.record_for(event, None);
    }

    /// Record an event attributed to an actor.
    pub fn record_for(&self, event: Event, actor_id: Option<&str>) {
        let mut metadata = event.metadata();
        scrub_metadata(&mut metadata);

        let record = RuntimeEventRecord {
            id: new_record_id(),
            workspace_id: event.workspace_id().map(|s| s.to_string()),
            actor_id: actor_id.map(|s| s.to_string()),
            severity: event.severity().to_string(),
            event_type: event.event_type().to_string(),
            message: event.message(),
            metadata: serde_json::to_string(&metadata).ok(),
            trace_id: None,
            span_id: None,
            created_at: Utc::now(),
        };

        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped on channel overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Writer half: owns the receiving end and flushes batches.
pub struct EventWriter {
    rx: mpsc::Receiver<RuntimeEventRecord>,
    persistence: Arc<dyn Persistence>,
    config: EventRecorderConfig,
    shutdown: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

impl EventWriter {
    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the writer loop until shutdown, draining on exit.
    pub async fn run(mut self) {
        info!(
            capacity = self.config.capacity,
            flush_max = self.config.flush_max,
            flush_interval_secs = self.config.flush_interval.as_secs(),
            "Event writer started"
        );

        let mut buffer: Vec<RuntimeEventRecord> = Vec::with_capacity(self.config.flush_max);
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stopping = false;

        while !stopping {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    stopping = true;
                }

                _ = ticker.tick() => {
                    Self::flush(&self.persistence, &mut buffer).await;
                    let dropped = self.dropped.swap(0, Ordering::Relaxed);
                    if dropped > 0 {
                        warn!(dropped = dropped, "Runtime events dropped on overflow");
                    }
                }

                received = self.rx.recv() => match received {
                    Some(record) => {
                        buffer.push(record);
                        if buffer.len() >= self.config.flush_max {
                            Self::flush(&self.persistence, &mut buffer).await;
                        }
                    }
                    None => {
                        stopping = true;
                    }
                },
            }
        }

        // Drain whatever is already queued, then stop.
        while let Ok(record) = self.rx.try_recv() {
            buffer.push(record);
            if buffer.len() >= self.config.flush_max {
                Self::flush(&self.persistence, &mut buffer).await;
            }
        }
        Self::flush(&self.persistence, &mut buffer).await;

        info!("Event writer stopped");
    }

    async fn flush(persistence: &Arc<dyn Persistence>, buffer: &mut Vec<RuntimeEventRecord>) {
        if buffer.is_empty() {
            return;
        }

        let count = buffer.len();
        if let Err(e) = persistence.insert_runtime_events(buffer).await {
            error!(error = %e, count = count, "Failed to flush runtime events");
        } else {
            debug!(count = count, "Flushed runtime events");
        }
        buffer.clear();
    }
}

/// Build a connected recorder/writer pair.
pub fn recorder(
    persistence: Arc<dyn Persistence>,
    config: EventRecorderConfig,
) -> (EventRecorder, EventWriter) {
    let (tx, rx) = mpsc::channel(config.capacity);
    let dropped = Arc::new(AtomicU64::new(0));

    let recorder = EventRecorder {
        tx,
        dropped: dropped.clone(),
    };
    let writer = EventWriter {
        rx,
        persistence,
        config,
        shutdown: Arc::new(Notify::new()),
        dropped,
    };

    (recorder, writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EventRecorderConfig::default();
        assert_eq!(config.capacity, 1000);
        assert_eq!(config.flush_max, 100);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_event_types() {
        let event = Event::DbProvisionFailed {
            workspace_id: "w1".to_string(),
            error: "boom".to_string(),
            duration_ms: 1200,
        };
        assert_eq!(event.event_type(), "db.provision_failed");
        assert_eq!(event.severity(), EventSeverity::Error);
        assert_eq!(event.workspace_id(), Some("w1"));
    }

    #[test]
    fn test_retention_event_has_no_workspace() {
        let event = Event::RetentionPassCompleted {
            deleted_events: 1,
            deleted_node_logs: 2,
            deleted_audit_logs: 3,
            deleted_sessions: 4,
            scheduled_jobs: 5,
        };
        assert!(event.workspace_id().is_none());
        assert_eq!(event.severity(), EventSeverity::Info);
    }

    #[test]
    fn test_scrub_redacts_nested_sensitive_keys() {
        let mut value = serde_json::json!({
            "db_name": "ws_abc",
            "password": "hunter2",
            "nested": {
                "api_key": "xyz",
                "Authorization": "Bearer t",
                "kept": 1,
            },
            "list": [{"client_secret": "s"}],
        });
        scrub_metadata(&mut value);

        assert_eq!(value["db_name"], "ws_abc");
        assert_eq!(value["password"], "[redacted]");
        assert_eq!(value["nested"]["api_key"], "[redacted]");
        assert_eq!(value["nested"]["Authorization"], "[redacted]");
        assert_eq!(value["nested"]["kept"], 1);
        assert_eq!(value["list"][0]["client_secret"], "[redacted]");
    }
}
