// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for the control plane.
//!
//! This module defines the persistence abstraction and backend
//! implementations. PostgreSQL is the production backend; SQLite backs
//! embedded deployments and the test suites. Statuses are persisted as
//! snake_case strings; the typed enums here are the in-memory form.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::Result;

/// Generate a new opaque 128-bit record identifier (32 hex chars).
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Workspace lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum WorkspaceStatus {
    /// Serving traffic.
    Active,
    /// Temporarily disabled by an operator.
    Suspended,
    /// Soft-deleted, inside the grace window.
    Deleted,
    /// Past the grace window; data exported to cold storage.
    ColdStorage,
}

/// Tenant database provisioning status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TenantDbStatus {
    /// Row created, provisioning not started.
    Pending,
    /// DDL sequence in flight.
    Provisioning,
    /// Accepting traffic.
    Ready,
    /// Provisioning gave up after retries.
    Failed,
}

/// Custom domain verification/activation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DomainStatus {
    /// Created, never verified.
    Pending,
    /// Verification lookup in flight.
    Verifying,
    /// DNS control proven.
    Verified,
    /// Serving traffic (at most one per app).
    Active,
    /// Last verification failed; retry may be scheduled.
    Failed,
    /// Terminal until explicit unblock.
    Blocked,
}

/// Certificate status for a custom domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SslStatus {
    /// No certificate requested yet.
    Pending,
    /// Issuance call in flight.
    Issuing,
    /// Certificate issued and unexpired.
    Issued,
    /// Last issuance attempt failed.
    Failed,
    /// Certificate past its expiry.
    Expired,
}

/// Export job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ExportJobStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Artifact written and checksummed.
    Completed,
    /// Worker gave up; source rows untouched.
    Failed,
}

/// Export job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ExportJobType {
    /// User-requested full export.
    UserExport,
    /// Workspace data exported before purge.
    ColdStorage,
    /// Execution + node log archive window.
    ExecutionLogArchive,
    /// Audit log archive window.
    AuditLogArchive,
}

/// Schema migration request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SchemaRequestStatus {
    /// Submitted, awaiting review.
    Pending,
    /// Approved by a reviewer.
    Approved,
    /// Rejected with a reason. Terminal.
    Rejected,
    /// Statements running.
    Executing,
    /// Executed and verified. Terminal.
    Succeeded,
    /// Execution or verification failed. Terminal.
    Failed,
}

impl SchemaRequestStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Succeeded | Self::Failed)
    }
}

/// Idempotency record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum IdempotencyStatus {
    /// Side effect in flight.
    Processing,
    /// Side effect committed; resource ref recorded.
    Completed,
    /// Side effect failed; the key may be retried.
    Failed,
}

/// Runtime event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EventSeverity {
    /// Diagnostic detail.
    Debug,
    /// Normal lifecycle transitions.
    Info,
    /// Degraded but recoverable.
    Warning,
    /// Failed operations.
    Error,
}

/// Workspace record from the persistence layer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkspaceRecord {
    /// Opaque workspace identifier (32 hex chars).
    pub id: String,
    /// Owning user identity.
    pub owner_id: String,
    /// Globally unique, case-folded URL segment.
    pub slug: String,
    /// Plan tag used for quota limits.
    pub plan: String,
    /// Lifecycle status (active, suspended, deleted, cold_storage).
    pub status: String,
    /// Deployment region tag.
    pub region: String,
    /// When the workspace was created.
    pub created_at: DateTime<Utc>,
    /// When the workspace was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the workspace was soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Tenant database record bound 1:1 to a workspace.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TenantDatabaseRecord {
    /// Opaque record identifier.
    pub id: String,
    /// Owning workspace (unique).
    pub workspace_id: String,
    /// Physical database name (`ws_<hex32>`).
    pub db_name: String,
    /// Database user (`wsu_<hex28>`).
    pub db_user: String,
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: i32,
    /// Encrypted password envelope (`enc:...`); the only path to the plaintext.
    pub secret_ref: Option<String>,
    /// Provisioning status (pending, provisioning, ready, failed).
    pub status: String,
    /// Error text from the last failed provisioning attempt.
    pub last_error: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Proposed DDL change bundle for a tenant database.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SchemaMigrationRequestRecord {
    /// Opaque record identifier.
    pub id: String,
    /// Target workspace.
    pub workspace_id: String,
    /// JSON array of parsed statements.
    pub statements: String,
    /// JSON precheck report produced at submit time.
    pub precheck: Option<String>,
    /// SELECT-shaped verification query run after execution.
    pub verify_sql: String,
    /// Request status (pending, approved, rejected, executing, succeeded, failed).
    pub status: String,
    /// Reviewer identity once approved or rejected.
    pub reviewer_id: Option<String>,
    /// Reviewer-supplied reason (required on rejection).
    pub review_reason: Option<String>,
    /// Error text from a failed execution.
    pub error: Option<String>,
    /// When the request was submitted.
    pub created_at: DateTime<Utc>,
    /// When the request was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Custom domain record.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CustomDomainRecord {
    /// Opaque record identifier.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Application the domain routes to, when app-scoped.
    pub app_id: Option<String>,
    /// Lower-cased, FQDN-normalized domain name (unique).
    pub domain: String,
    /// Opaque token proven via the DNS TXT record.
    pub verification_token: String,
    /// Domain status (pending, verifying, verified, active, failed, blocked).
    pub status: String,
    /// Certificate status (pending, issuing, issued, failed, expired).
    pub ssl_status: String,
    /// Consecutive failed verification attempts.
    pub verification_attempts: i32,
    /// Earliest next verification attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Consecutive failed issuance attempts.
    pub ssl_issue_attempts: i32,
    /// Earliest next issuance attempt.
    pub ssl_next_retry_at: Option<DateTime<Utc>>,
    /// When the current certificate was issued.
    pub ssl_issued_at: Option<DateTime<Utc>>,
    /// When the current certificate expires.
    pub ssl_expires_at: Option<DateTime<Utc>>,
    /// Why the domain was blocked.
    pub blocked_reason: Option<String>,
    /// Status to restore on unblock.
    pub prior_status: Option<String>,
    /// Operator-facing link attached after retry exhaustion.
    pub support_url: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Export job record; one row per archival artifact.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ExportJobRecord {
    /// Opaque record identifier.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Job type (user_export, cold_storage, execution_log_archive, audit_log_archive).
    pub job_type: String,
    /// Job status (pending, processing, completed, failed).
    pub status: String,
    /// Start of the half-open archive window.
    pub range_start: Option<DateTime<Utc>>,
    /// End of the half-open archive window.
    pub range_end: Option<DateTime<Utc>>,
    /// Absolute path of the artifact once completed.
    pub file_path: Option<String>,
    /// Artifact file name.
    pub file_name: Option<String>,
    /// Artifact size in bytes.
    pub file_size: Option<i64>,
    /// SHA-256 over the artifact.
    pub checksum: Option<String>,
    /// Error text from a failed run.
    pub error: Option<String>,
    /// When the artifact becomes eligible for deletion.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Idempotency ledger record.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    /// Opaque record identifier.
    pub id: String,
    /// Owning identity (caller).
    pub owner_id: String,
    /// The de-duplicated action (e.g. `db.provision`).
    pub action: String,
    /// Caller-chosen idempotency key.
    pub idem_key: String,
    /// Hash of the request body; a mismatch on replay is a conflict.
    pub request_hash: String,
    /// Record status (processing, completed, failed).
    pub status: String,
    /// Resource kind recorded on completion.
    pub resource_type: Option<String>,
    /// Resource identifier recorded on completion.
    pub resource_id: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Append-only runtime event record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RuntimeEventRecord {
    /// Opaque record identifier.
    pub id: String,
    /// Workspace the event belongs to.
    pub workspace_id: Option<String>,
    /// Acting identity, when attributable.
    pub actor_id: Option<String>,
    /// Severity (debug, info, warning, error).
    pub severity: String,
    /// Dotted event family (e.g. `db.provision_failed`).
    pub event_type: String,
    /// Human-readable message.
    pub message: String,
    /// Scrubbed metadata, serialized once at this boundary.
    pub metadata: Option<String>,
    /// Trace correlation id.
    pub trace_id: Option<String>,
    /// Span correlation id.
    pub span_id: Option<String>,
    /// When the event occurred.
    pub created_at: DateTime<Utc>,
}

/// Workflow execution metadata record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionRecord {
    /// Opaque record identifier.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Workflow definition reference.
    pub workflow_id: String,
    /// Execution status (running, completed, failed, cancelled).
    pub status: String,
    /// What triggered the execution.
    pub triggered_by: Option<String>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Execution duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Error message from a failed execution.
    pub error: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

/// Per-node execution log record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeLogRecord {
    /// Opaque record identifier.
    pub id: String,
    /// Execution the log belongs to.
    pub execution_id: String,
    /// Owning workspace (denormalized for retention sweeps).
    pub workspace_id: String,
    /// Workflow node identifier.
    pub node_id: String,
    /// Workflow node type.
    pub node_type: String,
    /// Node outcome (completed, failed, skipped).
    pub status: String,
    /// Log message.
    pub message: Option<String>,
    /// JSON payload captured for the node.
    pub payload: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

/// Audit log record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogRecord {
    /// Opaque record identifier.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Acting identity.
    pub actor_id: String,
    /// Audited action (e.g. `domain.create`).
    pub action: String,
    /// Resource kind the action touched.
    pub resource_type: Option<String>,
    /// Resource identifier the action touched.
    pub resource_id: Option<String>,
    /// JSON detail captured with the action.
    pub detail: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

/// Persistence interface used by the lifecycle engines and workers.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Workspaces
    // ------------------------------------------------------------------

    async fn create_workspace(&self, workspace: &WorkspaceRecord) -> Result<()>;

    async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>>;

    async fn get_workspace_by_slug(&self, slug: &str) -> Result<Option<WorkspaceRecord>>;

    async fn update_workspace_status(&self, id: &str, status: &str) -> Result<()>;

    /// Soft-delete a workspace: status becomes `deleted`, `deleted_at` is set.
    async fn soft_delete_workspace(&self, id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Soft-deleted workspaces whose grace window ended before `cutoff`.
    async fn workspaces_deleted_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WorkspaceRecord>>;

    /// Cold-storage workspaces deleted before `cutoff` (grace + cold retention).
    async fn workspaces_cold_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WorkspaceRecord>>;

    /// Hard-delete a workspace and every row it owns. The caller removes
    /// on-disk artifacts first.
    async fn purge_workspace(&self, id: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Tenant databases
    // ------------------------------------------------------------------

    async fn insert_tenant_database(&self, record: &TenantDatabaseRecord) -> Result<()>;

    async fn get_tenant_database(&self, workspace_id: &str)
    -> Result<Option<TenantDatabaseRecord>>;

    async fn update_tenant_database_status(
        &self,
        id: &str,
        status: &str,
        last_error: Option<&str>,
    ) -> Result<()>;

    /// Transition a tenant database to `ready` with its new secret envelope.
    async fn set_tenant_database_ready(&self, id: &str, secret_ref: &str) -> Result<()>;

    /// Replace the secret envelope after a credential rotation.
    async fn update_tenant_database_secret(&self, id: &str, secret_ref: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Schema migration requests
    // ------------------------------------------------------------------

    /// Insert a request; fails with `Conflict` while another non-terminal
    /// request exists for the workspace.
    async fn insert_schema_request(&self, record: &SchemaMigrationRequestRecord) -> Result<()>;

    async fn get_schema_request(&self, id: &str) -> Result<Option<SchemaMigrationRequestRecord>>;

    async fn get_open_schema_request(
        &self,
        workspace_id: &str,
    ) -> Result<Option<SchemaMigrationRequestRecord>>;

    async fn update_schema_request(
        &self,
        id: &str,
        status: &str,
        reviewer_id: Option<&str>,
        review_reason: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Custom domains
    // ------------------------------------------------------------------

    async fn insert_custom_domain(&self, record: &CustomDomainRecord) -> Result<()>;

    async fn get_custom_domain(&self, id: &str) -> Result<Option<CustomDomainRecord>>;

    async fn get_custom_domain_by_name(&self, domain: &str)
    -> Result<Option<CustomDomainRecord>>;

    async fn get_active_domain_for_app(&self, app_id: &str)
    -> Result<Option<CustomDomainRecord>>;

    /// Write back every mutable lifecycle field of a domain row.
    async fn update_custom_domain(&self, record: &CustomDomainRecord) -> Result<()>;

    /// Atomically demote the app's currently active domain to `verified`
    /// and promote `id` to `active`.
    async fn activate_custom_domain(&self, id: &str, app_id: &str) -> Result<()>;

    /// Failed domains with retries left whose `next_retry_at` has passed.
    async fn domains_due_for_verification(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<CustomDomainRecord>>;

    /// Domains whose certificate is renewable and due (expiry within the
    /// window, retry gate open).
    async fn domains_due_for_renewal(
        &self,
        now: DateTime<Utc>,
        window_end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CustomDomainRecord>>;

    /// Verified domains that never completed a first issuance, with
    /// retries left and the retry gate open.
    async fn domains_awaiting_issuance(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<CustomDomainRecord>>;

    // ------------------------------------------------------------------
    // Export jobs
    // ------------------------------------------------------------------

    async fn insert_export_job(&self, record: &ExportJobRecord) -> Result<()>;

    async fn get_export_job(&self, id: &str) -> Result<Option<ExportJobRecord>>;

    /// The pending-or-processing job for (workspace, type), if any.
    async fn active_export_job(
        &self,
        workspace_id: &str,
        job_type: &str,
    ) -> Result<Option<ExportJobRecord>>;

    /// An existing job matching (workspace, type, window) exactly.
    async fn export_job_for_window(
        &self,
        workspace_id: &str,
        job_type: &str,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Option<ExportJobRecord>>;

    /// `range_end` of the latest completed job for (workspace, type).
    async fn last_completed_range_end(
        &self,
        workspace_id: &str,
        job_type: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn pending_export_jobs(&self, limit: i64) -> Result<Vec<ExportJobRecord>>;

    /// Claim a pending job. Returns false when another worker won the race.
    async fn mark_export_job_processing(&self, id: &str) -> Result<bool>;

    async fn complete_export_job(
        &self,
        id: &str,
        file_path: &str,
        file_name: &str,
        file_size: i64,
        checksum: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn fail_export_job(&self, id: &str, error: &str) -> Result<()>;

    /// Completed archive-type jobs whose `expires_at` has passed.
    async fn expired_export_jobs(
        &self,
        now: DateTime<Utc>,
        job_types: &[&str],
        limit: i64,
    ) -> Result<Vec<ExportJobRecord>>;

    async fn delete_export_job(&self, id: &str) -> Result<()>;

    async fn export_jobs_for_workspace(&self, workspace_id: &str)
    -> Result<Vec<ExportJobRecord>>;

    // ------------------------------------------------------------------
    // Idempotency ledger
    // ------------------------------------------------------------------

    /// Insert a new ledger row in `processing`. A duplicate on the
    /// database-enforced unique key (owner, action, key) fails with
    /// `Conflict`; callers re-read and re-apply the ledger rules.
    async fn insert_idempotency_key(&self, record: &IdempotencyRecord) -> Result<()>;

    async fn get_idempotency_key(
        &self,
        owner_id: &str,
        action: &str,
        idem_key: &str,
    ) -> Result<Option<IdempotencyRecord>>;

    async fn update_idempotency_status(
        &self,
        id: &str,
        status: &str,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Runtime events
    // ------------------------------------------------------------------

    async fn insert_runtime_events(&self, events: &[RuntimeEventRecord]) -> Result<()>;

    async fn list_runtime_events(
        &self,
        workspace_id: &str,
        limit: i64,
    ) -> Result<Vec<RuntimeEventRecord>>;

    async fn delete_runtime_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn delete_runtime_events_in_range(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64>;

    // ------------------------------------------------------------------
    // Executions, node logs, audit logs, sessions
    // ------------------------------------------------------------------

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()>;

    async fn insert_node_log(&self, record: &NodeLogRecord) -> Result<()>;

    async fn insert_audit_log(&self, record: &AuditLogRecord) -> Result<()>;

    /// Executions created in `[start, end)`, oldest first.
    async fn executions_page(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>>;

    /// Node logs created in `[start, end)`, oldest first.
    async fn node_logs_page(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<NodeLogRecord>>;

    /// Audit logs created in `[start, end)`, oldest first.
    async fn audit_logs_page(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditLogRecord>>;

    async fn delete_executions_in_range(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64>;

    async fn delete_node_logs_in_range(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64>;

    async fn delete_audit_logs_in_range(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64>;

    async fn delete_node_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn delete_audit_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Earliest execution or node-log timestamp for a workspace.
    async fn earliest_execution_log_at(
        &self,
        workspace_id: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Earliest audit-log timestamp for a workspace.
    async fn earliest_audit_log_at(&self, workspace_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Workspaces that still have execution logs older than `cutoff`.
    async fn workspaces_with_execution_logs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>>;

    /// Workspaces that still have audit logs older than `cutoff`.
    async fn workspaces_with_audit_logs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>>;

    async fn insert_anonymous_session(
        &self,
        id: &str,
        fingerprint: &str,
        last_seen_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete_anonymous_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ------------------------------------------------------------------
    // Quota usage
    // ------------------------------------------------------------------

    /// Reserve `amount` in a dimension, guarded by `limit`. Returns false
    /// (without changes) when the reservation would exceed the limit.
    async fn quota_reserve(
        &self,
        workspace_id: &str,
        dimension: &str,
        amount: i64,
        limit: i64,
    ) -> Result<bool>;

    /// Move a prior reservation into consumed usage.
    async fn quota_consume(&self, workspace_id: &str, dimension: &str, amount: i64)
    -> Result<()>;

    /// Return a prior reservation.
    async fn quota_release(&self, workspace_id: &str, dimension: &str, amount: i64)
    -> Result<()>;

    /// Current (used, reserved) for a dimension.
    async fn quota_usage(&self, workspace_id: &str, dimension: &str) -> Result<(i64, i64)>;

    /// Database connectivity check.
    async fn health_check(&self) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        assert_eq!(WorkspaceStatus::ColdStorage.to_string(), "cold_storage");
        assert_eq!(
            "cold_storage".parse::<WorkspaceStatus>().unwrap(),
            WorkspaceStatus::ColdStorage
        );
        assert_eq!(ExportJobType::ExecutionLogArchive.to_string(), "execution_log_archive");
        assert_eq!(DomainStatus::Verifying.to_string(), "verifying");
        assert_eq!(SslStatus::Issuing.to_string(), "issuing");
        assert_eq!(TenantDbStatus::Provisioning.to_string(), "provisioning");
        assert_eq!(IdempotencyStatus::Processing.to_string(), "processing");
    }

    #[test]
    fn test_schema_status_terminality() {
        assert!(SchemaRequestStatus::Succeeded.is_terminal());
        assert!(SchemaRequestStatus::Rejected.is_terminal());
        assert!(SchemaRequestStatus::Failed.is_terminal());
        assert!(!SchemaRequestStatus::Pending.is_terminal());
        assert!(!SchemaRequestStatus::Approved.is_terminal());
        assert!(!SchemaRequestStatus::Executing.is_terminal());
    }

    #[test]
    fn test_new_record_id_shape() {
        let id = new_record_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
