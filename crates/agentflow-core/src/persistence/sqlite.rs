// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Backs embedded deployments and the test suites. Timestamps are stored
//! as RFC 3339 text; comparisons stay consistent because every value is
//! written by the same encoder.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{CoreError, Result, is_unique_violation};

use super::{
    AuditLogRecord, CustomDomainRecord, ExecutionRecord, ExportJobRecord, IdempotencyRecord,
    NodeLogRecord, Persistence, RuntimeEventRecord, SchemaMigrationRequestRecord,
    TenantDatabaseRecord, WorkspaceRecord,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then
    /// runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::transient("connect", e.to_string()))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::transient("migrate", e.to_string()))?;

        Ok(Self { pool })
    }

    /// Create an in-memory persistence with the schema applied.
    ///
    /// The pool is pinned to a single connection so the database outlives
    /// individual acquires.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::transient("connect", e.to_string()))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::transient("migrate", e.to_string()))?;

        Ok(Self { pool })
    }

    fn ensure_found(affected: u64, resource: &str, id: &str) -> Result<()> {
        if affected == 0 {
            return Err(CoreError::not_found(resource, id));
        }
        Ok(())
    }
}

fn conflict_on_unique(err: sqlx::Error, resource: &str, message: &str) -> CoreError {
    if is_unique_violation(&err) {
        CoreError::Conflict {
            resource: resource.to_string(),
            message: message.to_string(),
        }
    } else {
        err.into()
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_workspace(&self, workspace: &WorkspaceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, owner_id, slug, plan, status, region,
                                    created_at, updated_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&workspace.id)
        .bind(&workspace.owner_id)
        .bind(&workspace.slug)
        .bind(&workspace.plan)
        .bind(&workspace.status)
        .bind(&workspace.region)
        .bind(workspace.created_at)
        .bind(workspace.updated_at)
        .bind(workspace.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "workspace", "slug already taken"))?;

        Ok(())
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>> {
        let record =
            sqlx::query_as::<_, WorkspaceRecord>("SELECT * FROM workspaces WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    async fn get_workspace_by_slug(&self, slug: &str) -> Result<Option<WorkspaceRecord>> {
        let record =
            sqlx::query_as::<_, WorkspaceRecord>("SELECT * FROM workspaces WHERE slug = ?")
                .bind(slug)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    async fn update_workspace_status(&self, id: &str, status: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE workspaces SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;

        Self::ensure_found(result.rows_affected(), "workspace", id)
    }

    async fn soft_delete_workspace(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET status = 'deleted', deleted_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "workspace", id)
    }

    async fn workspaces_deleted_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WorkspaceRecord>> {
        let records = sqlx::query_as::<_, WorkspaceRecord>(
            r#"
            SELECT * FROM workspaces
            WHERE status = 'deleted' AND deleted_at < ?
            ORDER BY deleted_at ASC
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn workspaces_cold_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WorkspaceRecord>> {
        let records = sqlx::query_as::<_, WorkspaceRecord>(
            r#"
            SELECT * FROM workspaces
            WHERE status = 'cold_storage' AND deleted_at < ?
            ORDER BY deleted_at ASC
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn purge_workspace(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for table in [
            "tenant_databases",
            "schema_migration_requests",
            "custom_domains",
            "export_jobs",
            "runtime_events",
            "node_logs",
            "executions",
            "audit_logs",
            "quota_usage",
        ] {
            let sql = format!("DELETE FROM {} WHERE workspace_id = ?", table);
            sqlx::query(&sql).bind(id).execute(&mut *tx).await?;
        }

        sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_tenant_database(&self, record: &TenantDatabaseRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_databases (id, workspace_id, db_name, db_user, host, port,
                                          secret_ref, status, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.workspace_id)
        .bind(&record.db_name)
        .bind(&record.db_user)
        .bind(&record.host)
        .bind(record.port)
        .bind(&record.secret_ref)
        .bind(&record.status)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, "tenant_database", "workspace already has a tenant database")
        })?;

        Ok(())
    }

    async fn get_tenant_database(
        &self,
        workspace_id: &str,
    ) -> Result<Option<TenantDatabaseRecord>> {
        let record = sqlx::query_as::<_, TenantDatabaseRecord>(
            "SELECT * FROM tenant_databases WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_tenant_database_status(
        &self,
        id: &str,
        status: &str,
        last_error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_databases
            SET status = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(last_error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "tenant_database", id)
    }

    async fn set_tenant_database_ready(&self, id: &str, secret_ref: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_databases
            SET status = 'ready', secret_ref = ?, last_error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(secret_ref)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "tenant_database", id)
    }

    async fn update_tenant_database_secret(&self, id: &str, secret_ref: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenant_databases SET secret_ref = ?, updated_at = ? WHERE id = ?",
        )
        .bind(secret_ref)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "tenant_database", id)
    }

    async fn insert_schema_request(&self, record: &SchemaMigrationRequestRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schema_migration_requests
                (id, workspace_id, statements, precheck, verify_sql, status,
                 reviewer_id, review_reason, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.workspace_id)
        .bind(&record.statements)
        .bind(&record.precheck)
        .bind(&record.verify_sql)
        .bind(&record.status)
        .bind(&record.reviewer_id)
        .bind(&record.review_reason)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(
                e,
                "schema_migration_request",
                "a non-terminal request already exists for this workspace",
            )
        })?;

        Ok(())
    }

    async fn get_schema_request(&self, id: &str) -> Result<Option<SchemaMigrationRequestRecord>> {
        let record = sqlx::query_as::<_, SchemaMigrationRequestRecord>(
            "SELECT * FROM schema_migration_requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_open_schema_request(
        &self,
        workspace_id: &str,
    ) -> Result<Option<SchemaMigrationRequestRecord>> {
        let record = sqlx::query_as::<_, SchemaMigrationRequestRecord>(
            r#"
            SELECT * FROM schema_migration_requests
            WHERE workspace_id = ? AND status IN ('pending', 'approved', 'executing')
            LIMIT 1
            "#,
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_schema_request(
        &self,
        id: &str,
        status: &str,
        reviewer_id: Option<&str>,
        review_reason: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE schema_migration_requests
            SET status = ?,
                reviewer_id = COALESCE(?, reviewer_id),
                review_reason = COALESCE(?, review_reason),
                error = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(reviewer_id)
        .bind(review_reason)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "schema_migration_request", id)
    }

    async fn insert_custom_domain(&self, record: &CustomDomainRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO custom_domains
                (id, workspace_id, app_id, domain, verification_token, status, ssl_status,
                 verification_attempts, next_retry_at, ssl_issue_attempts, ssl_next_retry_at,
                 ssl_issued_at, ssl_expires_at, blocked_reason, prior_status, support_url,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.workspace_id)
        .bind(&record.app_id)
        .bind(&record.domain)
        .bind(&record.verification_token)
        .bind(&record.status)
        .bind(&record.ssl_status)
        .bind(record.verification_attempts)
        .bind(record.next_retry_at)
        .bind(record.ssl_issue_attempts)
        .bind(record.ssl_next_retry_at)
        .bind(record.ssl_issued_at)
        .bind(record.ssl_expires_at)
        .bind(&record.blocked_reason)
        .bind(&record.prior_status)
        .bind(&record.support_url)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "custom_domain", "domain already exists"))?;

        Ok(())
    }

    async fn get_custom_domain(&self, id: &str) -> Result<Option<CustomDomainRecord>> {
        let record = sqlx::query_as::<_, CustomDomainRecord>(
            "SELECT * FROM custom_domains WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_custom_domain_by_name(
        &self,
        domain: &str,
    ) -> Result<Option<CustomDomainRecord>> {
        let record = sqlx::query_as::<_, CustomDomainRecord>(
            "SELECT * FROM custom_domains WHERE domain = ?",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_active_domain_for_app(
        &self,
        app_id: &str,
    ) -> Result<Option<CustomDomainRecord>> {
        let record = sqlx::query_as::<_, CustomDomainRecord>(
            "SELECT * FROM custom_domains WHERE app_id = ? AND status = 'active' LIMIT 1",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_custom_domain(&self, record: &CustomDomainRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE custom_domains
            SET status = ?, ssl_status = ?, verification_attempts = ?, next_retry_at = ?,
                ssl_issue_attempts = ?, ssl_next_retry_at = ?, ssl_issued_at = ?,
                ssl_expires_at = ?, blocked_reason = ?, prior_status = ?,
                support_url = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.status)
        .bind(&record.ssl_status)
        .bind(record.verification_attempts)
        .bind(record.next_retry_at)
        .bind(record.ssl_issue_attempts)
        .bind(record.ssl_next_retry_at)
        .bind(record.ssl_issued_at)
        .bind(record.ssl_expires_at)
        .bind(&record.blocked_reason)
        .bind(&record.prior_status)
        .bind(&record.support_url)
        .bind(Utc::now())
        .bind(&record.id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "custom_domain", &record.id)
    }

    async fn activate_custom_domain(&self, id: &str, app_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE custom_domains
            SET status = 'verified', updated_at = ?
            WHERE app_id = ? AND status = 'active' AND id <> ?
            "#,
        )
        .bind(now)
        .bind(app_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE custom_domains SET status = 'active', updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("custom_domain", id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn domains_due_for_verification(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<CustomDomainRecord>> {
        let records = sqlx::query_as::<_, CustomDomainRecord>(
            r#"
            SELECT * FROM custom_domains
            WHERE status = 'failed'
              AND verification_attempts > 0
              AND verification_attempts < ?
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= ?
            ORDER BY next_retry_at ASC
            LIMIT ?
            "#,
        )
        .bind(max_attempts)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn domains_due_for_renewal(
        &self,
        now: DateTime<Utc>,
        window_end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CustomDomainRecord>> {
        let records = sqlx::query_as::<_, CustomDomainRecord>(
            r#"
            SELECT * FROM custom_domains
            WHERE status IN ('verified', 'active')
              AND ssl_status IN ('issued', 'failed')
              AND ssl_expires_at IS NOT NULL
              AND ssl_expires_at <= ?
              AND (ssl_next_retry_at IS NULL OR ssl_next_retry_at <= ?)
            ORDER BY ssl_expires_at ASC
            LIMIT ?
            "#,
        )
        .bind(window_end)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn domains_awaiting_issuance(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<CustomDomainRecord>> {
        let records = sqlx::query_as::<_, CustomDomainRecord>(
            r#"
            SELECT * FROM custom_domains
            WHERE status IN ('verified', 'active')
              AND ssl_status IN ('pending', 'failed')
              AND ssl_expires_at IS NULL
              AND ssl_issue_attempts < ?
              AND (ssl_next_retry_at IS NULL OR ssl_next_retry_at <= ?)
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(max_attempts)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_export_job(&self, record: &ExportJobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO export_jobs
                (id, workspace_id, job_type, status, range_start, range_end, file_path,
                 file_name, file_size, checksum, error, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.workspace_id)
        .bind(&record.job_type)
        .bind(&record.status)
        .bind(record.range_start)
        .bind(record.range_end)
        .bind(&record.file_path)
        .bind(&record.file_name)
        .bind(record.file_size)
        .bind(&record.checksum)
        .bind(&record.error)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_export_job(&self, id: &str) -> Result<Option<ExportJobRecord>> {
        let record =
            sqlx::query_as::<_, ExportJobRecord>("SELECT * FROM export_jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    async fn active_export_job(
        &self,
        workspace_id: &str,
        job_type: &str,
    ) -> Result<Option<ExportJobRecord>> {
        let record = sqlx::query_as::<_, ExportJobRecord>(
            r#"
            SELECT * FROM export_jobs
            WHERE workspace_id = ? AND job_type = ? AND status IN ('pending', 'processing')
            LIMIT 1
            "#,
        )
        .bind(workspace_id)
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn export_job_for_window(
        &self,
        workspace_id: &str,
        job_type: &str,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Option<ExportJobRecord>> {
        let record = sqlx::query_as::<_, ExportJobRecord>(
            r#"
            SELECT * FROM export_jobs
            WHERE workspace_id = ? AND job_type = ?
              AND range_start = ? AND range_end = ?
            LIMIT 1
            "#,
        )
        .bind(workspace_id)
        .bind(job_type)
        .bind(range_start)
        .bind(range_end)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn last_completed_range_end(
        &self,
        workspace_id: &str,
        job_type: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let end: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            r#"
            SELECT MAX(range_end) FROM export_jobs
            WHERE workspace_id = ? AND job_type = ? AND status = 'completed'
            "#,
        )
        .bind(workspace_id)
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(end.and_then(|(e,)| e))
    }

    async fn pending_export_jobs(&self, limit: i64) -> Result<Vec<ExportJobRecord>> {
        let records = sqlx::query_as::<_, ExportJobRecord>(
            r#"
            SELECT * FROM export_jobs
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn mark_export_job_processing(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'processing', updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_export_job(
        &self,
        id: &str,
        file_path: &str,
        file_name: &str,
        file_size: i64,
        checksum: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'completed', file_path = ?, file_name = ?, file_size = ?,
                checksum = ?, expires_at = ?, error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(file_path)
        .bind(file_name)
        .bind(file_size)
        .bind(checksum)
        .bind(expires_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "export_job", id)
    }

    async fn fail_export_job(&self, id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE export_jobs SET status = 'failed', error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "export_job", id)
    }

    async fn expired_export_jobs(
        &self,
        now: DateTime<Utc>,
        job_types: &[&str],
        limit: i64,
    ) -> Result<Vec<ExportJobRecord>> {
        if job_types.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; job_types.len()].join(", ");
        let sql = format!(
            r#"
            SELECT * FROM export_jobs
            WHERE status = 'completed'
              AND job_type IN ({})
              AND expires_at IS NOT NULL
              AND expires_at < ?
            ORDER BY expires_at ASC
            LIMIT ?
            "#,
            placeholders
        );

        let mut query = sqlx::query_as::<_, ExportJobRecord>(&sql);
        for job_type in job_types {
            query = query.bind(*job_type);
        }
        let records = query.bind(now).bind(limit).fetch_all(&self.pool).await?;

        Ok(records)
    }

    async fn delete_export_job(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM export_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn export_jobs_for_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<ExportJobRecord>> {
        let records = sqlx::query_as::<_, ExportJobRecord>(
            "SELECT * FROM export_jobs WHERE workspace_id = ? ORDER BY created_at ASC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_idempotency_key(&self, record: &IdempotencyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys
                (id, owner_id, action, idem_key, request_hash, status, resource_type,
                 resource_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.owner_id)
        .bind(&record.action)
        .bind(&record.idem_key)
        .bind(&record.request_hash)
        .bind(&record.status)
        .bind(&record.resource_type)
        .bind(&record.resource_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "idempotency_key", "key already exists"))?;

        Ok(())
    }

    async fn get_idempotency_key(
        &self,
        owner_id: &str,
        action: &str,
        idem_key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT * FROM idempotency_keys
            WHERE owner_id = ? AND action = ? AND idem_key = ?
            "#,
        )
        .bind(owner_id)
        .bind(action)
        .bind(idem_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_idempotency_status(
        &self,
        id: &str,
        status: &str,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = ?, resource_type = ?, resource_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(resource_type)
        .bind(resource_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "idempotency_key", id)
    }

    async fn insert_runtime_events(&self, events: &[RuntimeEventRecord]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO runtime_events
                    (id, workspace_id, actor_id, severity, event_type, message, metadata,
                     trace_id, span_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.id)
            .bind(&event.workspace_id)
            .bind(&event.actor_id)
            .bind(&event.severity)
            .bind(&event.event_type)
            .bind(&event.message)
            .bind(&event.metadata)
            .bind(&event.trace_id)
            .bind(&event.span_id)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_runtime_events(
        &self,
        workspace_id: &str,
        limit: i64,
    ) -> Result<Vec<RuntimeEventRecord>> {
        let records = sqlx::query_as::<_, RuntimeEventRecord>(
            r#"
            SELECT * FROM runtime_events
            WHERE workspace_id = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_runtime_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM runtime_events WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_runtime_events_in_range(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM runtime_events
            WHERE workspace_id = ? AND created_at >= ? AND created_at < ?
            "#,
        )
        .bind(workspace_id)
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, workspace_id, workflow_id, status, triggered_by, started_at, finished_at,
                 duration_ms, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.workspace_id)
        .bind(&record.workflow_id)
        .bind(&record.status)
        .bind(&record.triggered_by)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.duration_ms)
        .bind(&record.error)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_node_log(&self, record: &NodeLogRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_logs
                (id, execution_id, workspace_id, node_id, node_type, status, message,
                 payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.execution_id)
        .bind(&record.workspace_id)
        .bind(&record.node_id)
        .bind(&record.node_type)
        .bind(&record.status)
        .bind(&record.message)
        .bind(&record.payload)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_audit_log(&self, record: &AuditLogRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs
                (id, workspace_id, actor_id, action, resource_type, resource_id, detail,
                 created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.workspace_id)
        .bind(&record.actor_id)
        .bind(&record.action)
        .bind(&record.resource_type)
        .bind(&record.resource_id)
        .bind(&record.detail)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn executions_page(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        let records = sqlx::query_as::<_, ExecutionRecord>(
            r#"
            SELECT * FROM executions
            WHERE workspace_id = ? AND created_at >= ? AND created_at < ?
            ORDER BY created_at ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(workspace_id)
        .bind(start)
        .bind(end)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn node_logs_page(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<NodeLogRecord>> {
        let records = sqlx::query_as::<_, NodeLogRecord>(
            r#"
            SELECT * FROM node_logs
            WHERE workspace_id = ? AND created_at >= ? AND created_at < ?
            ORDER BY created_at ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(workspace_id)
        .bind(start)
        .bind(end)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn audit_logs_page(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditLogRecord>> {
        let records = sqlx::query_as::<_, AuditLogRecord>(
            r#"
            SELECT * FROM audit_logs
            WHERE workspace_id = ? AND created_at >= ? AND created_at < ?
            ORDER BY created_at ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(workspace_id)
        .bind(start)
        .bind(end)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_executions_in_range(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM executions
            WHERE workspace_id = ? AND created_at >= ? AND created_at < ?
            "#,
        )
        .bind(workspace_id)
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_node_logs_in_range(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM node_logs
            WHERE workspace_id = ? AND created_at >= ? AND created_at < ?
            "#,
        )
        .bind(workspace_id)
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_audit_logs_in_range(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM audit_logs
            WHERE workspace_id = ? AND created_at >= ? AND created_at < ?
            "#,
        )
        .bind(workspace_id)
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_node_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM node_logs WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_audit_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn earliest_execution_log_at(
        &self,
        workspace_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let earliest: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            r#"
            SELECT MIN(t) FROM (
                SELECT MIN(created_at) AS t FROM executions WHERE workspace_id = ?
                UNION ALL
                SELECT MIN(created_at) AS t FROM node_logs WHERE workspace_id = ?
            )
            "#,
        )
        .bind(workspace_id)
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(earliest.and_then(|(e,)| e))
    }

    async fn earliest_audit_log_at(&self, workspace_id: &str) -> Result<Option<DateTime<Utc>>> {
        let earliest: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "SELECT MIN(created_at) FROM audit_logs WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(earliest.and_then(|(e,)| e))
    }

    async fn workspaces_with_execution_logs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT workspace_id FROM node_logs WHERE created_at < ?
            UNION
            SELECT workspace_id FROM executions WHERE created_at < ?
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn workspaces_with_audit_logs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT workspace_id FROM audit_logs
            WHERE created_at < ?
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn insert_anonymous_session(
        &self,
        id: &str,
        fingerprint: &str,
        last_seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO anonymous_sessions (id, fingerprint, last_seen_at, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(fingerprint)
        .bind(last_seen_at)
        .bind(last_seen_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_anonymous_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM anonymous_sessions WHERE last_seen_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn quota_reserve(
        &self,
        workspace_id: &str,
        dimension: &str,
        amount: i64,
        limit: i64,
    ) -> Result<bool> {
        sqlx::query(
            r#"
            INSERT INTO quota_usage (workspace_id, dimension, used, reserved, updated_at)
            VALUES (?, ?, 0, 0, ?)
            ON CONFLICT (workspace_id, dimension) DO NOTHING
            "#,
        )
        .bind(workspace_id)
        .bind(dimension)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE quota_usage
            SET reserved = reserved + ?, updated_at = ?
            WHERE workspace_id = ? AND dimension = ?
              AND used + reserved + ? <= ?
            "#,
        )
        .bind(amount)
        .bind(Utc::now())
        .bind(workspace_id)
        .bind(dimension)
        .bind(amount)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn quota_consume(
        &self,
        workspace_id: &str,
        dimension: &str,
        amount: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE quota_usage
            SET used = used + ?, reserved = reserved - ?, updated_at = ?
            WHERE workspace_id = ? AND dimension = ? AND reserved >= ?
            "#,
        )
        .bind(amount)
        .bind(amount)
        .bind(Utc::now())
        .bind(workspace_id)
        .bind(dimension)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "quota_usage", workspace_id)
    }

    async fn quota_release(
        &self,
        workspace_id: &str,
        dimension: &str,
        amount: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE quota_usage
            SET reserved = reserved - ?, updated_at = ?
            WHERE workspace_id = ? AND dimension = ? AND reserved >= ?
            "#,
        )
        .bind(amount)
        .bind(Utc::now())
        .bind(workspace_id)
        .bind(dimension)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "quota_usage", workspace_id)
    }

    async fn quota_usage(&self, workspace_id: &str, dimension: &str) -> Result<(i64, i64)> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT used, reserved FROM quota_usage WHERE workspace_id = ? AND dimension = ?",
        )
        .bind(workspace_id)
        .bind(dimension)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.unwrap_or((0, 0)))
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| true)
            .map_err(Into::into)
    }
}
