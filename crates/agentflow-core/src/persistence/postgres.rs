// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{CoreError, Result, is_unique_violation};

use super::{
    AuditLogRecord, CustomDomainRecord, ExecutionRecord, ExportJobRecord, IdempotencyRecord,
    NodeLogRecord, Persistence, RuntimeEventRecord, SchemaMigrationRequestRecord,
    TenantDatabaseRecord, WorkspaceRecord,
};

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new PostgreSQL persistence provider from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
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
impl Persistence for PostgresPersistence {
    async fn create_workspace(&self, workspace: &WorkspaceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, owner_id, slug, plan, status, region,
                                    created_at, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
        let record = sqlx::query_as::<_, WorkspaceRecord>(
            "SELECT * FROM workspaces WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_workspace_by_slug(&self, slug: &str) -> Result<Option<WorkspaceRecord>> {
        let record = sqlx::query_as::<_, WorkspaceRecord>(
            "SELECT * FROM workspaces WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_workspace_status(&self, id: &str, status: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workspaces SET status = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "workspace", id)
    }

    async fn soft_delete_workspace(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET status = 'deleted', deleted_at = $2, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
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
            WHERE status = 'deleted' AND deleted_at < $1
            ORDER BY deleted_at ASC
            LIMIT $2
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
            WHERE status = 'cold_storage' AND deleted_at < $1
            ORDER BY deleted_at ASC
            LIMIT $2
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
            let sql = format!("DELETE FROM {} WHERE workspace_id = $1", table);
            sqlx::query(&sql).bind(id).execute(&mut *tx).await?;
        }

        sqlx::query("DELETE FROM workspaces WHERE id = $1")
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
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
            "SELECT * FROM tenant_databases WHERE workspace_id = $1",
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
            SET status = $2, last_error = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(last_error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "tenant_database", id)
    }

    async fn set_tenant_database_ready(&self, id: &str, secret_ref: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_databases
            SET status = 'ready', secret_ref = $2, last_error = NULL, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(secret_ref)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "tenant_database", id)
    }

    async fn update_tenant_database_secret(&self, id: &str, secret_ref: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenant_databases SET secret_ref = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(secret_ref)
        .bind(Utc::now())
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
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
            "SELECT * FROM schema_migration_requests WHERE id = $1",
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
            WHERE workspace_id = $1 AND status IN ('pending', 'approved', 'executing')
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
            SET status = $2,
                reviewer_id = COALESCE($3, reviewer_id),
                review_reason = COALESCE($4, review_reason),
                error = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(reviewer_id)
        .bind(review_reason)
        .bind(error)
        .bind(Utc::now())
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18)
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
            "SELECT * FROM custom_domains WHERE id = $1",
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
            "SELECT * FROM custom_domains WHERE domain = $1",
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
            "SELECT * FROM custom_domains WHERE app_id = $1 AND status = 'active' LIMIT 1",
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
            SET status = $2, ssl_status = $3, verification_attempts = $4, next_retry_at = $5,
                ssl_issue_attempts = $6, ssl_next_retry_at = $7, ssl_issued_at = $8,
                ssl_expires_at = $9, blocked_reason = $10, prior_status = $11,
                support_url = $12, updated_at = $13
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
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
            SET status = 'verified', updated_at = $3
            WHERE app_id = $1 AND status = 'active' AND id <> $2
            "#,
        )
        .bind(app_id)
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE custom_domains SET status = 'active', updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(now)
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
              AND verification_attempts < $2
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(max_attempts)
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
              AND ssl_expires_at <= $2
              AND (ssl_next_retry_at IS NULL OR ssl_next_retry_at <= $1)
            ORDER BY ssl_expires_at ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(window_end)
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
              AND ssl_issue_attempts < $2
              AND (ssl_next_retry_at IS NULL OR ssl_next_retry_at <= $1)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(max_attempts)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
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
        let record = sqlx::query_as::<_, ExportJobRecord>(
            "SELECT * FROM export_jobs WHERE id = $1",
        )
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
            WHERE workspace_id = $1 AND job_type = $2 AND status IN ('pending', 'processing')
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
            WHERE workspace_id = $1 AND job_type = $2
              AND range_start = $3 AND range_end = $4
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
            WHERE workspace_id = $1 AND job_type = $2 AND status = 'completed'
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
            LIMIT $1
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
            SET status = 'processing', updated_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(Utc::now())
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
            SET status = 'completed', file_path = $2, file_name = $3, file_size = $4,
                checksum = $5, expires_at = $6, error = NULL, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(file_path)
        .bind(file_name)
        .bind(file_size)
        .bind(checksum)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "export_job", id)
    }

    async fn fail_export_job(&self, id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE export_jobs SET status = 'failed', error = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now())
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
        let types: Vec<String> = job_types.iter().map(|t| t.to_string()).collect();
        let records = sqlx::query_as::<_, ExportJobRecord>(
            r#"
            SELECT * FROM export_jobs
            WHERE status = 'completed'
              AND job_type = ANY($2)
              AND expires_at IS NOT NULL
              AND expires_at < $1
            ORDER BY expires_at ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(&types)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_export_job(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM export_jobs WHERE id = $1")
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
            "SELECT * FROM export_jobs WHERE workspace_id = $1 ORDER BY created_at ASC",
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            WHERE owner_id = $1 AND action = $2 AND idem_key = $3
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
            SET status = $2, resource_type = $3, resource_id = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(resource_type)
        .bind(resource_id)
        .bind(Utc::now())
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
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            WHERE workspace_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_runtime_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM runtime_events WHERE created_at < $1")
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
            WHERE workspace_id = $1 AND created_at >= $2 AND created_at < $3
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
            WHERE workspace_id = $1 AND created_at >= $2 AND created_at < $3
            ORDER BY created_at ASC, id ASC
            LIMIT $4 OFFSET $5
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
            WHERE workspace_id = $1 AND created_at >= $2 AND created_at < $3
            ORDER BY created_at ASC, id ASC
            LIMIT $4 OFFSET $5
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
            WHERE workspace_id = $1 AND created_at >= $2 AND created_at < $3
            ORDER BY created_at ASC, id ASC
            LIMIT $4 OFFSET $5
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
            WHERE workspace_id = $1 AND created_at >= $2 AND created_at < $3
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
            WHERE workspace_id = $1 AND created_at >= $2 AND created_at < $3
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
            WHERE workspace_id = $1 AND created_at >= $2 AND created_at < $3
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
        let result = sqlx::query("DELETE FROM node_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_audit_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE created_at < $1")
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
            SELECT LEAST(
                (SELECT MIN(created_at) FROM executions WHERE workspace_id = $1),
                (SELECT MIN(created_at) FROM node_logs WHERE workspace_id = $1)
            )
            "#,
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(earliest.and_then(|(e,)| e))
    }

    async fn earliest_audit_log_at(&self, workspace_id: &str) -> Result<Option<DateTime<Utc>>> {
        let earliest: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "SELECT MIN(created_at) FROM audit_logs WHERE workspace_id = $1",
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
            SELECT workspace_id FROM node_logs WHERE created_at < $1
            UNION
            SELECT workspace_id FROM executions WHERE created_at < $1
            LIMIT $2
            "#,
        )
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
            WHERE created_at < $1
            LIMIT $2
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
            VALUES ($1, $2, $3, $3)
            "#,
        )
        .bind(id)
        .bind(fingerprint)
        .bind(last_seen_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_anonymous_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM anonymous_sessions WHERE last_seen_at < $1")
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
            VALUES ($1, $2, 0, 0, $3)
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
            SET reserved = reserved + $3, updated_at = $5
            WHERE workspace_id = $1 AND dimension = $2
              AND used + reserved + $3 <= $4
            "#,
        )
        .bind(workspace_id)
        .bind(dimension)
        .bind(amount)
        .bind(limit)
        .bind(Utc::now())
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
            SET used = used + $3, reserved = reserved - $3, updated_at = $4
            WHERE workspace_id = $1 AND dimension = $2 AND reserved >= $3
            "#,
        )
        .bind(workspace_id)
        .bind(dimension)
        .bind(amount)
        .bind(Utc::now())
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
            SET reserved = reserved - $3, updated_at = $4
            WHERE workspace_id = $1 AND dimension = $2 AND reserved >= $3
            "#,
        )
        .bind(workspace_id)
        .bind(dimension)
        .bind(amount)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), "quota_usage", workspace_id)
    }

    async fn quota_usage(&self, workspace_id: &str, dimension: &str) -> Result<(i64, i64)> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT used, reserved FROM quota_usage WHERE workspace_id = $1 AND dimension = $2",
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
