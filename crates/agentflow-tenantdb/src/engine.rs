// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-tenant database lifecycle engine.
//!
//! Provisions one dedicated MySQL database and user per workspace, then
//! manages rotation, migration, backup, and restore for it. Provisioning
//! is idempotent (ledger-keyed), quota-guarded, and retried with
//! exponential backoff; a failed attempt drops the half-provisioned
//! database and user before the next one starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentflow_core::error::CoreError;
use agentflow_core::events::{Event, EventRecorder};
use agentflow_core::idempotency::{Begin, IdempotencyLedger};
use agentflow_core::persistence::{
    Persistence, TenantDatabaseRecord, TenantDbStatus, WorkspaceRecord, new_record_id,
};
use agentflow_core::quota::{QuotaAccountant, QuotaDimension};
use agentflow_core::secrets::SecretStore;
use chrono::Utc;
use serde::Serialize;
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ident::{
    backup_db_name, escape_literal, generate_password, is_safe_identifier, quote_ident,
    tenant_db_name, tenant_db_user,
};
use crate::migrate;

/// Provisioning attempts before the row is marked failed.
const PROVISION_ATTEMPTS: u32 = 3;
/// First retry delay; doubled per attempt.
const PROVISION_BACKOFF_BASE: Duration = Duration::from_millis(300);
/// Retry delay ceiling.
const PROVISION_BACKOFF_MAX: Duration = Duration::from_secs(3);

/// Privileges granted to a tenant user on its own database.
const TENANT_GRANTS: &str = "SELECT, INSERT, UPDATE, DELETE, CREATE, ALTER, INDEX, DROP";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct TenantDbConfig {
    /// Admin DSN used for CREATE DATABASE / CREATE USER / GRANT.
    pub admin_url: String,
    /// Host advertised to tenant connections.
    pub host: String,
    /// Port advertised to tenant connections.
    pub port: u16,
    /// Max open connections per tenant pool.
    pub max_connections: u32,
    /// Idle timeout per tenant pool.
    pub idle_timeout: Duration,
    /// Max connection lifetime per tenant pool.
    pub max_lifetime: Duration,
    /// Upper bound for individual tenant SQL statements.
    pub statement_timeout: Duration,
}

impl TenantDbConfig {
    /// Build a config from an admin DSN with default pool limits.
    pub fn new(admin_url: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            admin_url: admin_url.into(),
            host: host.into(),
            port,
            max_connections: 5,
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
            statement_timeout: Duration::from_secs(30),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `AGENTFLOW_TENANT_DATABASE_URL`: admin DSN (required)
    /// - `AGENTFLOW_TENANT_DB_HOST`: advertised host (default `127.0.0.1`)
    /// - `AGENTFLOW_TENANT_DB_PORT`: advertised port (default `3306`)
    pub fn from_env() -> std::result::Result<Self, agentflow_core::config::ConfigError> {
        let admin_url = std::env::var("AGENTFLOW_TENANT_DATABASE_URL").map_err(|_| {
            agentflow_core::config::ConfigError::MissingEnvVar("AGENTFLOW_TENANT_DATABASE_URL")
        })?;

        let host = std::env::var("AGENTFLOW_TENANT_DB_HOST")
            .unwrap_or_else(|_| "127.0.0.1".to_string());

        let port: u16 = std::env::var("AGENTFLOW_TENANT_DB_PORT")
            .unwrap_or_else(|_| "3306".to_string())
            .parse()
            .map_err(|_| {
                agentflow_core::config::ConfigError::InvalidValue("AGENTFLOW_TENANT_DB_PORT")
            })?;

        Ok(Self::new(admin_url, host, port))
    }
}

/// Result of a completed backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    /// Sibling database holding the copy.
    pub backup_id: String,
    /// Source database name.
    pub source: String,
    /// Number of copied base tables.
    pub table_count: usize,
}

/// Result of a completed restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreInfo {
    /// Sibling database restored from.
    pub backup_id: String,
    /// Target database name.
    pub target: String,
    /// Number of copied base tables.
    pub table_count: usize,
}

/// Per-tenant database lifecycle engine.
pub struct TenantDbEngine {
    admin: MySqlPool,
    config: TenantDbConfig,
    pools: RwLock<HashMap<String, MySqlPool>>,
    persistence: Arc<dyn Persistence>,
    secrets: SecretStore,
    quota: QuotaAccountant,
    ledger: IdempotencyLedger,
    recorder: EventRecorder,
}

impl TenantDbEngine {
    /// Connect the admin pool and build the engine.
    pub async fn connect(
        config: TenantDbConfig,
        persistence: Arc<dyn Persistence>,
        secrets: SecretStore,
        recorder: EventRecorder,
    ) -> Result<Self> {
        let admin = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.admin_url)
            .await?;

        Ok(Self {
            admin,
            config,
            pools: RwLock::new(HashMap::new()),
            quota: QuotaAccountant::new(persistence.clone()),
            ledger: IdempotencyLedger::new(persistence.clone()),
            persistence,
            secrets,
            recorder,
        })
    }

    /// Provision a dedicated database for the workspace.
    ///
    /// Idempotent: a ready row short-circuits, a replayed idempotency key
    /// returns the previously provisioned row, and a concurrent call with
    /// the same key observes `InProgress`.
    pub async fn provision(
        &self,
        workspace: &WorkspaceRecord,
        idem_key: &str,
    ) -> Result<TenantDatabaseRecord> {
        if let Some(existing) = self.persistence.get_tenant_database(&workspace.id).await?
            && existing.status == TenantDbStatus::Ready.to_string()
        {
            return Ok(existing);
        }

        let request_hash =
            IdempotencyLedger::request_hash(format!("db.provision:{}", workspace.id).as_bytes());

        let ledger_record = match self
            .ledger
            .begin(&workspace.owner_id, "db.provision", idem_key, &request_hash)
            .await?
        {
            Begin::Replayed { .. } => {
                // The prior cycle already provisioned; hand back its row.
                return self
                    .persistence
                    .get_tenant_database(&workspace.id)
                    .await?
                    .ok_or_else(|| {
                        Error::Core(CoreError::not_found("tenant_database", &workspace.id))
                    });
            }
            Begin::Started(record) => record,
        };

        let record = match self.persistence.get_tenant_database(&workspace.id).await? {
            Some(existing) => {
                self.persistence
                    .update_tenant_database_status(
                        &existing.id,
                        &TenantDbStatus::Provisioning.to_string(),
                        None,
                    )
                    .await?;
                existing
            }
            None => {
                let now = Utc::now();
                let record = TenantDatabaseRecord {
                    id: new_record_id(),
                    workspace_id: workspace.id.clone(),
                    db_name: tenant_db_name(&workspace.id),
                    db_user: tenant_db_user(&workspace.id),
                    host: self.config.host.clone(),
                    port: i32::from(self.config.port),
                    secret_ref: None,
                    status: TenantDbStatus::Provisioning.to_string(),
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                };
                self.persistence.insert_tenant_database(&record).await?;
                record
            }
        };

        if let Err(e) = self
            .quota
            .reserve(&workspace.id, &workspace.plan, QuotaDimension::DbStorageGb, 1)
            .await
        {
            self.ledger.fail(&ledger_record).await?;
            self.persistence
                .update_tenant_database_status(
                    &record.id,
                    &TenantDbStatus::Failed.to_string(),
                    Some(&e.to_string()),
                )
                .await?;
            return Err(e.into());
        }

        let started = Instant::now();
        let mut last_error = String::new();

        for attempt in 0..PROVISION_ATTEMPTS {
            if attempt > 0 {
                let delay = PROVISION_BACKOFF_BASE * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay.min(PROVISION_BACKOFF_MAX)).await;
            }

            match self.provision_once(&record).await {
                Ok(secret_ref) => {
                    self.persistence
                        .set_tenant_database_ready(&record.id, &secret_ref)
                        .await?;
                    self.quota
                        .consume(&workspace.id, QuotaDimension::DbStorageGb, 1)
                        .await?;
                    self.ledger
                        .complete(&ledger_record, "tenant_database", &record.id)
                        .await?;
                    self.recorder.record(Event::DbProvisionSucceeded {
                        workspace_id: workspace.id.clone(),
                        db_name: record.db_name.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });

                    info!(
                        workspace_id = %workspace.id,
                        db_name = %record.db_name,
                        attempt = attempt + 1,
                        "Tenant database provisioned"
                    );

                    return self
                        .persistence
                        .get_tenant_database(&workspace.id)
                        .await?
                        .ok_or_else(|| {
                            Error::Core(CoreError::not_found("tenant_database", &workspace.id))
                        });
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        workspace_id = %workspace.id,
                        attempt = attempt + 1,
                        error = %last_error,
                        "Provisioning attempt failed, rolling back"
                    );
                    self.rollback_provision(&record).await;
                }
            }
        }

        self.persistence
            .update_tenant_database_status(
                &record.id,
                &TenantDbStatus::Failed.to_string(),
                Some(&last_error),
            )
            .await?;
        self.quota
            .release(&workspace.id, QuotaDimension::DbStorageGb, 1)
            .await?;
        self.ledger.fail(&ledger_record).await?;
        self.evict_pool(&workspace.id).await;
        self.recorder.record(Event::DbProvisionFailed {
            workspace_id: workspace.id.clone(),
            error: last_error.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        Err(Error::ProvisionFailed {
            workspace_id: workspace.id.clone(),
            reason: last_error,
        })
    }

    /// Rotate the tenant user's password.
    ///
    /// The new secret envelope is persisted only after `ALTER USER`
    /// succeeds; the cached pool is evicted so new connections pick up
    /// the fresh credentials.
    pub async fn rotate(&self, workspace_id: &str) -> Result<TenantDatabaseRecord> {
        let record = self.require_ready(workspace_id).await?;

        let password = generate_password();
        let user = quote_user(&record.db_user)?;

        self.exec_admin(format!(
            "ALTER USER {} IDENTIFIED BY '{}'",
            user,
            escape_literal(&password)
        ))
        .await?;
        self.exec_admin("FLUSH PRIVILEGES".to_string()).await?;

        let secret_ref = self.secrets.encrypt(&password).map_err(Error::Core)?;
        self.persistence
            .update_tenant_database_secret(&record.id, &secret_ref)
            .await?;

        self.evict_pool(workspace_id).await;
        self.recorder.record(Event::DbCredentialsRotated {
            workspace_id: workspace_id.to_string(),
            db_user: record.db_user.clone(),
        });

        self.persistence
            .get_tenant_database(workspace_id)
            .await?
            .ok_or_else(|| Error::Core(CoreError::not_found("tenant_database", workspace_id)))
    }

    /// Run pending tenant migrations for the workspace.
    pub async fn migrate(&self, workspace_id: &str) -> Result<Vec<String>> {
        let pool = self.tenant_pool(workspace_id).await?;
        migrate::run_pending(&pool, workspace_id).await
    }

    /// Copy every base table into a timestamped sibling database.
    pub async fn backup(&self, workspace_id: &str) -> Result<BackupInfo> {
        let record = self.require_ready(workspace_id).await?;
        let backup_db = backup_db_name(workspace_id, Utc::now());

        let tables = self.base_tables(&record.db_name).await?;

        let result = self
            .copy_tables(&record.db_name, &backup_db, &tables, true)
            .await;

        match result {
            Ok(()) => {
                self.recorder.record(Event::DbBackupCompleted {
                    workspace_id: workspace_id.to_string(),
                    backup_db: backup_db.clone(),
                    table_count: tables.len(),
                });
                Ok(BackupInfo {
                    backup_id: backup_db,
                    source: record.db_name,
                    table_count: tables.len(),
                })
            }
            Err(e) => {
                // Drop the partial sibling before surfacing the failure.
                if let Ok(quoted) = quote_ident(&backup_db) {
                    let _ = self
                        .exec_admin(format!("DROP DATABASE IF EXISTS {}", quoted))
                        .await;
                }
                Err(Error::BackupFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Restore the tenant database from a sibling backup.
    ///
    /// Destructive: every base table in the target is dropped before the
    /// copy, and a mid-way failure leaves the target partially emptied.
    pub async fn restore(&self, workspace_id: &str, backup_id: &str) -> Result<RestoreInfo> {
        if !is_safe_identifier(backup_id) || !backup_id.starts_with("wsb_") {
            return Err(Error::Core(CoreError::invalid_input(
                "backup_id",
                "must be a wsb_-prefixed identifier of [A-Za-z0-9_]",
            )));
        }

        let record = self.require_ready(workspace_id).await?;

        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name = ?",
        )
        .bind(backup_id)
        .fetch_one(&self.admin)
        .await?;
        if exists == 0 {
            return Err(Error::Core(CoreError::not_found("backup", backup_id)));
        }

        let target_tables = self.base_tables(&record.db_name).await?;
        let backup_tables = self.base_tables(backup_id).await?;

        let result = async {
            let target = quote_ident(&record.db_name).map_err(Error::Core)?;

            for table in &target_tables {
                let quoted = quote_ident(table).map_err(Error::Core)?;
                self.exec_admin(format!("DROP TABLE IF EXISTS {}.{}", target, quoted))
                    .await?;
            }

            self.copy_tables(backup_id, &record.db_name, &backup_tables, false)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                self.evict_pool(workspace_id).await;
                self.recorder.record(Event::DbRestoreCompleted {
                    workspace_id: workspace_id.to_string(),
                    backup_db: backup_id.to_string(),
                });
                Ok(RestoreInfo {
                    backup_id: backup_id.to_string(),
                    target: record.db_name,
                    table_count: backup_tables.len(),
                })
            }
            Err(e) => Err(Error::RestoreFailed {
                reason: e.to_string(),
            }),
        }
    }

    /// Get (or open and cache) the tenant's connection pool.
    ///
    /// Fails with `NotReady` unless the row's status is `ready`.
    pub async fn tenant_pool(&self, workspace_id: &str) -> Result<MySqlPool> {
        if let Some(pool) = self.pools.read().await.get(workspace_id) {
            return Ok(pool.clone());
        }

        let record = self.require_ready(workspace_id).await?;
        let secret_ref = record.secret_ref.as_deref().ok_or_else(|| {
            Error::Core(CoreError::InvalidSecret {
                reason: "tenant database has no secret reference".to_string(),
            })
        })?;
        let password = self.secrets.decrypt(secret_ref).map_err(Error::Core)?;

        let url = format!(
            "mysql://{}:{}@{}:{}/{}",
            record.db_user, password, record.host, record.port, record.db_name
        );

        let pool = MySqlPoolOptions::new()
            .max_connections(self.config.max_connections)
            .idle_timeout(self.config.idle_timeout)
            .max_lifetime(self.config.max_lifetime)
            .connect(&url)
            .await?;

        self.pools
            .write()
            .await
            .insert(workspace_id.to_string(), pool.clone());

        Ok(pool)
    }

    /// Drop the cached pool for a workspace.
    pub async fn evict_pool(&self, workspace_id: &str) {
        if let Some(pool) = self.pools.write().await.remove(workspace_id) {
            pool.close().await;
        }
    }

    async fn require_ready(&self, workspace_id: &str) -> Result<TenantDatabaseRecord> {
        let record = self
            .persistence
            .get_tenant_database(workspace_id)
            .await?
            .ok_or_else(|| Error::Core(CoreError::not_found("tenant_database", workspace_id)))?;

        if record.status != TenantDbStatus::Ready.to_string() {
            return Err(Error::Core(CoreError::NotReady {
                resource: "tenant_database".to_string(),
                status: record.status,
            }));
        }

        Ok(record)
    }

    async fn provision_once(&self, record: &TenantDatabaseRecord) -> Result<String> {
        let db = quote_ident(&record.db_name).map_err(Error::Core)?;
        let user = quote_user(&record.db_user)?;
        let password = generate_password();

        self.exec_admin(format!(
            "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
            db
        ))
        .await?;

        self.exec_admin(format!(
            "CREATE USER IF NOT EXISTS {} IDENTIFIED BY '{}'",
            user,
            escape_literal(&password)
        ))
        .await?;

        self.exec_admin(format!("GRANT {} ON {}.* TO {}", TENANT_GRANTS, db, user))
            .await?;
        self.exec_admin("FLUSH PRIVILEGES".to_string()).await?;

        // Connect as the tenant user and lay down the shipped schema.
        let url = format!(
            "mysql://{}:{}@{}:{}/{}",
            record.db_user, password, record.host, record.port, record.db_name
        );
        let pool = MySqlPoolOptions::new()
            .max_connections(self.config.max_connections)
            .idle_timeout(self.config.idle_timeout)
            .max_lifetime(self.config.max_lifetime)
            .connect(&url)
            .await?;

        migrate::run_pending(&pool, &record.workspace_id).await?;

        let secret_ref = self.secrets.encrypt(&password).map_err(Error::Core)?;

        self.pools
            .write()
            .await
            .insert(record.workspace_id.clone(), pool);

        Ok(secret_ref)
    }

    async fn rollback_provision(&self, record: &TenantDatabaseRecord) {
        self.evict_pool(&record.workspace_id).await;

        if let Ok(db) = quote_ident(&record.db_name)
            && let Err(e) = self
                .exec_admin(format!("DROP DATABASE IF EXISTS {}", db))
                .await
        {
            warn!(db_name = %record.db_name, error = %e, "Rollback: drop database failed");
        }

        if let Ok(user) = quote_user(&record.db_user)
            && let Err(e) = self
                .exec_admin(format!("DROP USER IF EXISTS {}", user))
                .await
        {
            warn!(db_user = %record.db_user, error = %e, "Rollback: drop user failed");
        }
    }

    async fn base_tables(&self, db_name: &str) -> Result<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT table_name FROM information_schema.tables
            WHERE table_schema = ? AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .bind(db_name)
        .fetch_all(&self.admin)
        .await?;

        Ok(tables)
    }

    async fn copy_tables(
        &self,
        source_db: &str,
        target_db: &str,
        tables: &[String],
        create_target: bool,
    ) -> Result<()> {
        let source = quote_ident(source_db).map_err(Error::Core)?;
        let target = quote_ident(target_db).map_err(Error::Core)?;

        if create_target {
            self.exec_admin(format!(
                "CREATE DATABASE {} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
                target
            ))
            .await?;
        }

        for table in tables {
            let quoted = quote_ident(table).map_err(Error::Core)?;
            self.exec_admin(format!(
                "CREATE TABLE {}.{} LIKE {}.{}",
                target, quoted, source, quoted
            ))
            .await?;
            self.exec_admin(format!(
                "INSERT INTO {}.{} SELECT * FROM {}.{}",
                target, quoted, source, quoted
            ))
            .await?;
        }

        Ok(())
    }

    async fn exec_admin(&self, sql: String) -> Result<()> {
        let fut = sqlx::raw_sql(&sql).execute(&self.admin);
        match tokio::time::timeout(self.config.statement_timeout, fut).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(Error::Core(CoreError::transient(
                "tenant_ddl",
                format!("statement timed out after {:?}", self.config.statement_timeout),
            ))),
        }
    }
}

fn quote_user(user: &str) -> Result<String> {
    if !is_safe_identifier(user) {
        return Err(Error::Core(CoreError::invalid_input(
            "db_user",
            "contains characters outside [A-Za-z0-9_]",
        )));
    }
    Ok(format!("'{}'@'%'", user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let delays: Vec<Duration> = (1..PROVISION_ATTEMPTS)
            .map(|attempt| {
                (PROVISION_BACKOFF_BASE * 2u32.pow(attempt - 1)).min(PROVISION_BACKOFF_MAX)
            })
            .collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(300), Duration::from_millis(600)]
        );

        // A hypothetical later attempt clamps at the ceiling.
        let clamped = (PROVISION_BACKOFF_BASE * 2u32.pow(5)).min(PROVISION_BACKOFF_MAX);
        assert_eq!(clamped, Duration::from_secs(3));
    }

    #[test]
    fn test_quote_user() {
        assert_eq!(
            quote_user("wsu_0123456789abcdef").unwrap(),
            "'wsu_0123456789abcdef'@'%'"
        );
        assert!(quote_user("bad'user").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = TenantDbConfig::new("mysql://root@localhost", "127.0.0.1", 3306);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.statement_timeout, Duration::from_secs(30));
    }
}
