// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant database migrations.
//!
//! The migration set is a compiled-in ordered list of
//! (version, up_sql, down_sql). Applied versions live in the
//! `workspace_db_migrations` ledger inside each tenant database; the
//! applied set is always a prefix of this list. A tenant-scoped advisory
//! lock (`GET_LOCK`) serializes concurrent migrate calls; the loser fails
//! with `MigrationLocked` instead of waiting.

use sqlx::{Connection, MySqlPool};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// One tenant migration step.
#[derive(Debug, Clone, Copy)]
pub struct TenantMigration {
    /// Version, applied in lexicographic order.
    pub version: &'static str,
    /// Forward DDL.
    pub up_sql: &'static str,
    /// Compensating DDL applied when the forward step fails.
    pub down_sql: &'static str,
}

/// The shipped tenant schema, in order.
pub const TENANT_MIGRATIONS: &[TenantMigration] = &[
    TenantMigration {
        version: "0001_collections",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS app_collections (
                id VARCHAR(32) PRIMARY KEY,
                name VARCHAR(190) NOT NULL,
                schema_json JSON,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
                    ON UPDATE CURRENT_TIMESTAMP,
                UNIQUE KEY uq_app_collections_name (name)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
        down_sql: "DROP TABLE IF EXISTS app_collections",
    },
    TenantMigration {
        version: "0002_records",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS app_records (
                id VARCHAR(32) PRIMARY KEY,
                collection_id VARCHAR(32) NOT NULL,
                data JSON NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
                    ON UPDATE CURRENT_TIMESTAMP
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
        down_sql: "DROP TABLE IF EXISTS app_records",
    },
    TenantMigration {
        version: "0003_record_indexes",
        up_sql: r#"
            CREATE INDEX idx_app_records_collection
                ON app_records (collection_id, updated_at)
        "#,
        down_sql: "DROP INDEX idx_app_records_collection ON app_records",
    },
    TenantMigration {
        version: "0004_files",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS app_files (
                id VARCHAR(32) PRIMARY KEY,
                record_id VARCHAR(32),
                file_name VARCHAR(255) NOT NULL,
                content_type VARCHAR(120),
                byte_size BIGINT NOT NULL DEFAULT 0,
                storage_key VARCHAR(255) NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
        down_sql: "DROP TABLE IF EXISTS app_files",
    },
];

fn lock_name(workspace_id: &str) -> String {
    // MySQL lock names are capped at 64 chars; prefix + 32 hex fits.
    format!("agentflow_ws_migrate_{}", workspace_id)
}

/// Run all pending tenant migrations, returning the applied versions.
///
/// Serializes on a tenant-scoped advisory lock; a concurrent call fails
/// with [`Error::MigrationLocked`]. Each version row is written in the
/// same transaction as its up-SQL.
pub async fn run_pending(pool: &MySqlPool, workspace_id: &str) -> Result<Vec<String>> {
    let mut conn = pool.acquire().await?;
    let lock = lock_name(workspace_id);

    let granted: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, 0)")
        .bind(&lock)
        .fetch_one(&mut *conn)
        .await?;

    if granted != Some(1) {
        return Err(Error::MigrationLocked {
            workspace_id: workspace_id.to_string(),
        });
    }

    let result = apply_pending(&mut conn, workspace_id).await;

    // Release on every exit path; the lock is connection-scoped.
    if let Err(e) = sqlx::query_scalar::<_, Option<i64>>("SELECT RELEASE_LOCK(?)")
        .bind(&lock)
        .fetch_one(&mut *conn)
        .await
    {
        warn!(workspace_id = %workspace_id, error = %e, "Failed to release migration lock");
    }

    result
}

async fn apply_pending(
    conn: &mut sqlx::MySqlConnection,
    workspace_id: &str,
) -> Result<Vec<String>> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS workspace_db_migrations (
            version VARCHAR(128) PRIMARY KEY,
            applied_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
    )
    .execute(&mut *conn)
    .await?;

    let applied: Vec<String> =
        sqlx::query_scalar("SELECT version FROM workspace_db_migrations ORDER BY version")
            .fetch_all(&mut *conn)
            .await?;

    let mut newly_applied = Vec::new();

    for migration in TENANT_MIGRATIONS {
        if applied.iter().any(|v| v == migration.version) {
            continue;
        }

        let mut tx = conn.begin().await?;

        let step = async {
            sqlx::raw_sql(migration.up_sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO workspace_db_migrations (version) VALUES (?)")
                .bind(migration.version)
                .execute(&mut *tx)
                .await?;
            Ok::<_, sqlx::Error>(())
        }
        .await;

        match step {
            Ok(()) => {
                tx.commit().await?;
                info!(
                    workspace_id = %workspace_id,
                    version = migration.version,
                    "Applied tenant migration"
                );
                newly_applied.push(migration.version.to_string());
            }
            Err(e) => {
                drop(tx);
                // Best-effort compensation before surfacing the failure.
                if let Err(down_err) = sqlx::raw_sql(migration.down_sql).execute(&mut *conn).await
                {
                    warn!(
                        workspace_id = %workspace_id,
                        version = migration.version,
                        error = %down_err,
                        "Down migration failed after up failure"
                    );
                }
                return Err(Error::MigrationFailed {
                    version: migration.version.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(newly_applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_lexicographically_ordered() {
        let versions: Vec<&str> = TENANT_MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn test_migrations_have_unique_versions() {
        let mut versions: Vec<&str> = TENANT_MIGRATIONS.iter().map(|m| m.version).collect();
        versions.dedup();
        assert_eq!(versions.len(), TENANT_MIGRATIONS.len());
    }

    #[test]
    fn test_every_migration_has_compensation() {
        for migration in TENANT_MIGRATIONS {
            assert!(
                !migration.down_sql.trim().is_empty(),
                "{} has no down_sql",
                migration.version
            );
        }
    }

    #[test]
    fn test_lock_name_within_mysql_limit() {
        let name = lock_name("0123456789abcdef0123456789abcdef");
        assert!(name.len() <= 64);
    }
}
