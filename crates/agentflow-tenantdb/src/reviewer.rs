// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Two-phase review and execution of tenant DDL changes.
//!
//! Submit parses a DDL bundle, runs a precheck (forbidden statements,
//! destructive operations without explicit confirmation, table
//! existence), and persists a pending request. A reviewer approves or
//! rejects; execution runs the statements, then the SELECT-shaped verify
//! query, and succeeds only when verification returns rows. At most one
//! non-terminal request exists per workspace.

use std::sync::Arc;

use agentflow_core::error::CoreError;
use agentflow_core::events::{Event, EventRecorder};
use agentflow_core::persistence::{
    Persistence, SchemaMigrationRequestRecord, SchemaRequestStatus, new_record_id,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Connection;
use tracing::{info, warn};

use crate::engine::TenantDbEngine;
use crate::error::{Error, Result};

/// Statement prefixes that are never allowed through review.
const FORBIDDEN_PREFIXES: &[&str] = &[
    "GRANT",
    "REVOKE",
    "CREATE USER",
    "DROP USER",
    "ALTER USER",
    "CREATE DATABASE",
    "DROP DATABASE",
    "SET",
    "FLUSH",
    "USE",
    "SHUTDOWN",
];

/// Precheck findings for one statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementFinding {
    /// Position of the statement in the bundle.
    pub index: usize,
    /// Classified statement kind.
    pub kind: String,
    /// Target table, when the statement names one.
    pub table: Option<String>,
    /// Blocking issues found for this statement.
    pub issues: Vec<String>,
}

/// Precheck report persisted with the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Precheck {
    /// Whether the bundle passed every check.
    pub ok: bool,
    /// Per-statement findings.
    pub findings: Vec<StatementFinding>,
}

/// Split a DDL bundle into statements on `;`, honoring quoted strings.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_backtick = false;
    let mut previous = '\0';

    for c in sql.chars() {
        match c {
            '\'' if !in_backtick && previous != '\\' => in_single = !in_single,
            '`' if !in_single => in_backtick = !in_backtick,
            ';' if !in_single && !in_backtick => {
                let stmt = current.trim().to_string();
                if !stmt.is_empty() {
                    statements.push(stmt);
                }
                current.clear();
                previous = c;
                continue;
            }
            _ => {}
        }
        current.push(c);
        previous = c;
    }

    let stmt = current.trim().to_string();
    if !stmt.is_empty() {
        statements.push(stmt);
    }

    statements
}

fn words(stmt: &str) -> Vec<String> {
    stmt.split_whitespace()
        .map(|w| w.trim_matches('`').trim_end_matches('(').to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn word_after<'a>(tokens: &'a [String], keyword: &str, skip: &[&str]) -> Option<&'a str> {
    let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
    let mut i = 0;
    while i < upper.len() {
        if upper[i] == keyword {
            let mut j = i + 1;
            while j < upper.len() && skip.contains(&upper[j].as_str()) {
                j += 1;
            }
            return tokens.get(j).map(|s| s.as_str());
        }
        i += 1;
    }
    None
}

/// Classify a statement and extract its target table, when any.
pub fn classify_statement(stmt: &str) -> (String, Option<String>) {
    let tokens = words(stmt);
    let upper = stmt.trim().to_ascii_uppercase();

    let table_after = |kw: &str| {
        word_after(&tokens, kw, &["IF", "NOT", "EXISTS"]).map(|t| t.to_string())
    };

    if upper.starts_with("CREATE TABLE") {
        ("create_table".to_string(), table_after("TABLE"))
    } else if upper.starts_with("ALTER TABLE") {
        ("alter_table".to_string(), table_after("TABLE"))
    } else if upper.starts_with("DROP TABLE") {
        ("drop_table".to_string(), table_after("TABLE"))
    } else if upper.starts_with("TRUNCATE") {
        let table = table_after("TABLE").or_else(|| tokens.get(1).map(|t| t.to_string()));
        ("truncate".to_string(), table)
    } else if upper.starts_with("CREATE INDEX") || upper.starts_with("CREATE UNIQUE INDEX") {
        ("create_index".to_string(), word_after(&tokens, "ON", &[]).map(|t| t.to_string()))
    } else if upper.starts_with("DROP INDEX") {
        ("drop_index".to_string(), word_after(&tokens, "ON", &[]).map(|t| t.to_string()))
    } else if upper.starts_with("RENAME TABLE") {
        ("rename_table".to_string(), table_after("TABLE"))
    } else {
        ("other".to_string(), None)
    }
}

fn forbidden_reason(stmt: &str) -> Option<String> {
    let upper = stmt.trim().to_ascii_uppercase();
    for prefix in FORBIDDEN_PREFIXES {
        if upper.starts_with(prefix) {
            return Some(format!("{} statements are not allowed", prefix));
        }
    }
    if upper.contains("WORKSPACE_DB_MIGRATIONS") {
        return Some("statements may not touch the migration ledger".to_string());
    }
    None
}

fn is_destructive(stmt: &str) -> bool {
    let upper = stmt.trim().to_ascii_uppercase();
    upper.starts_with("DROP TABLE")
        || upper.starts_with("TRUNCATE")
        || (upper.starts_with("ALTER TABLE") && upper.contains(" DROP "))
}

/// Whether a verification query is SELECT-shaped.
pub fn is_select_shaped(sql: &str) -> bool {
    sql.trim().to_ascii_uppercase().starts_with("SELECT")
}

/// Two-phase schema change reviewer.
pub struct SchemaChangeReviewer {
    persistence: Arc<dyn Persistence>,
    engine: Arc<TenantDbEngine>,
    recorder: EventRecorder,
}

impl SchemaChangeReviewer {
    /// Create a reviewer over the tenant engine.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        engine: Arc<TenantDbEngine>,
        recorder: EventRecorder,
    ) -> Self {
        Self {
            persistence,
            engine,
            recorder,
        }
    }

    /// Submit a DDL bundle for review.
    ///
    /// Fails with `InvalidInput` when the precheck finds blocking issues,
    /// and with `Conflict` while another non-terminal request exists for
    /// the workspace.
    pub async fn submit(
        &self,
        workspace_id: &str,
        sql_bundle: &str,
        verify_sql: &str,
        allow_destructive: bool,
    ) -> Result<SchemaMigrationRequestRecord> {
        let statements = split_statements(sql_bundle);
        if statements.is_empty() {
            return Err(Error::Core(CoreError::invalid_input(
                "statements",
                "the bundle contains no statements",
            )));
        }
        if !is_select_shaped(verify_sql) {
            return Err(Error::Core(CoreError::invalid_input(
                "verify_sql",
                "verification query must be SELECT-shaped",
            )));
        }

        let precheck = self
            .precheck(workspace_id, &statements, allow_destructive)
            .await?;

        if !precheck.ok {
            let summary: Vec<String> = precheck
                .findings
                .iter()
                .flat_map(|f| f.issues.iter().cloned())
                .collect();
            return Err(Error::Core(CoreError::invalid_input(
                "statements",
                summary.join("; "),
            )));
        }

        let now = Utc::now();
        let record = SchemaMigrationRequestRecord {
            id: new_record_id(),
            workspace_id: workspace_id.to_string(),
            statements: serde_json::to_string(&statements)
                .map_err(|e| Error::Core(e.into()))?,
            precheck: serde_json::to_string(&precheck).ok(),
            verify_sql: verify_sql.trim().to_string(),
            status: SchemaRequestStatus::Pending.to_string(),
            reviewer_id: None,
            review_reason: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        self.persistence.insert_schema_request(&record).await?;
        Ok(record)
    }

    /// Approve a pending request.
    pub async fn approve(
        &self,
        request_id: &str,
        reviewer_id: &str,
    ) -> Result<SchemaMigrationRequestRecord> {
        let record = self.require_request(request_id).await?;
        if record.status != SchemaRequestStatus::Pending.to_string() {
            return Err(Error::Core(CoreError::NotReady {
                resource: "schema_migration_request".to_string(),
                status: record.status,
            }));
        }

        self.persistence
            .update_schema_request(
                request_id,
                &SchemaRequestStatus::Approved.to_string(),
                Some(reviewer_id),
                None,
                None,
            )
            .await?;

        self.require_request(request_id).await
    }

    /// Reject a request with a reason. Terminal.
    pub async fn reject(
        &self,
        request_id: &str,
        reviewer_id: &str,
        reason: &str,
    ) -> Result<SchemaMigrationRequestRecord> {
        if reason.trim().is_empty() {
            return Err(Error::Core(CoreError::invalid_input(
                "reason",
                "a rejection reason is required",
            )));
        }

        let record = self.require_request(request_id).await?;
        let status: SchemaRequestStatus = record
            .status
            .parse()
            .map_err(|_| Error::Core(CoreError::transient("schema_review", "unknown status")))?;
        if status.is_terminal() || status == SchemaRequestStatus::Executing {
            return Err(Error::Core(CoreError::NotReady {
                resource: "schema_migration_request".to_string(),
                status: record.status,
            }));
        }

        self.persistence
            .update_schema_request(
                request_id,
                &SchemaRequestStatus::Rejected.to_string(),
                Some(reviewer_id),
                Some(reason.trim()),
                None,
            )
            .await?;

        self.require_request(request_id).await
    }

    /// Execute an approved request and verify the result.
    pub async fn execute(&self, request_id: &str) -> Result<SchemaMigrationRequestRecord> {
        let record = self.require_request(request_id).await?;
        if record.status != SchemaRequestStatus::Approved.to_string() {
            return Err(Error::Core(CoreError::NotReady {
                resource: "schema_migration_request".to_string(),
                status: record.status,
            }));
        }

        self.persistence
            .update_schema_request(
                request_id,
                &SchemaRequestStatus::Executing.to_string(),
                None,
                None,
                None,
            )
            .await?;

        let statements: Vec<String> = serde_json::from_str(&record.statements)
            .map_err(|e| Error::Core(e.into()))?;

        let outcome = self
            .run_statements(&record.workspace_id, &statements, &record.verify_sql)
            .await;

        let (status, error) = match &outcome {
            Ok(()) => (SchemaRequestStatus::Succeeded, None),
            Err(e) => (SchemaRequestStatus::Failed, Some(e.to_string())),
        };

        self.persistence
            .update_schema_request(request_id, &status.to_string(), None, None, error.as_deref())
            .await?;

        self.recorder.record(Event::SchemaChangeExecuted {
            workspace_id: record.workspace_id.clone(),
            request_id: request_id.to_string(),
            succeeded: outcome.is_ok(),
        });

        match outcome {
            Ok(()) => {
                info!(request_id = %request_id, "Schema change executed");
                self.require_request(request_id).await
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Schema change failed");
                Err(e)
            }
        }
    }

    async fn run_statements(
        &self,
        workspace_id: &str,
        statements: &[String],
        verify_sql: &str,
    ) -> Result<()> {
        let pool = self.engine.tenant_pool(workspace_id).await?;
        let mut conn = pool.acquire().await?;
        let mut tx = conn.begin().await?;

        for stmt in statements {
            sqlx::raw_sql(stmt).execute(&mut *tx).await?;
        }

        let rows = sqlx::query(verify_sql).fetch_all(&mut *tx).await?;
        if rows.is_empty() {
            tx.rollback().await?;
            return Err(Error::Core(CoreError::transient(
                "schema_verify",
                "verification query returned no rows",
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn precheck(
        &self,
        workspace_id: &str,
        statements: &[String],
        allow_destructive: bool,
    ) -> Result<Precheck> {
        let mut findings = Vec::new();
        let mut ok = true;

        for (index, stmt) in statements.iter().enumerate() {
            let (kind, table) = classify_statement(stmt);
            let mut issues = Vec::new();

            if let Some(reason) = forbidden_reason(stmt) {
                issues.push(reason);
            }

            if is_destructive(stmt) && !allow_destructive {
                issues.push(format!(
                    "statement {} is destructive and lacks explicit confirmation",
                    index + 1
                ));
            }

            if let Some(table_name) = table.as_deref() {
                let exists = self.table_exists(workspace_id, table_name).await?;
                match kind.as_str() {
                    "create_table" => {
                        if exists && !stmt.to_ascii_uppercase().contains("IF NOT EXISTS") {
                            issues.push(format!("table '{}' already exists", table_name));
                        }
                    }
                    "alter_table" | "drop_table" | "truncate" | "create_index"
                    | "drop_index" => {
                        if !exists {
                            issues.push(format!("table '{}' does not exist", table_name));
                        }
                    }
                    _ => {}
                }
            }

            if !issues.is_empty() {
                ok = false;
            }

            findings.push(StatementFinding {
                index,
                kind,
                table,
                issues,
            });
        }

        Ok(Precheck { ok, findings })
    }

    async fn table_exists(&self, workspace_id: &str, table: &str) -> Result<bool> {
        let pool = self.engine.tenant_pool(workspace_id).await?;
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM information_schema.tables
            WHERE table_schema = DATABASE() AND table_name = ?
            "#,
        )
        .bind(table)
        .fetch_one(&pool)
        .await?;

        Ok(count > 0)
    }

    async fn require_request(&self, request_id: &str) -> Result<SchemaMigrationRequestRecord> {
        self.persistence
            .get_schema_request(request_id)
            .await?
            .ok_or_else(|| {
                Error::Core(CoreError::not_found("schema_migration_request", request_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements_honors_quotes() {
        let bundle = "CREATE TABLE a (x TEXT); INSERT INTO a VALUES ('b;c'); ALTER TABLE a ADD y INT";
        let statements = split_statements(bundle);
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[1], "INSERT INTO a VALUES ('b;c')");
    }

    #[test]
    fn test_split_statements_skips_empty() {
        assert!(split_statements("  ;;  ; ").is_empty());
    }

    #[test]
    fn test_classify_create_table() {
        let (kind, table) = classify_statement("CREATE TABLE IF NOT EXISTS `orders` (id INT)");
        assert_eq!(kind, "create_table");
        assert_eq!(table.as_deref(), Some("orders"));
    }

    #[test]
    fn test_classify_alter_and_drop() {
        let (kind, table) = classify_statement("ALTER TABLE orders ADD COLUMN total INT");
        assert_eq!(kind, "alter_table");
        assert_eq!(table.as_deref(), Some("orders"));

        let (kind, table) = classify_statement("DROP TABLE IF EXISTS orders");
        assert_eq!(kind, "drop_table");
        assert_eq!(table.as_deref(), Some("orders"));
    }

    #[test]
    fn test_classify_index() {
        let (kind, table) = classify_statement("CREATE INDEX idx_x ON orders (x)");
        assert_eq!(kind, "create_index");
        assert_eq!(table.as_deref(), Some("orders"));
    }

    #[test]
    fn test_forbidden_statements() {
        assert!(forbidden_reason("GRANT ALL ON x.* TO 'u'@'%'").is_some());
        assert!(forbidden_reason("DROP DATABASE ws_abc").is_some());
        assert!(forbidden_reason("FLUSH PRIVILEGES").is_some());
        assert!(forbidden_reason("DELETE FROM workspace_db_migrations").is_some());
        assert!(forbidden_reason("CREATE TABLE safe (id INT)").is_none());
    }

    #[test]
    fn test_destructive_detection() {
        assert!(is_destructive("DROP TABLE orders"));
        assert!(is_destructive("TRUNCATE orders"));
        assert!(is_destructive("ALTER TABLE orders DROP COLUMN total"));
        assert!(!is_destructive("ALTER TABLE orders ADD COLUMN total INT"));
        assert!(!is_destructive("CREATE TABLE orders (id INT)"));
    }

    #[test]
    fn test_select_shaped() {
        assert!(is_select_shaped("SELECT COUNT(*) FROM orders"));
        assert!(is_select_shaped("  select 1"));
        assert!(!is_select_shaped("DELETE FROM orders"));
    }
}
