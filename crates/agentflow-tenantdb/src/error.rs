// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for agentflow-tenantdb.

use thiserror::Error;

/// Tenant database engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Control-plane operation failed.
    #[error("Core error: {0}")]
    Core(#[from] agentflow_core::CoreError),

    /// Tenant database driver operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Provisioning gave up after retries; side effects were rolled back.
    #[error("Provisioning failed for workspace {workspace_id}: {reason}")]
    ProvisionFailed {
        /// The workspace being provisioned.
        workspace_id: String,
        /// The final attempt's error.
        reason: String,
    },

    /// A tenant migration failed; its down-SQL was applied.
    #[error("Migration {version} failed: {reason}")]
    MigrationFailed {
        /// The migration version that failed.
        version: String,
        /// The failure reason.
        reason: String,
    },

    /// Another migrate call holds the tenant's advisory lock.
    #[error("Migration already running for workspace {workspace_id}")]
    MigrationLocked {
        /// The workspace whose lock is held.
        workspace_id: String,
    },

    /// Backup failed; the partial sibling database was dropped.
    #[error("Backup failed: {reason}")]
    BackupFailed {
        /// The failure reason.
        reason: String,
    },

    /// Restore failed; the target may be partially emptied.
    #[error("Restore failed: {reason}")]
    RestoreFailed {
        /// The failure reason.
        reason: String,
    },
}

/// Result type using the tenant database Error.
pub type Result<T> = std::result::Result<T, Error>;
