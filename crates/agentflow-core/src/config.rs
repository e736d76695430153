// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the agentflow control plane.
//!
//! Shared settings live here; each background worker additionally has
//! its own config struct with `Default` and `from_env()` next to the
//! worker implementation.

use std::path::PathBuf;
use std::time::Duration;

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Control-plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string for the control-plane database.
    pub database_url: String,
    /// MySQL admin connection string used to provision tenant databases.
    /// Absent in deployments that never provision tenant databases.
    pub tenant_database_url: Option<String>,
    /// Base64-encoded 32-byte key for the secret store.
    pub secret_key: String,
    /// Root directory for archive artifacts.
    pub archive_base_path: PathBuf,
    /// Days a completed archive artifact is kept before deletion.
    pub archive_retention_days: u32,
    /// When true, retention schedules archive jobs instead of deleting logs.
    pub log_archive_enabled: bool,
    /// Width of one archive window in days.
    pub log_archive_batch_days: u32,
    /// Only windows entirely older than now minus this many days are scheduled.
    pub log_archive_delay_days: u32,
    /// Interval between retention passes.
    pub cleanup_interval: Duration,
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
    /// Owner-name prefix for domain verification TXT records.
    pub domain_txt_prefix: String,
    /// Expected CNAME target for domain verification.
    pub domain_base_host: Option<String>,
    /// Certificate issuer webhook URL; absent selects the no-op issuer.
    pub cert_issuer_url: Option<String>,
    /// Bearer token for the certificate issuer webhook.
    pub cert_issuer_token: Option<String>,
    /// Routing executor webhook URL; absent selects the no-op executor.
    pub routing_url: Option<String>,
    /// Bearer token for the routing executor webhook.
    pub routing_token: Option<String>,
    /// Base URL for operator-facing support links.
    pub support_url_base: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("AGENTFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("AGENTFLOW_DATABASE_URL"))?;

        let secret_key = std::env::var("AGENTFLOW_SECRET_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("AGENTFLOW_SECRET_KEY"))?;

        let cleanup_interval_secs: u64 = std::env::var("AGENTFLOW_CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(86_400);

        Ok(Self {
            database_url,
            tenant_database_url: env_opt("AGENTFLOW_TENANT_DATABASE_URL"),
            secret_key,
            archive_base_path: PathBuf::from(
                std::env::var("AGENTFLOW_ARCHIVE_BASE_PATH").unwrap_or_else(|_| ".data".to_string()),
            ),
            archive_retention_days: env_u32("AGENTFLOW_ARCHIVE_RETENTION_DAYS", 90),
            log_archive_enabled: env_bool("AGENTFLOW_LOG_ARCHIVE_ENABLED", false),
            log_archive_batch_days: env_u32("AGENTFLOW_LOG_ARCHIVE_BATCH_DAYS", 7),
            log_archive_delay_days: env_u32("AGENTFLOW_LOG_ARCHIVE_DELAY_DAYS", 1),
            cleanup_interval: Duration::from_secs(cleanup_interval_secs),
            execution_log_retention_days: env_u32("AGENTFLOW_EXECUTION_LOG_RETENTION_DAYS", 30),
            audit_log_retention_days: env_u32("AGENTFLOW_AUDIT_LOG_RETENTION_DAYS", 180),
            anonymous_session_retention_days: env_u32("AGENTFLOW_ANON_SESSION_RETENTION_DAYS", 30),
            deletion_grace_days: env_u32("AGENTFLOW_DELETION_GRACE_DAYS", 7),
            cold_storage_days: env_u32("AGENTFLOW_COLD_STORAGE_DAYS", 30),
            domain_txt_prefix: std::env::var("AGENTFLOW_DOMAIN_TXT_PREFIX")
                .unwrap_or_else(|_| "_agentflow".to_string()),
            domain_base_host: env_opt("AGENTFLOW_DOMAIN_BASE_HOST"),
            cert_issuer_url: env_opt("AGENTFLOW_CERT_ISSUER_URL"),
            cert_issuer_token: env_opt("AGENTFLOW_CERT_ISSUER_TOKEN"),
            routing_url: env_opt("AGENTFLOW_ROUTING_URL"),
            routing_token: env_opt("AGENTFLOW_ROUTING_TOKEN"),
            support_url_base: std::env::var("AGENTFLOW_SUPPORT_URL_BASE")
                .unwrap_or_else(|_| "https://support.agentflow.dev".to_string()),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A value could not be parsed.
    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_parsing() {
        // No variable set: default wins
        assert!(env_bool("AGENTFLOW_TEST_UNSET_BOOL", true));
        assert!(!env_bool("AGENTFLOW_TEST_UNSET_BOOL", false));
    }

    #[test]
    fn test_env_u32_default() {
        assert_eq!(env_u32("AGENTFLOW_TEST_UNSET_U32", 42), 42);
    }

    #[test]
    fn test_env_opt_unset() {
        assert!(env_opt("AGENTFLOW_TEST_UNSET_OPT").is_none());
    }
}
