// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for agentflow-core.
//!
//! Provides a unified error type whose variants map 1:1 to the error
//! kinds surfaced at the request layer. Variants that carry side data
//! (retry times, support links, quota usage) expose it as named fields
//! so callers never parse messages.

use chrono::{DateTime, Utc};
use std::fmt;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during control-plane operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A user-supplied value failed validation.
    InvalidInput {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A referenced resource does not exist.
    NotFound {
        /// Resource kind (workspace, domain, tenant_database, export_job, ...).
        resource: String,
        /// The identifier that was not found.
        id: String,
    },

    /// The caller lacks the required permission on the workspace.
    Unauthorized {
        /// The action that was denied.
        action: String,
    },

    /// The request conflicts with existing state.
    Conflict {
        /// Resource kind the conflict occurred on.
        resource: String,
        /// Human-readable conflict description.
        message: String,
    },

    /// An idempotent operation with the same key is still running.
    InProgress {
        /// The action whose record is still processing.
        action: String,
    },

    /// The operation is time-gated; retry after `next_retry_at`.
    RetryLater {
        /// Earliest time the operation may be retried.
        next_retry_at: DateTime<Utc>,
        /// What is being gated.
        message: String,
    },

    /// Automatic retries are exhausted; operator intervention needed.
    SupportRequired {
        /// Operator-facing support link.
        support_url: String,
        /// What gave up.
        message: String,
    },

    /// A plan limit for a quota dimension was reached.
    QuotaExceeded {
        /// The quota dimension (e.g. db_storage_gb).
        dimension: String,
        /// The plan limit.
        limit: i64,
        /// Current usage including reservations.
        used: i64,
    },

    /// The resource exists but is not in a state that accepts the operation.
    NotReady {
        /// Resource kind.
        resource: String,
        /// The status that blocked the operation.
        status: String,
    },

    /// A persisted secret envelope is malformed or failed to decrypt.
    InvalidSecret {
        /// Why the envelope was rejected.
        reason: String,
    },

    /// Underlying driver / network error that survived local retry.
    Transient {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the stable error code string for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Conflict { .. } => "CONFLICT",
            Self::InProgress { .. } => "IN_PROGRESS",
            Self::RetryLater { .. } => "RETRY_LATER",
            Self::SupportRequired { .. } => "SUPPORT_REQUIRED",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::NotReady { .. } => "NOT_READY",
            Self::InvalidSecret { .. } => "INVALID_SECRET",
            Self::Transient { .. } => "TRANSIENT",
        }
    }

    /// Shorthand for a `NotFound` error.
    pub fn not_found(resource: &str, id: &str) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    /// Shorthand for an `InvalidInput` error.
    pub fn invalid_input(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a `Transient` error.
    pub fn transient(operation: &str, details: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.to_string(),
            details: details.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { field, message } => {
                write!(f, "Invalid input for '{}': {}", field, message)
            }
            Self::NotFound { resource, id } => {
                write!(f, "{} '{}' not found", resource, id)
            }
            Self::Unauthorized { action } => {
                write!(f, "Not authorized to {}", action)
            }
            Self::Conflict { resource, message } => {
                write!(f, "Conflict on {}: {}", resource, message)
            }
            Self::InProgress { action } => {
                write!(f, "Operation '{}' is already in progress", action)
            }
            Self::RetryLater {
                next_retry_at,
                message,
            } => {
                write!(f, "{}; retry after {}", message, next_retry_at.to_rfc3339())
            }
            Self::SupportRequired {
                support_url,
                message,
            } => {
                write!(f, "{}; contact support at {}", message, support_url)
            }
            Self::QuotaExceeded {
                dimension,
                limit,
                used,
            } => {
                write!(
                    f,
                    "Quota exceeded for '{}': {} of {} used",
                    dimension, used, limit
                )
            }
            Self::NotReady { resource, status } => {
                write!(f, "{} is not ready (status '{}')", resource, status)
            }
            Self::InvalidSecret { reason } => {
                write!(f, "Invalid secret envelope: {}", reason)
            }
            Self::Transient { operation, details } => {
                write!(f, "Transient error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Transient {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Transient {
            operation: "io".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Transient {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Whether a driver error is a unique-constraint violation.
///
/// Duplicate-insert races on database-enforced unique keys are translated
/// into a re-read by callers, never retried blindly.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            match code.as_deref() {
                // PostgreSQL unique_violation
                Some("23505") => true,
                // SQLite SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY
                Some("2067") | Some("1555") => true,
                // MySQL ER_DUP_ENTRY
                Some("1062") => true,
                _ => db.is_unique_violation(),
            }
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(CoreError, &str)> = vec![
            (
                CoreError::invalid_input("slug", "must be lowercase"),
                "INVALID_INPUT",
            ),
            (CoreError::not_found("workspace", "abc"), "NOT_FOUND"),
            (
                CoreError::Unauthorized {
                    action: "db.provision".to_string(),
                },
                "UNAUTHORIZED",
            ),
            (
                CoreError::Conflict {
                    resource: "workspace".to_string(),
                    message: "slug taken".to_string(),
                },
                "CONFLICT",
            ),
            (
                CoreError::InProgress {
                    action: "db.provision".to_string(),
                },
                "IN_PROGRESS",
            ),
            (
                CoreError::RetryLater {
                    next_retry_at: Utc::now(),
                    message: "verification rate limited".to_string(),
                },
                "RETRY_LATER",
            ),
            (
                CoreError::SupportRequired {
                    support_url: "https://support.agentflow.dev/d/1".to_string(),
                    message: "verification retries exhausted".to_string(),
                },
                "SUPPORT_REQUIRED",
            ),
            (
                CoreError::QuotaExceeded {
                    dimension: "db_storage_gb".to_string(),
                    limit: 5,
                    used: 5,
                },
                "QUOTA_EXCEEDED",
            ),
            (
                CoreError::NotReady {
                    resource: "tenant_database".to_string(),
                    status: "provisioning".to_string(),
                },
                "NOT_READY",
            ),
            (
                CoreError::InvalidSecret {
                    reason: "missing enc: prefix".to_string(),
                },
                "INVALID_SECRET",
            ),
            (CoreError::transient("query", "connection reset"), "TRANSIENT"),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected, "wrong code for {:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_display_carries_side_data() {
        let err = CoreError::QuotaExceeded {
            dimension: "db_storage_gb".to_string(),
            limit: 5,
            used: 5,
        };
        assert_eq!(
            err.to_string(),
            "Quota exceeded for 'db_storage_gb': 5 of 5 used"
        );

        let err = CoreError::NotReady {
            resource: "tenant_database".to_string(),
            status: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "tenant_database is not ready (status 'failed')");
    }
}
