// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! At-most-once ledger for long-running provisioning actions.
//!
//! A ledger row is keyed by (owner, action, key) under a
//! database-enforced unique constraint. Replay is bit-equal: the same
//! request hash always resolves to the same resource reference. A
//! duplicate-insert race is translated into a re-read that re-applies
//! the ledger rules.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::persistence::{IdempotencyRecord, IdempotencyStatus, Persistence, new_record_id};

/// Outcome of [`IdempotencyLedger::begin`].
#[derive(Debug, Clone)]
pub enum Begin {
    /// A fresh ledger row was inserted; the caller owns the side effect.
    Started(IdempotencyRecord),
    /// A completed row with the same request hash exists; reuse its resource.
    Replayed {
        /// Resource kind recorded at completion.
        resource_type: Option<String>,
        /// Resource identifier recorded at completion.
        resource_id: String,
    },
}

/// Ledger over the `idempotency_keys` table.
#[derive(Clone)]
pub struct IdempotencyLedger {
    persistence: Arc<dyn Persistence>,
}

impl IdempotencyLedger {
    /// Create a ledger over the given persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Hash a request body for replay comparison.
    pub fn request_hash(body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body);
        format!("{:x}", hasher.finalize())
    }

    /// Begin an idempotent action.
    ///
    /// Inserts a `processing` row, or resolves an existing row:
    /// a matching hash on a completed row replays the recorded resource;
    /// a `processing` row fails with `InProgress`; a hash mismatch fails
    /// with `Conflict`; a `failed` row is reset and handed back to the
    /// caller.
    pub async fn begin(
        &self,
        owner_id: &str,
        action: &str,
        idem_key: &str,
        request_hash: &str,
    ) -> Result<Begin> {
        let now = Utc::now();
        let record = IdempotencyRecord {
            id: new_record_id(),
            owner_id: owner_id.to_string(),
            action: action.to_string(),
            idem_key: idem_key.to_string(),
            request_hash: request_hash.to_string(),
            status: IdempotencyStatus::Processing.to_string(),
            resource_type: None,
            resource_id: None,
            created_at: now,
            updated_at: now,
        };

        match self.persistence.insert_idempotency_key(&record).await {
            Ok(()) => Ok(Begin::Started(record)),
            Err(CoreError::Conflict { .. }) => {
                self.resolve_existing(owner_id, action, idem_key, request_hash)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Terminal transition: record the side effect's resource reference.
    pub async fn complete(
        &self,
        record: &IdempotencyRecord,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<()> {
        self.persistence
            .update_idempotency_status(
                &record.id,
                &IdempotencyStatus::Completed.to_string(),
                Some(resource_type),
                Some(resource_id),
            )
            .await
    }

    /// Terminal transition: mark the action failed so the key may be retried.
    pub async fn fail(&self, record: &IdempotencyRecord) -> Result<()> {
        self.persistence
            .update_idempotency_status(&record.id, &IdempotencyStatus::Failed.to_string(), None, None)
            .await
    }

    async fn resolve_existing(
        &self,
        owner_id: &str,
        action: &str,
        idem_key: &str,
        request_hash: &str,
    ) -> Result<Begin> {
        let existing = self
            .persistence
            .get_idempotency_key(owner_id, action, idem_key)
            .await?
            .ok_or_else(|| {
                CoreError::transient("idempotency", "ledger row vanished after duplicate insert")
            })?;

        if existing.request_hash != request_hash {
            return Err(CoreError::Conflict {
                resource: "idempotency_key".to_string(),
                message: "request hash does not match the recorded request".to_string(),
            });
        }

        let status: IdempotencyStatus = existing.status.parse().map_err(|_| {
            CoreError::transient("idempotency", format!("unknown status '{}'", existing.status))
        })?;

        match status {
            IdempotencyStatus::Completed => match existing.resource_id.clone() {
                Some(resource_id) => Ok(Begin::Replayed {
                    resource_type: existing.resource_type.clone(),
                    resource_id,
                }),
                None => Err(CoreError::Conflict {
                    resource: "idempotency_key".to_string(),
                    message: "completed record is missing its resource reference".to_string(),
                }),
            },
            IdempotencyStatus::Processing => Err(CoreError::InProgress {
                action: action.to_string(),
            }),
            IdempotencyStatus::Failed => {
                // The previous attempt gave up; hand the key back to the caller.
                self.persistence
                    .update_idempotency_status(
                        &existing.id,
                        &IdempotencyStatus::Processing.to_string(),
                        None,
                        None,
                    )
                    .await?;

                let mut record = existing;
                record.status = IdempotencyStatus::Processing.to_string();
                record.resource_type = None;
                record.resource_id = None;
                Ok(Begin::Started(record))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_hash_stable() {
        let a = IdempotencyLedger::request_hash(b"{\"workspace\":\"w1\"}");
        let b = IdempotencyLedger::request_hash(b"{\"workspace\":\"w1\"}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_request_hash_differs() {
        let a = IdempotencyLedger::request_hash(b"one");
        let b = IdempotencyLedger::request_hash(b"two");
        assert_ne!(a, b);
    }
}
