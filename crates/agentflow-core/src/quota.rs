// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quota accounting over plan limits.
//!
//! Limits are compiled in per plan tag; usage lives in the `quota_usage`
//! table as (used, reserved) pairs. Reservations are guarded at the
//! database so usage never exceeds the limit at any observable
//! intermediate state.

use std::sync::Arc;

use strum::{Display, EnumString};

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;

/// Quota dimensions tracked per workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum QuotaDimension {
    /// Provisioned tenant database storage, in GB.
    DbStorageGb,
    /// Custom domains bound to the workspace.
    CustomDomains,
    /// Concurrent export jobs.
    ExportJobs,
}

/// Compiled-in plan limit for a dimension.
///
/// Unknown plan tags fall back to the free tier.
pub fn plan_limit(plan: &str, dimension: QuotaDimension) -> i64 {
    match (plan, dimension) {
        ("enterprise", QuotaDimension::DbStorageGb) => 500,
        ("enterprise", QuotaDimension::CustomDomains) => 100,
        ("enterprise", QuotaDimension::ExportJobs) => 20,
        ("pro", QuotaDimension::DbStorageGb) => 50,
        ("pro", QuotaDimension::CustomDomains) => 20,
        ("pro", QuotaDimension::ExportJobs) => 10,
        ("starter", QuotaDimension::DbStorageGb) => 5,
        ("starter", QuotaDimension::CustomDomains) => 5,
        ("starter", QuotaDimension::ExportJobs) => 5,
        (_, QuotaDimension::DbStorageGb) => 1,
        (_, QuotaDimension::CustomDomains) => 1,
        (_, QuotaDimension::ExportJobs) => 2,
    }
}

/// Reads plan limits and reserves/consumes dimension-typed quota.
#[derive(Clone)]
pub struct QuotaAccountant {
    persistence: Arc<dyn Persistence>,
}

impl QuotaAccountant {
    /// Create an accountant over the given persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Reserve `amount` in a dimension against the workspace's plan limit.
    pub async fn reserve(
        &self,
        workspace_id: &str,
        plan: &str,
        dimension: QuotaDimension,
        amount: i64,
    ) -> Result<()> {
        let limit = plan_limit(plan, dimension);
        let reserved = self
            .persistence
            .quota_reserve(workspace_id, &dimension.to_string(), amount, limit)
            .await?;

        if !reserved {
            let (used, pending) = self
                .persistence
                .quota_usage(workspace_id, &dimension.to_string())
                .await?;
            return Err(CoreError::QuotaExceeded {
                dimension: dimension.to_string(),
                limit,
                used: used + pending,
            });
        }

        Ok(())
    }

    /// Move a reservation into consumed usage.
    pub async fn consume(
        &self,
        workspace_id: &str,
        dimension: QuotaDimension,
        amount: i64,
    ) -> Result<()> {
        self.persistence
            .quota_consume(workspace_id, &dimension.to_string(), amount)
            .await
    }

    /// Return a reservation without consuming it.
    pub async fn release(
        &self,
        workspace_id: &str,
        dimension: QuotaDimension,
        amount: i64,
    ) -> Result<()> {
        self.persistence
            .quota_release(workspace_id, &dimension.to_string(), amount)
            .await
    }

    /// Current (used, reserved) for a dimension.
    pub async fn usage(
        &self,
        workspace_id: &str,
        dimension: QuotaDimension,
    ) -> Result<(i64, i64)> {
        self.persistence
            .quota_usage(workspace_id, &dimension.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_serialization() {
        assert_eq!(QuotaDimension::DbStorageGb.to_string(), "db_storage_gb");
        assert_eq!(
            "custom_domains".parse::<QuotaDimension>().unwrap(),
            QuotaDimension::CustomDomains
        );
    }

    #[test]
    fn test_plan_limits_monotonic() {
        for dimension in [
            QuotaDimension::DbStorageGb,
            QuotaDimension::CustomDomains,
            QuotaDimension::ExportJobs,
        ] {
            let free = plan_limit("free", dimension);
            let starter = plan_limit("starter", dimension);
            let pro = plan_limit("pro", dimension);
            let enterprise = plan_limit("enterprise", dimension);
            assert!(free <= starter && starter <= pro && pro <= enterprise);
        }
    }

    #[test]
    fn test_unknown_plan_falls_back_to_free() {
        assert_eq!(
            plan_limit("no-such-plan", QuotaDimension::DbStorageGb),
            plan_limit("free", QuotaDimension::DbStorageGb)
        );
    }
}
