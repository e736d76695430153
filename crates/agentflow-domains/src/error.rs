// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for agentflow-domains.

use thiserror::Error;

/// Domain lifecycle errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Control-plane operation failed.
    #[error("Core error: {0}")]
    Core(#[from] agentflow_core::CoreError),

    /// The routing executor rejected an activation or rollback.
    /// Repository state is unchanged.
    #[error("Routing failed for {domain}: {reason}")]
    RoutingFailed {
        /// The domain being routed.
        domain: String,
        /// The executor's error.
        reason: String,
    },
}

/// Result type using the domain lifecycle Error.
pub type Result<T> = std::result::Result<T, Error>;
