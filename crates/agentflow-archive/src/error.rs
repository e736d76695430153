// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for agentflow-archive.

use thiserror::Error;

/// Retention and archival errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Control-plane operation failed.
    #[error("Core error: {0}")]
    Core(#[from] agentflow_core::CoreError),

    /// Filesystem operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Zip read/write failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON encode/decode failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A replay line exceeded the line-size cap.
    #[error("Archive line exceeds {max} bytes")]
    LineTooLong {
        /// The configured cap.
        max: usize,
    },
}

/// Result type using the archive Error.
pub type Result<T> = std::result::Result<T, Error>;
