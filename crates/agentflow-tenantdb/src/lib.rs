// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AgentFlow Tenant Database Engine
//!
//! Each workspace owns one dedicated MySQL database. This crate
//! provisions it, rotates its credentials, applies the shipped tenant
//! migrations under an advisory lock, copies it into timestamped sibling
//! backups, and restores from them. Destructive schema changes proposed
//! by tenants go through the two-phase [`reviewer`].
//!
//! # Provisioning sequence
//!
//! ```text
//! Provision(workspace)
//!   ├─ ready row exists ──────────────► return it (no-op)
//!   ├─ idempotency ledger begin ──────► replay / in-progress / started
//!   ├─ reserve db_storage_gb quota
//!   └─ up to 3 attempts, 300ms..3s backoff, rollback between:
//!        CREATE DATABASE (utf8mb4)
//!        CREATE USER + GRANT + FLUSH PRIVILEGES
//!        connect as tenant, apply shipped migrations
//!        encrypt password -> enc: envelope -> status ready
//! ```
//!
//! Every identifier spliced into DDL passes the safety check in
//! [`ident`]; string literals are escaped. The engine keeps one cached
//! connection pool per workspace, evicted on rotation and on failure.
//!
//! # Modules
//!
//! - [`engine`]: Provision / rotate / migrate / backup / restore
//! - [`reviewer`]: Two-phase review+execute of tenant DDL bundles
//! - [`migrate`]: Compiled-in tenant migration list and runner
//! - [`ident`]: Identifier safety and deterministic naming
//! - [`error`]: Engine error types

#![deny(missing_docs)]

/// Error types for the tenant database engine.
pub mod error;

/// Identifier safety and deterministic tenant naming.
pub mod ident;

/// Compiled-in tenant migrations and the advisory-locked runner.
pub mod migrate;

/// The tenant database lifecycle engine.
pub mod engine;

/// Two-phase schema change review.
pub mod reviewer;

pub use engine::{BackupInfo, RestoreInfo, TenantDbConfig, TenantDbEngine};
pub use error::{Error, Result};
pub use reviewer::SchemaChangeReviewer;
