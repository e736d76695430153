// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AgentFlow Core - Control-Plane Foundation
//!
//! This crate provides the shared substrate for the agentflow control
//! plane: persistence, secret storage, quota accounting, the idempotency
//! ledger, and the runtime event recorder. The lifecycle engines
//! (`agentflow-tenantdb`, `agentflow-domains`, `agentflow-archive`) and
//! the daemon (`agentflow-control`) build on it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Request Layer                            │
//! │          (authn/authz, routing - external to the core)          │
//! └─────────────────────────────────────────────────────────────────┘
//!            │                    │                     │
//!            ▼                    ▼                     ▼
//! ┌───────────────┐   ┌──────────────────┐   ┌──────────────────────┐
//! │ Tenant DB     │   │ Domain Lifecycle │   │ Retention / Archival │
//! │ Engine        │   │ Engine           │   │ Pipeline             │
//! └───────┬───────┘   └────────┬─────────┘   └──────────┬───────────┘
//!         │                    │                        │
//!         └────────┬───────────┴───────────┬────────────┘
//!                  ▼                       ▼
//!       ┌────────────────────┐   ┌──────────────────────┐
//!       │ agentflow-core     │   │ Event Recorder       │
//!       │ (this crate)       │   │ (batched, bounded)   │
//!       │ Persistence/Quota/ │   └──────────────────────┘
//!       │ Secrets/Ledger     │
//!       └─────────┬──────────┘
//!                 ▼
//!       ┌────────────────────┐
//!       │ PostgreSQL         │
//!       │ (SQLite embedded)  │
//!       └────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: Control-plane configuration from environment variables
//! - [`error`]: Unified error kinds with named-field side data
//! - [`secrets`]: AES-256-GCM secret store with `enc:` envelopes
//! - [`persistence`]: Persistence trait + PostgreSQL/SQLite backends
//! - [`migrations`]: Embedded control-plane schema migrations
//! - [`idempotency`]: At-most-once ledger for provisioning actions
//! - [`events`]: Async batched runtime event recorder
//! - [`quota`]: Plan limits and dimension-typed quota accounting

#![deny(missing_docs)]

/// Control-plane configuration loaded from environment variables.
pub mod config;

/// Error types shared across the control plane.
pub mod error;

/// Symmetric secret store for credentials and tokens.
pub mod secrets;

/// Persistence trait and backend implementations.
pub mod persistence;

/// Embedded control-plane schema migrations.
pub mod migrations;

/// At-most-once ledger for long-running provisioning actions.
pub mod idempotency;

/// Async, batched runtime event recorder.
pub mod events;

/// Plan limits and quota accounting.
pub mod quota;

pub use config::Config;
pub use error::{CoreError, Result};
pub use secrets::SecretStore;
