// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AgentFlow Control-Plane Runtime
//!
//! Library form of the daemon: products embedding the control plane
//! call [`runtime::start`] with a [`agentflow_core::Config`] and get a
//! handle to the engines plus running background tasks.

#![deny(missing_docs)]

/// Embeddable runtime: wiring and lifecycle of the background tasks.
pub mod runtime;

pub use runtime::{ControlRuntime, start};
