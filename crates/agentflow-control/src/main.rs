// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AgentFlow Control-Plane Daemon
//!
//! Hosts the background side of the control plane:
//! - Event writer (batched runtime event persistence)
//! - Domain scheduler (verification retries, issuance, renewals)
//! - Retention scheduler (log expiry, cold storage, purges)
//! - Archive worker (zip artifacts with manifest and checksum)

use agentflow_core::Config;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentflow=info,agentflow_control=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        archive_base = %config.archive_base_path.display(),
        log_archive_enabled = config.log_archive_enabled,
        cleanup_interval_secs = config.cleanup_interval.as_secs(),
        "Starting AgentFlow control plane"
    );

    let runtime = agentflow_control::runtime::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await;

    info!("AgentFlow control plane shut down");

    Ok(())
}
