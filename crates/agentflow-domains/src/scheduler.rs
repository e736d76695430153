// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background driver for domain verification retries, first issuance,
//! and certificate renewal.
//!
//! The request layer performs the first verification attempt; this
//! scheduler picks up everything that is time-gated afterwards. Each
//! tick processes small batches so one slow issuer cannot starve the
//! loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::lifecycle::DomainLifecycle;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct DomainSchedulerConfig {
    /// How often to look for due domains.
    pub poll_interval: Duration,
    /// Maximum domains per category per tick.
    pub batch_size: i64,
}

impl Default for DomainSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 20,
        }
    }
}

impl DomainSchedulerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `AGENTFLOW_DOMAIN_POLL_INTERVAL_SECS`: seconds between ticks (default: 60)
    /// - `AGENTFLOW_DOMAIN_BATCH_SIZE`: domains per category per tick (default: 20)
    pub fn from_env() -> Self {
        let poll_interval_secs = std::env::var("AGENTFLOW_DOMAIN_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let batch_size = std::env::var("AGENTFLOW_DOMAIN_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        Self {
            poll_interval: Duration::from_secs(poll_interval_secs),
            batch_size,
        }
    }
}

/// Background scheduler for the domain lifecycle engine.
pub struct DomainScheduler {
    engine: Arc<DomainLifecycle>,
    persistence: Arc<dyn agentflow_core::persistence::Persistence>,
    config: DomainSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl DomainScheduler {
    /// Create a new scheduler.
    pub fn new(
        engine: Arc<DomainLifecycle>,
        persistence: Arc<dyn agentflow_core::persistence::Persistence>,
        config: DomainSchedulerConfig,
    ) -> Self {
        Self {
            engine,
            persistence,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Domain scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Domain scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Domain scheduler tick failed");
                    }
                }
            }
        }

        info!("Domain scheduler stopped");
    }

    /// One scheduler pass: verification retries, first issuance, renewals.
    pub async fn tick(&self) -> agentflow_core::Result<()> {
        let now = Utc::now();
        let max_attempts = self.engine.config().verify_max_attempts;

        let due = self
            .persistence
            .domains_due_for_verification(now, max_attempts, self.config.batch_size)
            .await?;
        for domain in due {
            match self.engine.verify(&domain.id, now).await {
                Ok(record) => debug!(domain = %record.domain, status = %record.status, "Retried verification"),
                Err(e) => debug!(domain = %domain.domain, error = %e, "Verification retry skipped"),
            }
        }

        let awaiting = self
            .persistence
            .domains_awaiting_issuance(
                now,
                self.engine.config().ssl_max_attempts,
                self.config.batch_size,
            )
            .await?;
        for domain in awaiting {
            match self.engine.issue(&domain.id, now).await {
                Ok(record) => debug!(domain = %record.domain, ssl_status = %record.ssl_status, "Issuance attempted"),
                Err(e) => debug!(domain = %domain.domain, error = %e, "Issuance skipped"),
            }
        }

        let window_end = now
            + chrono::Duration::from_std(self.engine.config().renew_window)
                .unwrap_or_else(|_| chrono::Duration::days(30));
        let renewable = self
            .persistence
            .domains_due_for_renewal(now, window_end, self.config.batch_size)
            .await?;
        for domain in renewable {
            match self.engine.renew(&domain.id, now).await {
                Ok(record) => debug!(domain = %record.domain, ssl_status = %record.ssl_status, "Renewal attempted"),
                Err(e) => debug!(domain = %domain.domain, error = %e, "Renewal skipped"),
            }
        }

        Ok(())
    }
}
