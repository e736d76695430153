// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable control-plane runtime.
//!
//! Connects the control-plane database, runs migrations, builds the
//! lifecycle engines, and spawns the background tasks (event writer,
//! retention scheduler, archive worker, domain scheduler). The request
//! layer reaches the engines through the runtime handle; `shutdown`
//! stops every task and drains the event recorder.

use std::sync::Arc;

use agentflow_archive::{ArchiveWorker, ArchiveWorkerConfig, RetentionConfig, RetentionScheduler};
use agentflow_core::events::{EventRecorder, EventRecorderConfig};
use agentflow_core::persistence::{Persistence, PostgresPersistence};
use agentflow_core::{Config, SecretStore, migrations};
use agentflow_domains::{
    CertificateIssuer, DomainConfig, DomainLifecycle, DomainRoutingExecutor, DomainScheduler,
    DomainSchedulerConfig, DnsResolver, SystemDnsResolver,
};
use agentflow_tenantdb::{SchemaChangeReviewer, TenantDbConfig, TenantDbEngine};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Running control-plane runtime.
pub struct ControlRuntime {
    /// Shared persistence backend.
    pub persistence: Arc<dyn Persistence>,
    /// Event recorder handed to request-layer services.
    pub recorder: EventRecorder,
    /// Tenant database engine, when an admin DSN is configured.
    pub tenantdb: Option<Arc<TenantDbEngine>>,
    /// Schema change reviewer, when the tenant engine is available.
    pub reviewer: Option<Arc<SchemaChangeReviewer>>,
    /// Domain lifecycle engine.
    pub domains: Arc<DomainLifecycle>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_handles: Vec<Arc<Notify>>,
}

/// Build and start the runtime from configuration.
pub async fn start(config: Config) -> anyhow::Result<ControlRuntime> {
    start_with_resolver(config, None).await
}

/// Start with an explicit DNS resolver (tests inject a mock here).
pub async fn start_with_resolver(
    config: Config,
    dns: Option<Arc<dyn DnsResolver>>,
) -> anyhow::Result<ControlRuntime> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    migrations::run_postgres(&pool).await?;
    info!("Control-plane schema verified");

    let persistence: Arc<dyn Persistence> = Arc::new(PostgresPersistence::new(pool));
    let secrets = SecretStore::from_base64(&config.secret_key)?;

    let (recorder, writer) = agentflow_core::events::recorder(
        persistence.clone(),
        EventRecorderConfig::default(),
    );

    let mut tasks = Vec::new();
    let mut shutdown_handles = Vec::new();

    shutdown_handles.push(writer.shutdown_handle());
    tasks.push((
        "event-writer",
        tokio::spawn(async move { writer.run().await }),
    ));

    // Tenant engine only where an admin MySQL DSN is configured.
    let tenantdb = match &config.tenant_database_url {
        Some(_) => {
            let tenant_config = TenantDbConfig::from_env()?;
            let engine = TenantDbEngine::connect(
                tenant_config,
                persistence.clone(),
                secrets.clone(),
                recorder.clone(),
            )
            .await?;
            Some(Arc::new(engine))
        }
        None => {
            warn!("No tenant database DSN configured; tenant engine disabled");
            None
        }
    };

    let reviewer = tenantdb.as_ref().map(|engine| {
        Arc::new(SchemaChangeReviewer::new(
            persistence.clone(),
            engine.clone(),
            recorder.clone(),
        ))
    });

    let dns: Arc<dyn DnsResolver> = match dns {
        Some(dns) => dns,
        None => Arc::new(SystemDnsResolver::from_system_conf().map_err(|e| {
            anyhow::anyhow!("failed to initialize DNS resolver: {}", e)
        })?),
    };

    let issuer = CertificateIssuer::from_config(
        config.cert_issuer_url.as_deref(),
        config.cert_issuer_token.as_deref(),
    );
    let routing = DomainRoutingExecutor::from_config(
        config.routing_url.as_deref(),
        config.routing_token.as_deref(),
    );
    info!(
        issuer = issuer.kind(),
        routing = routing.kind(),
        "Domain collaborators selected"
    );

    let domains = Arc::new(DomainLifecycle::new(
        persistence.clone(),
        recorder.clone(),
        dns,
        issuer,
        routing,
        DomainConfig::from_core(&config),
    ));

    let domain_scheduler = DomainScheduler::new(
        domains.clone(),
        persistence.clone(),
        DomainSchedulerConfig::from_env(),
    );
    shutdown_handles.push(domain_scheduler.shutdown_handle());
    tasks.push((
        "domain-scheduler",
        tokio::spawn(async move { domain_scheduler.run().await }),
    ));

    let retention = RetentionScheduler::new(
        persistence.clone(),
        recorder.clone(),
        RetentionConfig::from_core(&config),
    );
    shutdown_handles.push(retention.shutdown_handle());
    tasks.push((
        "retention-scheduler",
        tokio::spawn(async move { retention.run().await }),
    ));

    let archive_worker = ArchiveWorker::new(
        persistence.clone(),
        recorder.clone(),
        config.archive_base_path.clone(),
        ArchiveWorkerConfig::from_env(),
    );
    shutdown_handles.push(archive_worker.shutdown_handle());
    tasks.push((
        "archive-worker",
        tokio::spawn(async move { archive_worker.run().await }),
    ));

    info!("Control runtime started");

    Ok(ControlRuntime {
        persistence,
        recorder,
        tenantdb,
        reviewer,
        domains,
        tasks,
        shutdown_handles,
    })
}

impl ControlRuntime {
    /// Stop every background task and drain the event recorder.
    pub async fn shutdown(self) {
        for handle in &self.shutdown_handles {
            handle.notify_waiters();
        }

        for (name, task) in self.tasks {
            match tokio::time::timeout(std::time::Duration::from_secs(10), task).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task panicked"),
                Err(_) => warn!(task = name, "Task did not stop in time"),
            }
        }

        info!("Control runtime shut down");
    }
}
