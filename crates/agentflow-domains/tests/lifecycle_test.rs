// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the domain lifecycle engine against in-memory
//! persistence, a mock resolver, and no-op collaborators.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use agentflow_core::CoreError;
use agentflow_core::events::{EventRecorderConfig, recorder};
use agentflow_core::persistence::{
    Persistence, SqlitePersistence, WorkspaceRecord, new_record_id,
};
use agentflow_domains::dns::MockDnsResolver;
use agentflow_domains::lifecycle::{DomainConfig, DomainLifecycle};
use agentflow_domains::scheduler::{DomainScheduler, DomainSchedulerConfig};
use agentflow_domains::{CertificateIssuer, DomainRoutingExecutor, Error};
use chrono::{Duration, Utc};

struct Fixture {
    persistence: Arc<dyn Persistence>,
    dns: Arc<MockDnsResolver>,
    engine: Arc<DomainLifecycle>,
    workspace: WorkspaceRecord,
}

async fn fixture() -> Fixture {
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::in_memory().await.unwrap());

    let now = Utc::now();
    let workspace = WorkspaceRecord {
        id: new_record_id(),
        owner_id: new_record_id(),
        slug: "acme".to_string(),
        plan: "pro".to_string(),
        status: "active".to_string(),
        region: "eu-central".to_string(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    persistence.create_workspace(&workspace).await.unwrap();

    let (events, _writer) = recorder(persistence.clone(), EventRecorderConfig::default());
    let dns = Arc::new(MockDnsResolver::new());

    let engine = Arc::new(DomainLifecycle::new(
        persistence.clone(),
        events,
        dns.clone(),
        CertificateIssuer::from_config(None, None),
        DomainRoutingExecutor::from_config(None, None),
        DomainConfig::default(),
    ));

    Fixture {
        persistence,
        dns,
        engine,
        workspace,
    }
}

#[tokio::test]
async fn test_verify_happy_path_via_txt() {
    let f = fixture().await;
    let now = Utc::now();

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "App.Example.Com")
        .await
        .unwrap();
    assert_eq!(domain.domain, "app.example.com");
    assert_eq!(domain.status, "pending");

    f.dns.set_txt(
        "_agentflow.app.example.com",
        &[&domain.verification_token],
    );

    let verified = f.engine.verify(&domain.id, now).await.unwrap();
    assert_eq!(verified.status, "verified");
    assert_eq!(verified.verification_attempts, 0);
    assert!(verified.next_retry_at.is_none());
    assert!(verified.support_url.is_none());
}

#[tokio::test]
async fn test_verify_via_cname_with_normalization() {
    let f = fixture().await;
    let now = Utc::now();

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "shop.example.com")
        .await
        .unwrap();

    // No TXT; CNAME differs only in case and trailing dot.
    f.dns.set_cname("shop.example.com", "Apps.Agentflow.DEV.");

    let verified = f.engine.verify(&domain.id, now).await.unwrap();
    assert_eq!(verified.status, "verified");
}

#[tokio::test]
async fn test_verify_backoff_attempts_and_support_url() {
    let f = fixture().await;
    let mut now = Utc::now();

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "app.example.com")
        .await
        .unwrap();

    // Attempt 1: 5 minute backoff.
    let r1 = f.engine.verify(&domain.id, now).await.unwrap();
    assert_eq!(r1.status, "failed");
    assert_eq!(r1.verification_attempts, 1);
    assert_eq!(r1.next_retry_at.unwrap(), now + Duration::minutes(5));
    assert!(r1.support_url.is_none());

    // Attempt 2: 10 minutes.
    now = r1.next_retry_at.unwrap();
    let r2 = f.engine.verify(&domain.id, now).await.unwrap();
    assert_eq!(r2.verification_attempts, 2);
    assert_eq!(r2.next_retry_at.unwrap(), now + Duration::minutes(10));
    assert!(r2.support_url.is_none());

    // Attempt 3: 20 minutes and a support link.
    now = r2.next_retry_at.unwrap();
    let r3 = f.engine.verify(&domain.id, now).await.unwrap();
    assert_eq!(r3.verification_attempts, 3);
    assert_eq!(r3.next_retry_at.unwrap(), now + Duration::minutes(20));
    let support_url = r3.support_url.clone().unwrap();
    assert!(!support_url.is_empty());

    // A fourth call inside the window is rate limited.
    let err = f
        .engine
        .verify(&domain.id, now + Duration::minutes(1))
        .await
        .unwrap_err();
    match err {
        Error::Core(CoreError::RetryLater { next_retry_at, .. }) => {
            assert_eq!(next_retry_at, r3.next_retry_at.unwrap());
        }
        other => panic!("expected RetryLater, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dns_outage_counts_as_failed_attempt() {
    let f = fixture().await;
    let now = Utc::now();

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "app.example.com")
        .await
        .unwrap();

    f.dns.fail_lookups(true);
    let result = f.engine.verify(&domain.id, now).await.unwrap();
    assert_eq!(result.status, "failed");
    assert_eq!(result.verification_attempts, 1);
}

#[tokio::test]
async fn test_issue_applies_default_expiry() {
    let f = fixture().await;
    let now = Utc::now();

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "app.example.com")
        .await
        .unwrap();
    f.dns
        .set_txt("_agentflow.app.example.com", &[&domain.verification_token]);
    f.engine.verify(&domain.id, now).await.unwrap();

    let issued = f.engine.issue(&domain.id, now).await.unwrap();
    assert_eq!(issued.status, "verified");
    assert_eq!(issued.ssl_status, "issued");
    assert_eq!(issued.ssl_issued_at.unwrap(), now);
    // The no-op issuer reports no expiry; the engine assumes 90 days.
    assert_eq!(issued.ssl_expires_at.unwrap(), now + Duration::days(90));
    assert_eq!(issued.ssl_issue_attempts, 0);
}

#[tokio::test]
async fn test_issue_requires_verified_domain() {
    let f = fixture().await;

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "app.example.com")
        .await
        .unwrap();

    let err = f.engine.issue(&domain.id, Utc::now()).await.unwrap_err();
    assert!(matches!(err, Error::Core(CoreError::NotReady { .. })));
}

#[tokio::test]
async fn test_activate_enforces_single_active_per_app() {
    let f = fixture().await;
    let now = Utc::now();

    let mut ids = Vec::new();
    for name in ["one.example.com", "two.example.com"] {
        let domain = f.engine.create(&f.workspace, Some("app1"), name).await.unwrap();
        f.dns.set_txt(
            &format!("_agentflow.{}", name),
            &[&domain.verification_token],
        );
        f.engine.verify(&domain.id, now).await.unwrap();
        f.engine.issue(&domain.id, now).await.unwrap();
        ids.push(domain.id);
    }

    let first = f.engine.activate(&ids[0]).await.unwrap();
    assert_eq!(first.status, "active");

    let second = f.engine.activate(&ids[1]).await.unwrap();
    assert_eq!(second.status, "active");

    // The previously active domain went back to verified.
    let demoted = f.persistence.get_custom_domain(&ids[0]).await.unwrap().unwrap();
    assert_eq!(demoted.status, "verified");

    let active = f
        .persistence
        .get_active_domain_for_app("app1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.id, ids[1]);
}

#[tokio::test]
async fn test_rollback_returns_to_verified() {
    let f = fixture().await;
    let now = Utc::now();

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "app.example.com")
        .await
        .unwrap();
    f.dns
        .set_txt("_agentflow.app.example.com", &[&domain.verification_token]);
    f.engine.verify(&domain.id, now).await.unwrap();
    f.engine.issue(&domain.id, now).await.unwrap();
    f.engine.activate(&domain.id).await.unwrap();

    let rolled_back = f.engine.rollback(&domain.id).await.unwrap();
    assert_eq!(rolled_back.status, "verified");
    // The certificate survives a rollback.
    assert_eq!(rolled_back.ssl_status, "issued");
}

#[tokio::test]
async fn test_block_and_unblock_restore_prior_state() {
    let f = fixture().await;
    let now = Utc::now();

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "app.example.com")
        .await
        .unwrap();
    f.dns
        .set_txt("_agentflow.app.example.com", &[&domain.verification_token]);
    f.engine.verify(&domain.id, now).await.unwrap();

    let blocked = f.engine.block(&domain.id, "abuse report").await.unwrap();
    assert_eq!(blocked.status, "blocked");
    assert_eq!(blocked.blocked_reason.as_deref(), Some("abuse report"));

    // Blocked is terminal for verification.
    let err = f.engine.verify(&domain.id, now).await.unwrap_err();
    assert!(matches!(err, Error::Core(CoreError::NotReady { .. })));

    let unblocked = f.engine.unblock(&domain.id).await.unwrap();
    assert_eq!(unblocked.status, "verified");
    assert!(unblocked.blocked_reason.is_none());
}

#[tokio::test]
async fn test_unblock_of_never_verified_domain_goes_to_pending() {
    let f = fixture().await;

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "app.example.com")
        .await
        .unwrap();
    f.engine.block(&domain.id, "spam").await.unwrap();

    let unblocked = f.engine.unblock(&domain.id).await.unwrap();
    assert_eq!(unblocked.status, "pending");
}

#[tokio::test]
async fn test_renew_requires_expiry_window() {
    let f = fixture().await;
    let now = Utc::now();

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "app.example.com")
        .await
        .unwrap();
    f.dns
        .set_txt("_agentflow.app.example.com", &[&domain.verification_token]);
    f.engine.verify(&domain.id, now).await.unwrap();
    f.engine.issue(&domain.id, now).await.unwrap();

    // 90 days out: not renewable yet.
    let err = f.engine.renew(&domain.id, now).await.unwrap_err();
    assert!(matches!(err, Error::Core(CoreError::NotReady { .. })));

    // 70 days later the certificate is 20 days from expiry.
    let later = now + Duration::days(70);
    let renewed = f.engine.renew(&domain.id, later).await.unwrap();
    assert_eq!(renewed.ssl_status, "issued");
    assert_eq!(renewed.ssl_expires_at.unwrap(), later + Duration::days(90));
}

#[tokio::test]
async fn test_invalid_domain_is_rejected_before_any_row() {
    let f = fixture().await;

    for bad in ["", "localhost", "bad_host.example.com", "-x.example.com"] {
        let err = f.engine.create(&f.workspace, None, bad).await.unwrap_err();
        assert!(
            matches!(err, Error::Core(CoreError::InvalidInput { .. })),
            "{} should be rejected",
            bad
        );
    }
}

#[tokio::test]
async fn test_duplicate_domain_conflicts() {
    let f = fixture().await;

    f.engine
        .create(&f.workspace, Some("app1"), "app.example.com")
        .await
        .unwrap();
    let err = f
        .engine
        .create(&f.workspace, Some("app2"), "APP.example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Core(CoreError::Conflict { .. })));
}

#[tokio::test]
async fn test_scheduler_tick_retries_due_verification() {
    let f = fixture().await;
    let now = Utc::now();

    let domain = f
        .engine
        .create(&f.workspace, Some("app1"), "app.example.com")
        .await
        .unwrap();

    // First verification fails and schedules a retry.
    let failed = f.engine.verify(&domain.id, now).await.unwrap();
    assert_eq!(failed.status, "failed");

    // The operator fixes DNS; the due list stays empty until the gate opens.
    f.dns
        .set_txt("_agentflow.app.example.com", &[&domain.verification_token]);
    let due_now = f
        .persistence
        .domains_due_for_verification(now, 3, 10)
        .await
        .unwrap();
    assert!(due_now.is_empty());

    let gate_open = failed.next_retry_at.unwrap() + Duration::seconds(1);
    let due_later = f
        .persistence
        .domains_due_for_verification(gate_open, 3, 10)
        .await
        .unwrap();
    assert_eq!(due_later.len(), 1);

    // Pull the gate into the past so a real tick picks the domain up.
    let mut reopened = failed.clone();
    reopened.next_retry_at = Some(now - Duration::seconds(1));
    f.persistence.update_custom_domain(&reopened).await.unwrap();

    let scheduler = DomainScheduler::new(
        f.engine.clone(),
        f.persistence.clone(),
        DomainSchedulerConfig {
            poll_interval: StdDuration::from_secs(60),
            batch_size: 10,
        },
    );
    scheduler.tick().await.unwrap();

    let verified = f
        .persistence
        .get_custom_domain(&domain.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verified.status, "verified");
}
