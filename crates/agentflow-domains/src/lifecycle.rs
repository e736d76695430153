// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Custom domain lifecycle engine.
//!
//! State machine per domain:
//!
//! ```text
//! pending ──verify──► verifying ──DNS ok──► verified
//!                           ├─fail, attempts < N──► failed (retry scheduled)
//!                           └─fail, attempts ≥ N──► failed (support required)
//! verified ──issue──► issuing ──ok──► issued   (status stays verified)
//! issued   ──activate──► active  (exactly one per app)
//! active   ──rollback──► verified
//! any      ──block──► blocked ──unblock──► pending | verified
//! ```
//!
//! A domain proves DNS control through EITHER a TXT record containing
//! its token OR a CNAME pointing at the configured base host. Failed
//! verifications and issuances back off exponentially and are
//! time-gated by their `next_retry_at` columns.

use std::sync::Arc;
use std::time::Duration;

use agentflow_core::error::CoreError;
use agentflow_core::events::{Event, EventRecorder};
use agentflow_core::persistence::{
    CustomDomainRecord, DomainStatus, Persistence, SslStatus, WorkspaceRecord, new_record_id,
};
use agentflow_core::quota::{QuotaAccountant, QuotaDimension};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{info, warn};

use crate::dns::{DnsResolver, normalize_domain, normalize_host};
use crate::error::{Error, Result};
use crate::issuer::{CertificateIssuer, IssueAction, IssueOutcome, IssueRequest, VerificationPayload};
use crate::routing::{DomainRoutingExecutor, RoutingAction, RoutingRequest};

/// Lifecycle engine configuration.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Owner-name prefix for verification TXT records.
    pub txt_prefix: String,
    /// Expected CNAME target; also the routing target host.
    pub base_host: String,
    /// Base URL handed to the routing executor.
    pub target_base_url: String,
    /// Base URL for operator-facing support links.
    pub support_url_base: String,
    /// Verification attempts before support is required.
    pub verify_max_attempts: i32,
    /// First verification retry delay; doubled per attempt.
    pub verify_backoff_base: Duration,
    /// Issuance attempts before support is required.
    pub ssl_max_attempts: i32,
    /// First issuance retry delay; doubled per attempt.
    pub ssl_backoff_base: Duration,
    /// Retry delay ceiling for both counters.
    pub backoff_max: Duration,
    /// Renewals are allowed this close to expiry.
    pub renew_window: Duration,
    /// Expiry assumed when the issuer does not report one.
    pub default_cert_lifetime: Duration,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            txt_prefix: "_agentflow".to_string(),
            base_host: "apps.agentflow.dev".to_string(),
            target_base_url: "https://apps.agentflow.dev".to_string(),
            support_url_base: "https://support.agentflow.dev".to_string(),
            verify_max_attempts: 3,
            verify_backoff_base: Duration::from_secs(5 * 60),
            ssl_max_attempts: 3,
            ssl_backoff_base: Duration::from_secs(10 * 60),
            backoff_max: Duration::from_secs(24 * 3600),
            renew_window: Duration::from_secs(30 * 24 * 3600),
            default_cert_lifetime: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

impl DomainConfig {
    /// Derive the lifecycle config from the control-plane config.
    pub fn from_core(config: &agentflow_core::Config) -> Self {
        let mut this = Self {
            txt_prefix: config.domain_txt_prefix.clone(),
            support_url_base: config.support_url_base.clone(),
            ..Self::default()
        };
        if let Some(host) = &config.domain_base_host {
            this.base_host = host.clone();
            this.target_base_url = format!("https://{}", host);
        }
        this
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, clamped.
pub fn backoff_delay(base: Duration, attempt: i32, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).clamp(0, 30) as u32;
    base.saturating_mul(2u32.saturating_pow(shift)).min(max)
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(24))
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Custom domain lifecycle engine.
pub struct DomainLifecycle {
    persistence: Arc<dyn Persistence>,
    quota: QuotaAccountant,
    recorder: EventRecorder,
    dns: Arc<dyn DnsResolver>,
    issuer: CertificateIssuer,
    routing: DomainRoutingExecutor,
    config: DomainConfig,
}

impl DomainLifecycle {
    /// Build the engine from its collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        recorder: EventRecorder,
        dns: Arc<dyn DnsResolver>,
        issuer: CertificateIssuer,
        routing: DomainRoutingExecutor,
        config: DomainConfig,
    ) -> Self {
        Self {
            quota: QuotaAccountant::new(persistence.clone()),
            persistence,
            recorder,
            dns,
            issuer,
            routing,
            config,
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// Register a domain for a workspace (and optionally an app).
    ///
    /// The name is lower-cased and FQDN-normalized; a fresh verification
    /// token is attached. Fails with `Conflict` when the domain exists.
    pub async fn create(
        &self,
        workspace: &WorkspaceRecord,
        app_id: Option<&str>,
        domain: &str,
    ) -> Result<CustomDomainRecord> {
        let normalized = normalize_domain(domain).ok_or_else(|| {
            Error::Core(CoreError::invalid_input(
                "domain",
                "not a valid fully-qualified domain name",
            ))
        })?;

        self.quota
            .reserve(&workspace.id, &workspace.plan, QuotaDimension::CustomDomains, 1)
            .await
            .map_err(Error::Core)?;

        let now = Utc::now();
        let record = CustomDomainRecord {
            id: new_record_id(),
            workspace_id: workspace.id.clone(),
            app_id: app_id.map(|s| s.to_string()),
            domain: normalized,
            verification_token: generate_token(),
            status: DomainStatus::Pending.to_string(),
            ssl_status: SslStatus::Pending.to_string(),
            verification_attempts: 0,
            next_retry_at: None,
            ssl_issue_attempts: 0,
            ssl_next_retry_at: None,
            ssl_issued_at: None,
            ssl_expires_at: None,
            blocked_reason: None,
            prior_status: None,
            support_url: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.persistence.insert_custom_domain(&record).await {
            // The row was never created; hand the reservation back.
            let _ = self
                .quota
                .release(&workspace.id, QuotaDimension::CustomDomains, 1)
                .await;
            return Err(Error::Core(e));
        }

        self.quota
            .consume(&workspace.id, QuotaDimension::CustomDomains, 1)
            .await
            .map_err(Error::Core)?;

        Ok(record)
    }

    /// Attempt DNS verification.
    ///
    /// Time-gated by `next_retry_at`; early calls fail with `RetryLater`.
    /// A DNS miss is not an error: the returned record carries the new
    /// attempt count, retry time, and, once attempts are exhausted, a
    /// support URL.
    pub async fn verify(&self, domain_id: &str, now: DateTime<Utc>) -> Result<CustomDomainRecord> {
        let mut record = self.require_domain(domain_id).await?;
        let status = parse_status(&record.status)?;

        match status {
            DomainStatus::Blocked => {
                return Err(Error::Core(CoreError::NotReady {
                    resource: "custom_domain".to_string(),
                    status: record.status,
                }));
            }
            DomainStatus::Verified | DomainStatus::Active => return Ok(record),
            _ => {}
        }

        if let Some(next_retry_at) = record.next_retry_at
            && now < next_retry_at
        {
            return Err(Error::Core(CoreError::RetryLater {
                next_retry_at,
                message: format!("verification for {} is rate limited", record.domain),
            }));
        }

        record.status = DomainStatus::Verifying.to_string();
        self.persistence.update_custom_domain(&record).await?;

        if self.dns_proof(&record).await {
            record.status = DomainStatus::Verified.to_string();
            record.verification_attempts = 0;
            record.next_retry_at = None;
            record.support_url = None;
            self.persistence.update_custom_domain(&record).await?;

            info!(domain = %record.domain, "Domain verified");
            self.recorder.record(Event::DomainVerified {
                workspace_id: record.workspace_id.clone(),
                domain: record.domain.clone(),
            });
            return Ok(record);
        }

        record.verification_attempts += 1;
        record.status = DomainStatus::Failed.to_string();
        record.next_retry_at = Some(after(
            now,
            backoff_delay(
                self.config.verify_backoff_base,
                record.verification_attempts,
                self.config.backoff_max,
            ),
        ));
        if record.verification_attempts >= self.config.verify_max_attempts {
            record.support_url = Some(self.support_url(&record.id));
        }
        self.persistence.update_custom_domain(&record).await?;

        warn!(
            domain = %record.domain,
            attempts = record.verification_attempts,
            "Domain verification failed"
        );
        self.recorder.record(Event::DomainVerificationFailed {
            workspace_id: record.workspace_id.clone(),
            domain: record.domain.clone(),
            attempts: record.verification_attempts,
            next_retry_at: record.next_retry_at,
        });

        Ok(record)
    }

    /// Request a first certificate for a verified domain.
    pub async fn issue(&self, domain_id: &str, now: DateTime<Utc>) -> Result<CustomDomainRecord> {
        self.issue_internal(domain_id, IssueAction::Issue, now).await
    }

    /// Renew a certificate inside the renew window.
    ///
    /// Allowed iff `ssl_status` is issued or failed and the certificate
    /// expires within the window.
    pub async fn renew(&self, domain_id: &str, now: DateTime<Utc>) -> Result<CustomDomainRecord> {
        let record = self.require_domain(domain_id).await?;
        let ssl_status = parse_ssl_status(&record.ssl_status)?;

        let renewable = matches!(ssl_status, SslStatus::Issued | SslStatus::Failed)
            && record
                .ssl_expires_at
                .map(|expires| expires <= after(now, self.config.renew_window))
                .unwrap_or(false);
        if !renewable {
            return Err(Error::Core(CoreError::NotReady {
                resource: "certificate".to_string(),
                status: record.ssl_status,
            }));
        }

        self.issue_internal(domain_id, IssueAction::Renew, now).await
    }

    async fn issue_internal(
        &self,
        domain_id: &str,
        action: IssueAction,
        now: DateTime<Utc>,
    ) -> Result<CustomDomainRecord> {
        let mut record = self.require_domain(domain_id).await?;
        let status = parse_status(&record.status)?;

        if !matches!(status, DomainStatus::Verified | DomainStatus::Active) {
            return Err(Error::Core(CoreError::NotReady {
                resource: "custom_domain".to_string(),
                status: record.status,
            }));
        }

        if let Some(gate) = record.ssl_next_retry_at
            && now < gate
        {
            return Err(Error::Core(CoreError::RetryLater {
                next_retry_at: gate,
                message: format!("certificate issuance for {} is rate limited", record.domain),
            }));
        }

        record.ssl_status = SslStatus::Issuing.to_string();
        self.persistence.update_custom_domain(&record).await?;

        let workspace = self.persistence.get_workspace(&record.workspace_id).await?;
        let request = IssueRequest {
            action: action.as_str().to_string(),
            domain: record.domain.clone(),
            app_id: record.app_id.clone(),
            app_slug: None,
            workspace_id: record.workspace_id.clone(),
            workspace_slug: workspace.map(|w| w.slug),
            verification: VerificationPayload {
                txt_name: self.txt_name(&record.domain),
                txt_value: record.verification_token.clone(),
                cname_target: Some(self.config.base_host.clone()),
            },
            requested_at: now,
        };

        match self.issuer.issue(&request).await {
            Ok(outcome) => {
                self.apply_issued(&mut record, outcome, now).await?;
                Ok(record)
            }
            Err(e) => {
                record.ssl_issue_attempts += 1;
                record.ssl_status = SslStatus::Failed.to_string();
                record.ssl_next_retry_at = Some(after(
                    now,
                    backoff_delay(
                        self.config.ssl_backoff_base,
                        record.ssl_issue_attempts,
                        self.config.backoff_max,
                    ),
                ));
                if record.ssl_issue_attempts >= self.config.ssl_max_attempts {
                    record.support_url = Some(self.support_url(&record.id));
                }
                self.persistence.update_custom_domain(&record).await?;

                warn!(
                    domain = %record.domain,
                    attempts = record.ssl_issue_attempts,
                    error = %e,
                    "Certificate issuance failed"
                );
                self.recorder.record(Event::SslIssueFailed {
                    workspace_id: record.workspace_id.clone(),
                    domain: record.domain.clone(),
                    attempts: record.ssl_issue_attempts,
                    error: e.to_string(),
                });

                Ok(record)
            }
        }
    }

    async fn apply_issued(
        &self,
        record: &mut CustomDomainRecord,
        outcome: IssueOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let expires_at = outcome
            .expires_at
            .unwrap_or_else(|| after(now, self.config.default_cert_lifetime));

        record.ssl_status = SslStatus::Issued.to_string();
        record.ssl_issued_at = Some(outcome.issued_at.unwrap_or(now));
        record.ssl_expires_at = Some(expires_at);
        record.ssl_issue_attempts = 0;
        record.ssl_next_retry_at = None;
        self.persistence.update_custom_domain(record).await?;

        info!(domain = %record.domain, expires_at = %expires_at, "Certificate issued");
        self.recorder.record(Event::SslIssued {
            workspace_id: record.workspace_id.clone(),
            domain: record.domain.clone(),
            expires_at,
        });

        Ok(())
    }

    /// Activate the domain on the routing layer.
    ///
    /// Requires `verified` status and an issued certificate. On routing
    /// success the previously active domain of the app is demoted to
    /// `verified` and this one becomes `active`, in one transaction.
    pub async fn activate(&self, domain_id: &str) -> Result<CustomDomainRecord> {
        let record = self.require_domain(domain_id).await?;
        let status = parse_status(&record.status)?;

        if status == DomainStatus::Active {
            return Ok(record);
        }
        if status != DomainStatus::Verified {
            return Err(Error::Core(CoreError::NotReady {
                resource: "custom_domain".to_string(),
                status: record.status,
            }));
        }
        if parse_ssl_status(&record.ssl_status)? != SslStatus::Issued {
            return Err(Error::Core(CoreError::NotReady {
                resource: "certificate".to_string(),
                status: record.ssl_status,
            }));
        }

        let app_id = record.app_id.clone().ok_or_else(|| {
            Error::Core(CoreError::invalid_input(
                "app_id",
                "domain is not bound to an application",
            ))
        })?;

        let previous = self.persistence.get_active_domain_for_app(&app_id).await?;
        let workspace = self.persistence.get_workspace(&record.workspace_id).await?;

        let request = RoutingRequest {
            action: RoutingAction::Activate.as_str().to_string(),
            domain: record.domain.clone(),
            previous_domain: previous.as_ref().map(|d| d.domain.clone()),
            app_id: app_id.clone(),
            app_slug: None,
            workspace_id: record.workspace_id.clone(),
            workspace_slug: workspace.map(|w| w.slug),
            target_base_url: self.config.target_base_url.clone(),
            target_host: self.config.base_host.clone(),
            requested_at: Utc::now(),
        };

        self.routing
            .execute(&request)
            .await
            .map_err(|e| Error::RoutingFailed {
                domain: record.domain.clone(),
                reason: e.to_string(),
            })?;

        self.persistence
            .activate_custom_domain(&record.id, &app_id)
            .await?;

        info!(domain = %record.domain, app_id = %app_id, "Domain activated");
        self.recorder.record(Event::DomainActivated {
            workspace_id: record.workspace_id.clone(),
            domain: record.domain.clone(),
        });

        self.require_domain(domain_id).await
    }

    /// Return an active domain to `verified` via the routing executor.
    pub async fn rollback(&self, domain_id: &str) -> Result<CustomDomainRecord> {
        let mut record = self.require_domain(domain_id).await?;

        if parse_status(&record.status)? != DomainStatus::Active {
            return Err(Error::Core(CoreError::NotReady {
                resource: "custom_domain".to_string(),
                status: record.status,
            }));
        }

        let workspace = self.persistence.get_workspace(&record.workspace_id).await?;
        let request = RoutingRequest {
            action: RoutingAction::Rollback.as_str().to_string(),
            domain: record.domain.clone(),
            previous_domain: None,
            app_id: record.app_id.clone().unwrap_or_default(),
            app_slug: None,
            workspace_id: record.workspace_id.clone(),
            workspace_slug: workspace.map(|w| w.slug),
            target_base_url: self.config.target_base_url.clone(),
            target_host: self.config.base_host.clone(),
            requested_at: Utc::now(),
        };

        self.routing
            .execute(&request)
            .await
            .map_err(|e| Error::RoutingFailed {
                domain: record.domain.clone(),
                reason: e.to_string(),
            })?;

        record.status = DomainStatus::Verified.to_string();
        self.persistence.update_custom_domain(&record).await?;

        self.recorder.record(Event::DomainRolledBack {
            workspace_id: record.workspace_id.clone(),
            domain: record.domain.clone(),
        });

        Ok(record)
    }

    /// Block a domain. Terminal until explicit unblock.
    pub async fn block(&self, domain_id: &str, reason: &str) -> Result<CustomDomainRecord> {
        let mut record = self.require_domain(domain_id).await?;

        if parse_status(&record.status)? == DomainStatus::Blocked {
            return Ok(record);
        }

        record.prior_status = Some(record.status.clone());
        record.status = DomainStatus::Blocked.to_string();
        record.blocked_reason = Some(reason.to_string());
        self.persistence.update_custom_domain(&record).await?;

        self.recorder.record(Event::DomainBlocked {
            workspace_id: record.workspace_id.clone(),
            domain: record.domain.clone(),
            reason: reason.to_string(),
        });

        Ok(record)
    }

    /// Unblock a domain, restoring the prior non-terminal status
    /// (`verified` when it had been verified or active, `pending`
    /// otherwise).
    pub async fn unblock(&self, domain_id: &str) -> Result<CustomDomainRecord> {
        let mut record = self.require_domain(domain_id).await?;

        if parse_status(&record.status)? != DomainStatus::Blocked {
            return Err(Error::Core(CoreError::NotReady {
                resource: "custom_domain".to_string(),
                status: record.status,
            }));
        }

        let restored = match record.prior_status.as_deref() {
            Some(prior) if prior == DomainStatus::Verified.to_string().as_str() => {
                DomainStatus::Verified
            }
            Some(prior) if prior == DomainStatus::Active.to_string().as_str() => {
                DomainStatus::Verified
            }
            _ => DomainStatus::Pending,
        };

        record.status = restored.to_string();
        record.prior_status = None;
        record.blocked_reason = None;
        self.persistence.update_custom_domain(&record).await?;

        Ok(record)
    }

    fn txt_name(&self, domain: &str) -> String {
        format!("{}.{}", self.config.txt_prefix, domain)
    }

    fn support_url(&self, domain_id: &str) -> String {
        format!("{}/domains/{}", self.config.support_url_base, domain_id)
    }

    async fn dns_proof(&self, record: &CustomDomainRecord) -> bool {
        // TXT first: any record containing the token proves control.
        match self.dns.txt_records(&self.txt_name(&record.domain)).await {
            Ok(values) => {
                if values
                    .iter()
                    .any(|value| value.contains(&record.verification_token))
                {
                    return true;
                }
            }
            Err(e) => {
                // Lookup failures count as a miss, not an error.
                warn!(domain = %record.domain, error = %e, "TXT lookup failed");
            }
        }

        // CNAME fallback: the apex must point at the configured host.
        let expected = normalize_host(&self.config.base_host);
        match self.dns.cname_target(&record.domain).await {
            Ok(Some(target)) => normalize_host(&target) == expected,
            Ok(None) => false,
            Err(e) => {
                warn!(domain = %record.domain, error = %e, "CNAME lookup failed");
                false
            }
        }
    }

    async fn require_domain(&self, domain_id: &str) -> Result<CustomDomainRecord> {
        self.persistence
            .get_custom_domain(domain_id)
            .await?
            .ok_or_else(|| Error::Core(CoreError::not_found("custom_domain", domain_id)))
    }
}

fn parse_status(status: &str) -> Result<DomainStatus> {
    status
        .parse()
        .map_err(|_| Error::Core(CoreError::transient("domain", format!("unknown status '{}'", status))))
}

fn parse_ssl_status(status: &str) -> Result<SslStatus> {
    status.parse().map_err(|_| {
        Error::Core(CoreError::transient(
            "domain",
            format!("unknown ssl status '{}'", status),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_clamps() {
        let base = Duration::from_secs(5 * 60);
        let max = Duration::from_secs(24 * 3600);

        assert_eq!(backoff_delay(base, 1, max), Duration::from_secs(5 * 60));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_secs(10 * 60));
        assert_eq!(backoff_delay(base, 3, max), Duration::from_secs(20 * 60));
        // Far enough out, the ceiling wins.
        assert_eq!(backoff_delay(base, 10, max), max);
        // Attempt 0 behaves like attempt 1.
        assert_eq!(backoff_delay(base, 0, max), base);
    }

    #[test]
    fn test_config_defaults() {
        let config = DomainConfig::default();
        assert_eq!(config.txt_prefix, "_agentflow");
        assert_eq!(config.verify_max_attempts, 3);
        assert_eq!(config.verify_backoff_base, Duration::from_secs(300));
        assert_eq!(config.ssl_backoff_base, Duration::from_secs(600));
        assert_eq!(config.renew_window, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.default_cert_lifetime, Duration::from_secs(90 * 24 * 3600));
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert!(a.len() >= 20);
    }
}
