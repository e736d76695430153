// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Certificate issuer collaborators.
//!
//! Issuance is delegated: the engine never speaks ACME itself. The
//! issuer is a config-selected sum type; deployments without an issuer
//! URL get the no-op variant, which reports success and lets the engine
//! apply its default expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Issuer call errors. Any non-2xx response or transport error is a
/// failure; the engine turns it into retry state.
#[derive(Debug, Error)]
pub enum IssuerError {
    /// Transport-level failure.
    #[error("issuer request failed: {0}")]
    Transport(String),
    /// The issuer answered with a non-success status.
    #[error("issuer returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
}

/// Issuance action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueAction {
    /// First certificate for the domain.
    Issue,
    /// Renewal inside the renew window.
    Renew,
}

impl IssueAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Renew => "renew",
        }
    }
}

/// DNS proof material forwarded to the issuer.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationPayload {
    /// Owner name of the verification TXT record.
    pub txt_name: String,
    /// Expected TXT value (the verification token).
    pub txt_value: String,
    /// Expected CNAME target.
    pub cname_target: Option<String>,
}

/// Request forwarded to the issuer webhook.
#[derive(Debug, Clone, Serialize)]
pub struct IssueRequest {
    /// `issue` or `renew`.
    pub action: String,
    /// The domain the certificate covers.
    pub domain: String,
    /// Application identifier, when app-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Application slug, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_slug: Option<String>,
    /// Owning workspace identifier.
    pub workspace_id: String,
    /// Workspace slug, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_slug: Option<String>,
    /// DNS proof material.
    pub verification: VerificationPayload,
    /// When the engine made the call.
    pub requested_at: DateTime<Utc>,
}

/// Issuer response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueOutcome {
    /// When the certificate was issued.
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    /// When the certificate expires; the engine defaults to 90 days.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Issuer backend identifier.
    #[serde(default)]
    pub provider: Option<String>,
    /// Free-form issuer message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Config-selected issuer collaborator.
pub enum CertificateIssuer {
    /// Reports success without issuing; for development and self-hosted
    /// deployments that terminate TLS elsewhere.
    Noop,
    /// POSTs the request to an external issuing service.
    Webhook(WebhookIssuer),
}

/// HTTP webhook issuer with bearer authentication.
pub struct WebhookIssuer {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl CertificateIssuer {
    /// Select the issuer from configuration; no URL means no-op.
    pub fn from_config(url: Option<&str>, token: Option<&str>) -> Self {
        match url {
            Some(url) if !url.is_empty() => Self::Webhook(WebhookIssuer {
                client: reqwest::Client::new(),
                url: url.to_string(),
                token: token.map(|t| t.to_string()),
            }),
            _ => Self::Noop,
        }
    }

    /// Issuer tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Webhook(_) => "webhook",
        }
    }

    /// Request a certificate for the domain.
    pub async fn issue(&self, request: &IssueRequest) -> Result<IssueOutcome, IssuerError> {
        match self {
            Self::Noop => {
                debug!(domain = %request.domain, action = %request.action, "No-op issuer");
                Ok(IssueOutcome {
                    issued_at: Some(request.requested_at),
                    expires_at: None,
                    provider: Some("noop".to_string()),
                    message: None,
                })
            }
            Self::Webhook(webhook) => webhook.issue(request).await,
        }
    }
}

impl WebhookIssuer {
    async fn issue(&self, request: &IssueRequest) -> Result<IssueOutcome, IssuerError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| IssuerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IssuerError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        response
            .json::<IssueOutcome>()
            .await
            .map_err(|e| IssuerError::Transport(e.to_string()))
    }
}
