// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain routing executor collaborators.
//!
//! Serving tenant traffic is delegated to an external routing layer.
//! The executor is a config-selected sum type mirroring the issuer:
//! no-op for single-box deployments, webhook for a real edge.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Routing call errors. 2xx is success; everything else fails and
/// leaves repository state unchanged.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Transport-level failure.
    #[error("routing request failed: {0}")]
    Transport(String),
    /// The executor answered with a non-success status.
    #[error("routing executor returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
}

/// Routing action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingAction {
    /// Point the domain at the app.
    Activate,
    /// Return the domain to its pre-activation state.
    Rollback,
}

impl RoutingAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Rollback => "rollback",
        }
    }
}

/// Request forwarded to the routing executor.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingRequest {
    /// `activate` or `rollback`.
    pub action: String,
    /// The domain being switched.
    pub domain: String,
    /// The previously active domain, when one is being replaced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_domain: Option<String>,
    /// Application identifier.
    pub app_id: String,
    /// Application slug.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_slug: Option<String>,
    /// Owning workspace identifier.
    pub workspace_id: String,
    /// Workspace slug, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_slug: Option<String>,
    /// Base URL traffic should reach.
    pub target_base_url: String,
    /// Host traffic should reach.
    pub target_host: String,
    /// When the engine made the call.
    pub requested_at: DateTime<Utc>,
}

/// Config-selected routing executor.
pub enum DomainRoutingExecutor {
    /// Accepts every request without side effects.
    Noop,
    /// POSTs the request to the routing layer.
    Webhook(WebhookRouting),
}

/// HTTP webhook routing executor with bearer authentication.
pub struct WebhookRouting {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl DomainRoutingExecutor {
    /// Select the executor from configuration; no URL means no-op.
    pub fn from_config(url: Option<&str>, token: Option<&str>) -> Self {
        match url {
            Some(url) if !url.is_empty() => Self::Webhook(WebhookRouting {
                client: reqwest::Client::new(),
                url: url.to_string(),
                token: token.map(|t| t.to_string()),
            }),
            _ => Self::Noop,
        }
    }

    /// Executor tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Webhook(_) => "webhook",
        }
    }

    /// Execute a routing change.
    pub async fn execute(&self, request: &RoutingRequest) -> Result<(), RoutingError> {
        match self {
            Self::Noop => {
                debug!(domain = %request.domain, action = %request.action, "No-op routing");
                Ok(())
            }
            Self::Webhook(webhook) => webhook.execute(request).await,
        }
    }
}

impl WebhookRouting {
    async fn execute(&self, request: &RoutingRequest) -> Result<(), RoutingError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RoutingError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RoutingError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_executor_accepts() {
        let executor = DomainRoutingExecutor::from_config(None, None);
        assert_eq!(executor.kind(), "noop");

        let result = executor
            .execute(&RoutingRequest {
                action: RoutingAction::Activate.as_str().to_string(),
                domain: "app.example.com".to_string(),
                previous_domain: None,
                app_id: "a1".to_string(),
                app_slug: None,
                workspace_id: "w1".to_string(),
                workspace_slug: None,
                target_base_url: "https://apps.agentflow.dev".to_string(),
                target_host: "apps.agentflow.dev".to_string(),
                requested_at: Utc::now(),
            })
            .await;

        assert!(result.is_ok());
    }

    #[test]
    fn test_request_serialization_skips_absent_fields() {
        let request = RoutingRequest {
            action: "activate".to_string(),
            domain: "app.example.com".to_string(),
            previous_domain: None,
            app_id: "a1".to_string(),
            app_slug: None,
            workspace_id: "w1".to_string(),
            workspace_slug: None,
            target_base_url: "https://apps.agentflow.dev".to_string(),
            target_host: "apps.agentflow.dev".to_string(),
            requested_at: Utc::now(),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("previous_domain").is_none());
        assert_eq!(json["action"], "activate");
    }
}
