// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS lookups behind a resolver trait.
//!
//! The lifecycle engine only needs TXT values and CNAME targets. The
//! system resolver delegates to hickory; the mock serves the test
//! suites. Lookup errors are recovered by the caller into verification
//! failures, never surfaced.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::proto::rr::{RData, RecordType};
use thiserror::Error;

/// DNS lookup errors.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The resolver could not complete the lookup.
    #[error("DNS lookup failed: {0}")]
    Lookup(String),
}

/// Resolver seam used by the lifecycle engine.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// All TXT record values at `name`, character-data parts joined.
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, DnsError>;

    /// The CNAME target of `name`, if one exists.
    async fn cname_target(&self, name: &str) -> Result<Option<String>, DnsError>;
}

/// System-configured resolver backed by hickory.
pub struct SystemDnsResolver {
    resolver: TokioAsyncResolver,
}

impl SystemDnsResolver {
    /// Build a resolver from the host's DNS configuration.
    pub fn from_system_conf() -> Result<Self, DnsError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| DnsError::Lookup(e.to_string()))?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl DnsResolver for SystemDnsResolver {
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| DnsError::Lookup(e.to_string()))?;

        Ok(lookup
            .iter()
            .map(|txt| {
                txt.iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<String>()
            })
            .collect())
    }

    async fn cname_target(&self, name: &str) -> Result<Option<String>, DnsError> {
        let lookup = self
            .resolver
            .lookup(name, RecordType::CNAME)
            .await
            .map_err(|e| DnsError::Lookup(e.to_string()))?;

        for rdata in lookup.iter() {
            if let RData::CNAME(target) = rdata {
                return Ok(Some(target.0.to_utf8()));
            }
        }

        Ok(None)
    }
}

/// In-memory resolver for tests.
#[derive(Default)]
pub struct MockDnsResolver {
    txt: std::sync::Mutex<std::collections::HashMap<String, Vec<String>>>,
    cname: std::sync::Mutex<std::collections::HashMap<String, String>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MockDnsResolver {
    /// Create an empty mock resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TXT values returned for `name`.
    pub fn set_txt(&self, name: &str, values: &[&str]) {
        self.txt.lock().unwrap().insert(
            name.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
    }

    /// Set the CNAME target returned for `name`.
    pub fn set_cname(&self, name: &str, target: &str) {
        self.cname
            .lock()
            .unwrap()
            .insert(name.to_string(), target.to_string());
    }

    /// Remove all configured records.
    pub fn clear(&self) {
        self.txt.lock().unwrap().clear();
        self.cname.lock().unwrap().clear();
    }

    /// Make every lookup fail, simulating resolver outage.
    pub fn fail_lookups(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl DnsResolver for MockDnsResolver {
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, DnsError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DnsError::Lookup("simulated outage".to_string()));
        }
        Ok(self.txt.lock().unwrap().get(name).cloned().unwrap_or_default())
    }

    async fn cname_target(&self, name: &str) -> Result<Option<String>, DnsError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DnsError::Lookup("simulated outage".to_string()));
        }
        Ok(self.cname.lock().unwrap().get(name).cloned())
    }
}

/// Normalize a host for comparison: lower-case, trailing dot and port
/// stripped.
pub fn normalize_host(host: &str) -> String {
    let mut value = host.trim().to_ascii_lowercase();
    if let Some(stripped) = value.strip_suffix('.') {
        value = stripped.to_string();
    }
    if let Some((name, port)) = value.rsplit_once(':')
        && port.chars().all(|c| c.is_ascii_digit())
    {
        value = name.to_string();
    }
    value
}

/// Lower-case and FQDN-normalize a user-supplied domain name.
///
/// Returns `None` when the value is not a plausible FQDN.
pub fn normalize_domain(domain: &str) -> Option<String> {
    let value = normalize_host(domain);

    if value.len() > 253 || value.is_empty() {
        return None;
    }

    let labels: Vec<&str> = value.split('.').collect();
    if labels.len() < 2 {
        return None;
    }

    for label in &labels {
        if label.is_empty()
            || label.len() > 63
            || label.starts_with('-')
            || label.ends_with('-')
            || !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return None;
        }
    }

    Some(value)
}
