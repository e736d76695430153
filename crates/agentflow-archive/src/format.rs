// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archive artifact layout.
//!
//! Every artifact is a zip holding one JSONL file per dataset plus
//! `manifest.json` and `index.json`. The layout is bit-stable: replay
//! depends on these names and schemas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Manifest schema version.
pub const MANIFEST_VERSION: &str = "1.0.0";

/// Longest JSONL line replay will accept (5 MiB).
pub const MAX_LINE_BYTES: usize = 5 * 1024 * 1024;

/// Datasets an archive can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    /// Workflow execution metadata rows.
    Executions,
    /// Per-node execution logs.
    NodeLogs,
    /// Audit log rows.
    AuditLogs,
}

impl Dataset {
    /// Dataset name used in manifests and queries.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Executions => "executions",
            Self::NodeLogs => "node_logs",
            Self::AuditLogs => "audit_logs",
        }
    }

    /// File name of the dataset inside the zip.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Executions => "executions.jsonl",
            Self::NodeLogs => "node_logs.jsonl",
            Self::AuditLogs => "audit_logs.jsonl",
        }
    }

    /// Parse a dataset name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "executions" => Some(Self::Executions),
            "node_logs" => Some(Self::NodeLogs),
            "audit_logs" => Some(Self::AuditLogs),
            _ => None,
        }
    }

    /// The datasets carried by each export job type.
    pub fn for_job_type(job_type: &str) -> &'static [Dataset] {
        match job_type {
            "execution_log_archive" => &[Dataset::Executions, Dataset::NodeLogs],
            "audit_log_archive" => &[Dataset::AuditLogs],
            // Full exports carry everything.
            _ => &[Dataset::Executions, Dataset::NodeLogs, Dataset::AuditLogs],
        }
    }
}

/// `manifest.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// Manifest schema version.
    pub version: String,
    /// The export job id.
    pub archive_id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Export job type.
    pub archive_type: String,
    /// Window start (inclusive).
    pub range_start: DateTime<Utc>,
    /// Window end (exclusive).
    pub range_end: DateTime<Utc>,
    /// When the artifact was produced.
    pub created_at: DateTime<Utc>,
    /// Files inside the zip, in order.
    pub files: Vec<String>,
    /// Row counts per dataset.
    pub counts: std::collections::BTreeMap<String, u64>,
}

/// One dataset entry in `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Dataset name.
    pub dataset: String,
    /// File holding the dataset.
    pub file: String,
    /// Row count.
    pub count: u64,
}

/// `index.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveIndex {
    /// Window start (inclusive).
    pub range_start: DateTime<Utc>,
    /// Window end (exclusive).
    pub range_end: DateTime<Utc>,
    /// Per-dataset entries.
    pub datasets: Vec<IndexEntry>,
}

/// Final artifact file name:
/// `<slug>-<type>-<startYYYYMMDD>-<endYYYYMMDD>-<jobId>.zip`.
pub fn artifact_file_name(
    slug: &str,
    job_type: &str,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    job_id: &str,
) -> String {
    format!(
        "{}-{}-{}-{}-{}.zip",
        slug,
        job_type,
        range_start.format("%Y%m%d"),
        range_end.format("%Y%m%d"),
        job_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_names() {
        assert_eq!(Dataset::Executions.file_name(), "executions.jsonl");
        assert_eq!(Dataset::parse("node_logs"), Some(Dataset::NodeLogs));
        assert_eq!(Dataset::parse("nope"), None);
    }

    #[test]
    fn test_datasets_per_job_type() {
        assert_eq!(
            Dataset::for_job_type("execution_log_archive"),
            &[Dataset::Executions, Dataset::NodeLogs]
        );
        assert_eq!(Dataset::for_job_type("audit_log_archive"), &[Dataset::AuditLogs]);
        assert_eq!(Dataset::for_job_type("cold_storage").len(), 3);
    }

    #[test]
    fn test_artifact_file_name() {
        let start = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339("2025-01-08T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            artifact_file_name("acme", "execution_log_archive", start, end, "job1"),
            "acme-execution_log_archive-20250101-20250108-job1.zip"
        );
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = ArchiveManifest {
            version: MANIFEST_VERSION.to_string(),
            archive_id: "j1".to_string(),
            workspace_id: "w1".to_string(),
            archive_type: "execution_log_archive".to_string(),
            range_start: Utc::now(),
            range_end: Utc::now(),
            created_at: Utc::now(),
            files: vec!["executions.jsonl".to_string()],
            counts: [("executions".to_string(), 10u64)].into_iter().collect(),
        };

        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: ArchiveManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, MANIFEST_VERSION);
        assert_eq!(parsed.counts["executions"], 10);
    }
}
