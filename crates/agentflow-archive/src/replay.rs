// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replay of completed archive artifacts.
//!
//! Opens the zip, streams the requested dataset line by line (5 MiB
//! line cap), applies in-memory filters, and paginates with a cursor
//! offset. The archive layout is bit-stable, so replay never needs the
//! live tables.

use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::format::{Dataset, MAX_LINE_BYTES};

/// Replay filters and cursor.
#[derive(Debug, Clone)]
pub struct ReplayQuery {
    /// Dataset to stream (`executions`, `node_logs`, `audit_logs`).
    pub dataset: String,
    /// Keep entries created at or after this time.
    pub start: Option<DateTime<Utc>>,
    /// Keep entries created before this time.
    pub end: Option<DateTime<Utc>>,
    /// Keep entries whose id is in this set.
    pub ids: Option<Vec<String>>,
    /// Keep entries with this status.
    pub status: Option<String>,
    /// Keep audit entries with this action.
    pub action: Option<String>,
    /// Keep node logs for this node id.
    pub node_id: Option<String>,
    /// Keep node logs for this node type.
    pub node_type: Option<String>,
    /// Page size.
    pub limit: usize,
    /// Matching entries to skip.
    pub offset: usize,
}

impl ReplayQuery {
    /// Query for a dataset with no filters and the default page size.
    pub fn dataset(name: &str) -> Self {
        Self {
            dataset: name.to_string(),
            start: None,
            end: None,
            ids: None,
            status: None,
            action: None,
            node_id: None,
            node_type: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// One replay page.
#[derive(Debug, Clone)]
pub struct ReplayPage {
    /// Matching entries, in archive order.
    pub entries: Vec<serde_json::Value>,
    /// Cursor for the next page; `None` when the dataset is exhausted.
    pub next_offset: Option<usize>,
}

fn entry_matches(query: &ReplayQuery, value: &serde_json::Value) -> bool {
    if query.start.is_some() || query.end.is_some() {
        let created_at = value
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        match created_at {
            Some(at) => {
                if let Some(start) = query.start
                    && at < start
                {
                    return false;
                }
                if let Some(end) = query.end
                    && at >= end
                {
                    return false;
                }
            }
            None => return false,
        }
    }

    if let Some(ids) = &query.ids {
        let id = value.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        if !ids.iter().any(|wanted| wanted == id) {
            return false;
        }
    }

    let field_eq = |field: &str, expected: &Option<String>| match expected {
        Some(expected) => value
            .get(field)
            .and_then(|v| v.as_str())
            .map(|actual| actual == expected)
            .unwrap_or(false),
        None => true,
    };

    field_eq("status", &query.status)
        && field_eq("action", &query.action)
        && field_eq("node_id", &query.node_id)
        && field_eq("node_type", &query.node_type)
}

/// Stream one page of a dataset out of a completed archive.
pub fn replay(archive_path: &Path, query: &ReplayQuery) -> Result<ReplayPage> {
    let dataset = Dataset::parse(&query.dataset).ok_or_else(|| {
        Error::Core(agentflow_core::CoreError::invalid_input(
            "dataset",
            format!("unknown dataset '{}'", query.dataset),
        ))
    })?;
    let limit = query.limit.clamp(1, 1000);

    let file = std::fs::File::open(archive_path)?;
    let mut zip = zip::ZipArchive::new(file)?;
    let entry = zip.by_name(dataset.file_name())?;
    let mut reader = BufReader::new(entry);

    let mut entries = Vec::new();
    let mut next_offset = None;
    let mut matched = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        if line.len() > MAX_LINE_BYTES {
            return Err(Error::LineTooLong {
                max: MAX_LINE_BYTES,
            });
        }

        let trimmed = String::from_utf8_lossy(&line);
        let trimmed = trimmed.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            continue;
        };
        if !entry_matches(query, &value) {
            continue;
        }

        if matched >= query.offset {
            if entries.len() < limit {
                entries.push(value);
            } else {
                // A further match exists beyond this page.
                next_offset = Some(query.offset + limit);
                break;
            }
        }
        matched += 1;
    }

    Ok(ReplayPage {
        entries,
        next_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_archive(lines: &[serde_json::Value]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.zip");

        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("node_logs.jsonl", SimpleFileOptions::default())
            .unwrap();
        for line in lines {
            zip.write_all(serde_json::to_string(line).unwrap().as_bytes())
                .unwrap();
            zip.write_all(b"\n").unwrap();
        }
        zip.finish().unwrap();

        (dir, path)
    }

    fn sample_lines(count: usize) -> Vec<serde_json::Value> {
        (0..count)
            .map(|i| {
                serde_json::json!({
                    "id": format!("log{:04}", i),
                    "node_id": if i % 2 == 0 { "fetch" } else { "transform" },
                    "node_type": "http",
                    "status": if i % 10 == 0 { "failed" } else { "completed" },
                    "created_at": format!("2025-01-{:02}T00:00:{:02}Z", 1 + i / 60, i % 60),
                })
            })
            .collect()
    }

    #[test]
    fn test_replay_paginates_with_cursor() {
        let (_dir, path) = write_archive(&sample_lines(250));

        let mut query = ReplayQuery::dataset("node_logs");
        query.limit = 100;
        query.offset = 100;

        let page = replay(&path, &query).unwrap();
        assert_eq!(page.entries.len(), 100);
        assert_eq!(page.entries[0]["id"], "log0100");
        assert_eq!(page.entries[99]["id"], "log0199");
        assert_eq!(page.next_offset, Some(200));

        // Final page has no cursor.
        query.offset = 200;
        let page = replay(&path, &query).unwrap();
        assert_eq!(page.entries.len(), 50);
        assert_eq!(page.next_offset, None);
    }

    #[test]
    fn test_replay_filters_by_node_and_status() {
        let (_dir, path) = write_archive(&sample_lines(40));

        let mut query = ReplayQuery::dataset("node_logs");
        query.node_id = Some("fetch".to_string());
        let page = replay(&path, &query).unwrap();
        assert_eq!(page.entries.len(), 20);

        let mut query = ReplayQuery::dataset("node_logs");
        query.status = Some("failed".to_string());
        let page = replay(&path, &query).unwrap();
        assert_eq!(page.entries.len(), 4);
    }

    #[test]
    fn test_replay_filters_by_time_range() {
        let (_dir, path) = write_archive(&sample_lines(120));

        let mut query = ReplayQuery::dataset("node_logs");
        query.start = Some(
            DateTime::parse_from_rfc3339("2025-01-02T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        let page = replay(&path, &query).unwrap();
        // Rows 60.. carry day 02 timestamps.
        assert_eq!(page.entries.len(), 60);
    }

    #[test]
    fn test_replay_filters_by_ids() {
        let (_dir, path) = write_archive(&sample_lines(20));

        let mut query = ReplayQuery::dataset("node_logs");
        query.ids = Some(vec!["log0003".to_string(), "log0007".to_string()]);
        let page = replay(&path, &query).unwrap();
        assert_eq!(page.entries.len(), 2);
    }

    #[test]
    fn test_replay_rejects_unknown_dataset() {
        let (_dir, path) = write_archive(&sample_lines(1));
        let query = ReplayQuery::dataset("secrets");
        assert!(replay(&path, &query).is_err());
    }
}
