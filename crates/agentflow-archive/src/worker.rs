// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archive worker.
//!
//! Picks up pending export jobs, streams their datasets into a zip
//! (JSONL pages of 200 rows), writes manifest and index, renames the
//! temp file into place atomically, checksums it, and marks the job
//! completed. Source rows of log-archive jobs are deleted only after
//! the artifact is durable; failures keep them and record the error.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agentflow_core::events::{Event, EventRecorder};
use agentflow_core::persistence::{ExportJobRecord, Persistence};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::Result;
use crate::format::{
    ArchiveIndex, ArchiveManifest, Dataset, IndexEntry, MANIFEST_VERSION, artifact_file_name,
};

/// Directory under the archive base holding log-archive artifacts.
pub const ARCHIVE_DIR: &str = "log-archives";

/// Archive worker configuration.
#[derive(Debug, Clone)]
pub struct ArchiveWorkerConfig {
    /// Interval between ticks.
    pub poll_interval: Duration,
    /// Pending jobs claimed per tick.
    pub max_jobs_per_tick: i64,
    /// Rows streamed per page.
    pub page_size: i64,
    /// Artifact retention for completed archive jobs.
    pub archive_retention_days: u32,
}

impl Default for ArchiveWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_jobs_per_tick: 3,
            page_size: 200,
            archive_retention_days: 90,
        }
    }
}

impl ArchiveWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `AGENTFLOW_ARCHIVE_POLL_INTERVAL_SECS`: seconds between ticks (default: 30)
    /// - `AGENTFLOW_ARCHIVE_MAX_JOBS`: jobs per tick (default: 3)
    /// - `AGENTFLOW_ARCHIVE_RETENTION_DAYS`: artifact retention (default: 90)
    pub fn from_env() -> Self {
        let poll_interval_secs = std::env::var("AGENTFLOW_ARCHIVE_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let max_jobs_per_tick = std::env::var("AGENTFLOW_ARCHIVE_MAX_JOBS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        let archive_retention_days = std::env::var("AGENTFLOW_ARCHIVE_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(90);

        Self {
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_jobs_per_tick,
            archive_retention_days,
            ..Self::default()
        }
    }
}

/// Background worker executing export jobs.
pub struct ArchiveWorker {
    persistence: Arc<dyn Persistence>,
    recorder: EventRecorder,
    base_path: PathBuf,
    config: ArchiveWorkerConfig,
    shutdown: Arc<Notify>,
}

impl ArchiveWorker {
    /// Create a new archive worker.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        recorder: EventRecorder,
        base_path: PathBuf,
        config: ArchiveWorkerConfig,
    ) -> Self {
        Self {
            persistence,
            recorder,
            base_path,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_jobs_per_tick = self.config.max_jobs_per_tick,
            base_path = %self.base_path.display(),
            "Archive worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Archive worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Archive worker tick failed");
                    }
                }
            }
        }

        info!("Archive worker stopped");
    }

    /// Claim and process up to `max_jobs_per_tick` pending jobs.
    pub async fn tick(&self) -> Result<u64> {
        let jobs = self
            .persistence
            .pending_export_jobs(self.config.max_jobs_per_tick)
            .await?;

        let mut processed = 0u64;
        for job in jobs {
            if !self.persistence.mark_export_job_processing(&job.id).await? {
                // Another worker won the claim.
                continue;
            }

            match self.process_job(&job).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Archive job failed");
                    self.persistence
                        .fail_export_job(&job.id, &e.to_string())
                        .await?;
                    self.recorder.record(Event::ArchiveJobFailed {
                        workspace_id: job.workspace_id.clone(),
                        job_id: job.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(processed)
    }

    /// Build the artifact for one job and mark it completed.
    pub async fn process_job(&self, job: &ExportJobRecord) -> Result<()> {
        let now = Utc::now();
        let range_start = job.range_start.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let range_end = job.range_end.unwrap_or(now);

        let slug = self
            .persistence
            .get_workspace(&job.workspace_id)
            .await?
            .map(|w| w.slug)
            .unwrap_or_else(|| job.workspace_id.clone());

        let dir = self.base_path.join(ARCHIVE_DIR);
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = artifact_file_name(&slug, &job.job_type, range_start, range_end, &job.id);
        let final_path = dir.join(&file_name);
        let tmp_path = dir.join(format!(".tmp-{}.zip", job.id));

        let write_result = self
            .write_artifact(job, &tmp_path, range_start, range_end, now)
            .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        tokio::fs::rename(&tmp_path, &final_path).await?;

        let checksum = sha256_file(&final_path)?;
        let file_size = tokio::fs::metadata(&final_path).await?.len() as i64;

        let is_log_archive = matches!(
            job.job_type.as_str(),
            "execution_log_archive" | "audit_log_archive"
        );
        let expires_at = if is_log_archive {
            Some(now + chrono::Duration::days(i64::from(self.config.archive_retention_days)))
        } else {
            None
        };

        self.persistence
            .complete_export_job(
                &job.id,
                &final_path.to_string_lossy(),
                &file_name,
                file_size,
                &checksum,
                expires_at,
            )
            .await?;

        // The artifact is durable; archived source rows can go.
        if is_log_archive {
            self.delete_source_rows(job, range_start, range_end).await?;
        }

        info!(
            job_id = %job.id,
            file_name = %file_name,
            file_size = file_size,
            "Archive job completed"
        );
        self.recorder.record(Event::ArchiveJobCompleted {
            workspace_id: job.workspace_id.clone(),
            job_id: job.id.clone(),
            file_name,
            file_size,
        });

        Ok(())
    }

    async fn write_artifact(
        &self,
        job: &ExportJobRecord,
        tmp_path: &Path,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let file = std::fs::File::create(tmp_path)?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        let datasets = Dataset::for_job_type(&job.job_type);
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut files = Vec::new();

        for dataset in datasets {
            zip.start_file(dataset.file_name(), options)?;
            let count = self
                .stream_dataset(&mut zip, job, *dataset, range_start, range_end)
                .await?;
            counts.insert(dataset.name().to_string(), count);
            files.push(dataset.file_name().to_string());
            debug!(job_id = %job.id, dataset = dataset.name(), rows = count, "Dataset streamed");
        }

        let manifest = ArchiveManifest {
            version: MANIFEST_VERSION.to_string(),
            archive_id: job.id.clone(),
            workspace_id: job.workspace_id.clone(),
            archive_type: job.job_type.clone(),
            range_start,
            range_end,
            created_at: now,
            files: files.clone(),
            counts: counts.clone(),
        };
        zip.start_file("manifest.json", options)?;
        zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;

        let index = ArchiveIndex {
            range_start,
            range_end,
            datasets: datasets
                .iter()
                .map(|dataset| IndexEntry {
                    dataset: dataset.name().to_string(),
                    file: dataset.file_name().to_string(),
                    count: counts.get(dataset.name()).copied().unwrap_or(0),
                })
                .collect(),
        };
        zip.start_file("index.json", options)?;
        zip.write_all(&serde_json::to_vec_pretty(&index)?)?;

        zip.finish()?;
        Ok(())
    }

    async fn stream_dataset(
        &self,
        zip: &mut ZipWriter<std::fs::File>,
        job: &ExportJobRecord,
        dataset: Dataset,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<u64> {
        let mut count = 0u64;
        let mut offset = 0i64;

        loop {
            let lines = match dataset {
                Dataset::Executions => self
                    .persistence
                    .executions_page(
                        &job.workspace_id,
                        range_start,
                        range_end,
                        self.config.page_size,
                        offset,
                    )
                    .await?
                    .iter()
                    .map(serde_json::to_string)
                    .collect::<std::result::Result<Vec<_>, _>>()?,
                Dataset::NodeLogs => self
                    .persistence
                    .node_logs_page(
                        &job.workspace_id,
                        range_start,
                        range_end,
                        self.config.page_size,
                        offset,
                    )
                    .await?
                    .iter()
                    .map(serde_json::to_string)
                    .collect::<std::result::Result<Vec<_>, _>>()?,
                Dataset::AuditLogs => self
                    .persistence
                    .audit_logs_page(
                        &job.workspace_id,
                        range_start,
                        range_end,
                        self.config.page_size,
                        offset,
                    )
                    .await?
                    .iter()
                    .map(serde_json::to_string)
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            };

            if lines.is_empty() {
                break;
            }

            let fetched = lines.len();
            for line in &lines {
                zip.write_all(line.as_bytes())?;
                zip.write_all(b"\n")?;
            }
            count += fetched as u64;

            if (fetched as i64) < self.config.page_size {
                break;
            }
            offset += self.config.page_size;
        }

        Ok(count)
    }

    async fn delete_source_rows(
        &self,
        job: &ExportJobRecord,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<()> {
        match job.job_type.as_str() {
            "execution_log_archive" => {
                self.persistence
                    .delete_executions_in_range(&job.workspace_id, range_start, range_end)
                    .await?;
                self.persistence
                    .delete_node_logs_in_range(&job.workspace_id, range_start, range_end)
                    .await?;
                self.persistence
                    .delete_runtime_events_in_range(&job.workspace_id, range_start, range_end)
                    .await?;
            }
            "audit_log_archive" => {
                self.persistence
                    .delete_audit_logs_in_range(&job.workspace_id, range_start, range_end)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// SHA-256 over a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ArchiveWorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.max_jobs_per_tick, 3);
        assert_eq!(config.page_size, 200);
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abc").unwrap();

        let digest = sha256_file(&path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
