use std::cmp::Reverse;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{validate_run_id, InvalidRunId, Report, ReportSummary, RunKind, StepStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("report {0} already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    InvalidId(#[from] InvalidRunId),
    #[error("report io error: {0}")]
    Io(#[from] io::Error),
    #[error("report encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable, write-once storage for finished runs.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Persist `report` under its id and return a human-readable location.
    async fn write(&self, report: &Report) -> Result<String, StoreError>;

    async fn read(&self, id: &str) -> Result<Option<Report>, StoreError>;

    /// Summaries of every stored report, newest first.
    async fn list(&self) -> Result<Vec<ReportSummary>, StoreError>;

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.read(id).await?.is_some())
    }
}

/// One pretty-printed JSON file per report: `<dir>/<id>.json`.
///
/// Files are written under a hidden temporary name and linked into place, so a report is
/// either absent or complete.
#[derive(Debug, Clone)]
pub struct FsReportStore {
    dir: PathBuf,
}

impl FsReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_run_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }
}

/// Only the fields a listing needs; step output is skipped over, not kept.
#[derive(Deserialize)]
struct StoredSummary {
    id: String,
    timestamp: String,
    request: StoredRequest,
    #[serde(default)]
    results: Vec<StoredStep>,
}

#[derive(Deserialize)]
struct StoredRequest {
    #[serde(alias = "scan_type")]
    run_kind: RunKind,
}

#[derive(Deserialize)]
struct StoredStep {
    status: StepStatus,
}

impl From<StoredSummary> for ReportSummary {
    fn from(s: StoredSummary) -> Self {
        let failed = s.results.iter().any(|r| r.status == StepStatus::Failed);
        ReportSummary {
            id: s.id,
            timestamp: s.timestamp,
            scan_type: s.request.run_kind,
            status: if failed {
                StepStatus::Failed
            } else {
                StepStatus::Completed
            },
        }
    }
}

#[async_trait]
impl ReportStore for FsReportStore {
    async fn write(&self, report: &Report) -> Result<String, StoreError> {
        let path = self.path_for(&report.id)?;
        fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(report)?;

        // Readers only ever see a complete file: write aside, then link into place.
        let tmp = self.dir.join(format!(".{}.{}.tmp", report.id, Uuid::new_v4()));
        let published = publish(&tmp, &path, &body).await;
        if let Err(e) = fs::remove_file(&tmp).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "could not remove temporary report");
            }
        }
        match published {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(report.id.clone()))
            }
            Err(e) => return Err(e.into()),
        }
        debug!(id = %report.id, path = %path.display(), "report written");
        Ok(path.display().to_string())
    }

    async fn read(&self, id: &str) -> Result<Option<Report>, StoreError> {
        let path = self.path_for(id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<ReportSummary>, StoreError> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<StoredSummary>(&bytes).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match parsed {
                Ok(s) => out.push(ReportSummary::from(s)),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable report"),
            }
        }
        // newest first; timestamps that are not RFC 3339 sort after all that are
        out.sort_by_cached_key(|s| {
            Reverse((
                OffsetDateTime::parse(&s.timestamp, &Rfc3339).ok(),
                s.timestamp.clone(),
                s.id.clone(),
            ))
        });
        Ok(out)
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(id)?;
        Ok(fs::try_exists(&path).await?)
    }
}

/// Write `body` to `tmp` and hard-link it to `path`. Fails with `AlreadyExists` instead of
/// replacing an existing report.
async fn publish(tmp: &Path, path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp)
        .await?;
    file.write_all(body).await?;
    file.sync_all().await?;
    drop(file);
    fs::hard_link(tmp, path).await
}
