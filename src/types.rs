use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Deserializer, Serialize};

/// One concrete scan tool invocation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ScanKind {
    KubeBench,
    Kyverno,
    TrivyImage,
    TrivySbom,
    TrivyCluster,
    Nmap,
}

impl ScanKind {
    /// Order in which an `all` run executes its steps.
    pub const ALL_ORDERED: [ScanKind; 6] = [
        ScanKind::TrivySbom,
        ScanKind::Kyverno,
        ScanKind::KubeBench,
        ScanKind::TrivyImage,
        ScanKind::Nmap,
        ScanKind::TrivyCluster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KubeBench => "kube-bench",
            Self::Kyverno => "kyverno",
            Self::TrivyImage => "trivy-image",
            Self::TrivySbom => "trivy-sbom",
            Self::TrivyCluster => "trivy-cluster",
            Self::Nmap => "nmap",
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL_ORDERED
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown scan kind: {0}")]
pub struct UnknownKind(pub String);

/// What a run request asks for: every concrete kind, or exactly one.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum RunKind {
    All,
    Single(ScanKind),
}

impl RunKind {
    /// Ordered steps this run executes.
    pub fn expand(&self) -> Vec<ScanKind> {
        match self {
            RunKind::All => ScanKind::ALL_ORDERED.to_vec(),
            RunKind::Single(kind) => vec![*kind],
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::All => f.write_str("all"),
            RunKind::Single(kind) => kind.fmt(f),
        }
    }
}

impl FromStr for RunKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(RunKind::All);
        }
        s.parse().map(RunKind::Single)
    }
}

impl TryFrom<String> for RunKind {
    type Error = UnknownKind;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunKind> for String {
    fn from(kind: RunKind) -> Self {
        kind.to_string()
    }
}

/// Outcome of a single step, and of a whole run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

impl StepStatus {
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted request to start a run. `scan_type` / `scan_id` are accepted for older clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunRequest {
    #[serde(alias = "scan_type")]
    pub run_kind: RunKind,
    #[serde(default, alias = "scan_id", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl RunRequest {
    pub fn new(run_kind: RunKind) -> Self {
        Self {
            run_kind,
            run_id: None,
            target: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Captured outcome of one step, written once after the step's process exits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    #[serde(rename = "scan_type")]
    pub kind: ScanKind,
    pub status: StepStatus,
    pub exit_code: i32,
    pub output: String,
    pub started_at: String,
    pub finished_at: String,
}

/// Persisted record of a whole run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Report {
    pub id: String,
    pub request: RunRequest,
    pub timestamp: String,
    pub results: Vec<StepResult>,
}

impl Report {
    /// Failed if any step failed, else completed.
    pub fn status(&self) -> StepStatus {
        if self
            .results
            .iter()
            .any(|r| r.status == StepStatus::Failed)
        {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        }
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            id: self.id.clone(),
            timestamp: self.timestamp.clone(),
            scan_type: self.request.run_kind,
            status: self.status(),
        }
    }
}

/// Listing entry for one stored report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReportSummary {
    pub id: String,
    pub timestamp: String,
    pub scan_type: RunKind,
    pub status: StepStatus,
}

/// Reply to a start-run request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartResponse {
    pub run_id: String,
    pub status: String,
}

impl StartResponse {
    pub fn initiated(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: "initiated".into(),
        }
    }
}

/// Where a run is in its lifecycle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Running {
        step: usize,
        total: usize,
        kind: ScanKind,
    },
    Completed,
    Failed,
    /// No in-flight run and no stored report; the outcome cannot be told.
    Unknown,
}

impl From<StepStatus> for RunPhase {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Completed => RunPhase::Completed,
            StepStatus::Failed => RunPhase::Failed,
        }
    }
}

const MAX_RUN_ID_LEN: usize = 128;

/// Check that a client-supplied run id is safe to use as a storage key.
pub fn validate_run_id(id: &str) -> Result<(), InvalidRunId> {
    if id.is_empty() || id.len() > MAX_RUN_ID_LEN || id.starts_with('.') {
        return Err(InvalidRunId(id.to_string()));
    }
    let ok = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(InvalidRunId(id.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid run id: {0:?}")]
pub struct InvalidRunId(pub String);

pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// RFC 3339 UTC timestamp.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
