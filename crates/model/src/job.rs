use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CredentialId, DatasetId, ExperimentId, FileId, HostId, JobId, ModelError};

/// The object a push job delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum PushTarget {
    Experiment(ExperimentId),
    Dataset(DatasetId),
    Datafile(FileId),
}

impl PushTarget {
    /// Builds a target from a request's `(type, id)` pair.
    pub fn parse(kind: &str, id: u64) -> Result<Self, ModelError> {
        match kind {
            "experiment" => Ok(Self::Experiment(id)),
            "dataset" => Ok(Self::Dataset(id)),
            "datafile" => Ok(Self::Datafile(id)),
            other => Err(ModelError::UnknownTargetType(other.into())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Experiment(_) => "experiment",
            Self::Dataset(_) => "dataset",
            Self::Datafile(_) => "datafile",
        }
    }

    pub fn id(&self) -> u64 {
        match *self {
            Self::Experiment(id) | Self::Dataset(id) | Self::Datafile(id) => id,
        }
    }
}

impl fmt::Display for PushTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

impl FromStr for PushTarget {
    type Err = ModelError;

    /// Parses `kind:id`, e.g. `dataset:12`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ModelError::UnknownTargetType(s.into()))?;
        let id = id
            .parse()
            .map_err(|_| ModelError::UnknownTargetType(s.into()))?;
        Self::parse(kind, id)
    }
}

/// One batch-transfer request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushJob {
    pub id: JobId,
    pub user: String,
    pub target: PushTarget,
    pub credential_id: CredentialId,
    pub host_id: HostId,
    /// Remote directory under which `mytardis-<id>` is created.
    #[serde(default)]
    pub base_dir: String,
    #[serde(default)]
    pub status: String,
    pub created_at: DateTime<Utc>,
    /// The job is not picked up by the sweep before this instant.
    pub not_before: DateTime<Utc>,
    /// Number of partial passes already run.
    #[serde(default)]
    pub passes: u32,
}

/// Delivery state of one file within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Done,
}

/// Per-file progress row owned by a [`PushJob`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushJobFileProgress {
    pub file_id: FileId,
    pub status: FileStatus,
    #[serde(default)]
    pub retry: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
}

impl PushJobFileProgress {
    pub fn pending(file_id: FileId) -> Self {
        Self {
            file_id,
            status: FileStatus::Pending,
            retry: 0,
            error: None,
            last_attempt: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == FileStatus::Done
    }
}
