use serde::{Deserialize, Serialize};

use crate::{DatasetId, ExperimentId, FileId};

/// A dataset: a named group of files belonging to one or more experiments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experiments: Vec<ExperimentId>,
}

/// Logical metadata for one data file, independent of where it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub dataset_id: DatasetId,
    pub filename: String,
    /// Sub-directory within the dataset (empty for the dataset root).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha512: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl FileRecord {
    /// Returns `true` if at least one checksum has been recorded.
    pub fn has_checksums(&self) -> bool {
        self.md5.as_deref().is_some_and(|s| !s.is_empty())
            || self.sha512.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Path of the file relative to its dataset (`directory/filename`).
    pub fn relative_path(&self) -> String {
        let dir = self.directory.trim_matches('/');
        if dir.is_empty() {
            self.filename.clone()
        } else {
            format!("{dir}/{}", self.filename)
        }
    }
}

/// One physical copy of a file's bytes at a Location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub file_id: FileId,
    /// Name of the owning Location.
    pub location: String,
    /// Fully-qualified URI or a Location-relative path.
    pub uri: String,
    /// Provider tag of the Location at the time the replica was written.
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub verified: bool,
}

impl Replica {
    /// Creates an unverified replica.
    pub fn new(file_id: FileId, location: &str, uri: &str, protocol: &str) -> Self {
        Self {
            file_id,
            location: location.into(),
            uri: uri.into(),
            protocol: protocol.into(),
            verified: false,
        }
    }

    /// Returns the URI scheme, or `None` for a Location-relative path.
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.uri.split_once("://")?;
        if !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            Some(scheme)
        } else {
            None
        }
    }

    /// Returns `true` if the URI names a local filesystem object.
    pub fn is_local(&self) -> bool {
        matches!(self.scheme(), Some("file"))
    }
}
