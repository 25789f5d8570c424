//! Records shared by the replica, credential and push-job crates.
//!
//! These types are plain data: the crates that own each concern decide
//! how they are stored and mutated.

pub mod credential;
pub mod file;
pub mod job;
pub mod location;

pub use credential::{Credential, CredentialKind, KeyMaterial, RemoteHost, Secret};
pub use file::{Dataset, FileRecord, Replica};
pub use job::{FileStatus, PushJob, PushJobFileProgress, PushTarget};
pub use location::Location;

/// Identifier of an experiment in the portal catalog.
pub type ExperimentId = u64;
/// Identifier of a dataset in the portal catalog.
pub type DatasetId = u64;
/// Identifier of a logical data file.
pub type FileId = u64;
/// Identifier of a push job.
pub type JobId = u64;
/// Identifier of a remote host.
pub type HostId = u64;
/// Identifier of a stored credential.
pub type CredentialId = String;

/// Errors produced while interpreting model values.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown push target type: {0}")]
    UnknownTargetType(String),
}
