//! Batch delivery of experiments, datasets and single files to remote hosts.
//!
//! - [`JobStore`]: persisted push jobs and their per-file progress rows
//! - [`Catalog`]: lookup of datasets, files and replicas
//! - [`SessionFactory`]: remote sessions used to deliver files
//! - [`PushJobManager`]: submission, passes, backoff, sweep and workers

use std::future::Future;
use std::pin::Pin;

use tardis_credentials::CredentialError;

pub mod catalog;
pub mod layout;
mod manager;
pub mod remote;
mod store;

pub use catalog::{Catalog, MemoryCatalog};
pub use manager::{
    JobStatus, ManagerConfig, PassOutcome, PushEvent, PushJobManager, PushReceipt, PushRequest,
};
pub use remote::{RemoteSession, SessionFactory, SshSessionFactory};
pub use store::JobStore;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Attempts per file before it is considered permanently failed.
pub const MAX_RETRIES: u32 = 10;

/// Age after which a job is abandoned whatever its state.
pub const STALE_AFTER: chrono::TimeDelta = chrono::TimeDelta::days(7);

/// Delay before the next pass of a job that has run `passes` passes.
///
/// Grows by one minute per pass and is capped at one hour.
pub fn backoff(passes: u32) -> chrono::TimeDelta {
    chrono::TimeDelta::minutes(i64::from(passes.clamp(1, 60)))
}

/// Errors produced by push jobs.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("unknown push target: {0}")]
    UnknownTarget(String),

    #[error("unknown remote host: {0}")]
    UnknownHost(u64),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// The remote session is unusable; the rest of the pass is abandoned.
    #[error("session failure: {0}")]
    Session(String),

    /// Delivery of one file failed; other files are unaffected.
    #[error("{0}")]
    File(String),

    #[error("job store error: {0}")]
    Store(String),
}

impl From<std::io::Error> for PushError {
    fn from(e: std::io::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<serde_json::Error> for PushError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_and_caps() {
        assert_eq!(backoff(0), chrono::TimeDelta::minutes(1));
        assert_eq!(backoff(1), chrono::TimeDelta::minutes(1));
        assert_eq!(backoff(5), chrono::TimeDelta::minutes(5));
        assert_eq!(backoff(60), chrono::TimeDelta::minutes(60));
        assert_eq!(backoff(500), chrono::TimeDelta::minutes(60));
    }
}
