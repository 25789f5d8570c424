//! Replica transfer: one contract over local, HTTP and SCP storage.
//!
//! A [`ProviderRegistry`] is built once at start-up from the configured
//! [`Location`](tardis_model::Location)s and handed to everything that
//! reads or writes replicas. [`ReplicaVerifier`] confirms a stored copy
//! against its [`FileRecord`](tardis_model::FileRecord) before the copy
//! is ever treated as transferred.

mod copy;
mod provider;
pub mod providers;
mod registry;
mod uri;
mod validation;
mod verify;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

pub use copy::ReplicaCopier;
pub use provider::TransferProvider;
pub use registry::{CustomFactory, Provider, ProviderRegistry, RegistryBuilder};
pub use uri::{BaseUri, disambiguate};
pub use validation::validate_relative_path;
pub use verify::{
    Expected, ReplicaVerifier, VerificationReport, VerifyError, VerifyMethod, VerifyOptions,
};

/// Default bound on a single provider operation.
pub const DEFAULT_OPERATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// How many disambiguated names `store` tries before giving up.
pub const MAX_NAME_ATTEMPTS: u32 = 100;

/// Boxed future returned by provider operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lazy byte stream; dropping it releases the underlying handle or connection.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Errors produced by transfer providers.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("operation timed out")]
    Timeout,
}

impl From<tardis_ssh::SshError> for TransferError {
    fn from(e: tardis_ssh::SshError) -> Self {
        match e {
            tardis_ssh::SshError::NoSuchFile(msg) => Self::NotFound(msg),
            tardis_ssh::SshError::Timeout => Self::Timeout,
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Protocol(e.to_string())
        }
    }
}

/// Outcome of a lookup where absence is an ordinary answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Found(T),
    Missing,
}

impl<T> Probe<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(v) => Some(v),
            Self::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

/// Checksums and size reported by a backend without transferring content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha512: Option<String>,
    #[serde(default)]
    pub length: Option<u64>,
}

/// Bytes to store, with their length when known up front.
pub struct Upload {
    pub data: ByteStream,
    pub size: Option<u64>,
}

impl Upload {
    pub fn new(data: ByteStream, size: Option<u64>) -> Self {
        Self { data, size }
    }

    /// Wraps an in-memory buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            data: Box::pin(std::io::Cursor::new(bytes)),
            size: Some(size),
        }
    }
}
