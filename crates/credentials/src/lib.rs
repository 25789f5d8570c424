//! Host and transport credentials for outbound pushes.
//!
//! The [`CredentialStore`] owns every [`RemoteHost`](tardis_model::RemoteHost)
//! and [`Credential`](tardis_model::Credential). Readers always see a whole
//! snapshot: a credential is either fully present or absent.

mod access;
mod signing;
mod store;

use std::future::Future;
use std::pin::Pin;

pub use access::{AccessVerifier, SshAccessVerifier, ssh_target};
pub use signing::CertificateSigner;
pub use store::CredentialStore;

/// Smallest RSA-equivalent strength accepted for generated keys.
pub const MIN_KEY_BITS: u32 = 2048;

/// Boxed future returned by [`AccessVerifier`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from credential operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no credential of {user} grants access to host {host}")]
    NoSuitableCredential { user: String, host: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("signing service error: {0}")]
    Signing(String),

    #[error("access check failed: {0}")]
    Access(#[from] tardis_ssh::SshError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
