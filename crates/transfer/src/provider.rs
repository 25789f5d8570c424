use url::Url;

use crate::{BaseUri, BoxFuture, ByteStream, Probe, RemoteMetadata, TransferError, Upload};

/// Protocol-specific access to stored replicas.
///
/// Every operation first checks that the URI lies under [`base`](Self::base)
/// and fails with [`TransferError::Protocol`] before any I/O if it does not.
pub trait TransferProvider: Send + Sync {
    /// Base URI every handled object must live under.
    fn base(&self) -> &BaseUri;

    /// Size of the object in bytes.
    fn length<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<Probe<u64>, TransferError>>;

    /// Remote-computed checksums; [`TransferError::NotSupported`] when the
    /// backend cannot supply them.
    fn metadata<'a>(
        &'a self,
        uri: &'a Url,
    ) -> BoxFuture<'a, Result<Probe<RemoteMetadata>, TransferError>>;

    /// Opens the object for streaming reads.
    fn open<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<ByteStream, TransferError>>;

    /// Writes `upload` at `target`, or at a disambiguated sibling name if
    /// `target` is taken. Returns the URI actually written.
    fn store<'a>(
        &'a self,
        upload: Upload,
        target: &'a Url,
    ) -> BoxFuture<'a, Result<Url, TransferError>>;

    /// Deletes the object; an already-absent object is success.
    fn remove<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<(), TransferError>>;
}
