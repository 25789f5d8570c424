use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tardis_model::{Location, Secret};
use tardis_ssh::{SshAuth, SshError, SshSession, SshTarget, shell_quote};
use tokio::io::{AsyncRead, AsyncSeekExt, ReadBuf};
use tracing::debug;
use url::Url;

use crate::uri::{candidate, decoded_path};
use crate::{
    BaseUri, BoxFuture, ByteStream, MAX_NAME_ATTEMPTS, Probe, RemoteMetadata, TransferError,
    TransferProvider, Upload,
};

/// SSH-reachable storage addressed as `scp://[user@]host[:port]/path/`.
///
/// Each operation opens its own session, so the host key is checked
/// against the pinned fingerprint before every exchange.
pub struct ScpProvider {
    base: BaseUri,
    target: SshTarget,
    metadata_supported: bool,
}

impl ScpProvider {
    pub fn from_location(location: &Location, timeout: Duration) -> Result<Self, TransferError> {
        let base = BaseUri::parse(&location.base_uri)?;
        if base.scheme() != "scp" {
            return Err(TransferError::Configuration(format!(
                "location {} needs an scp: base URI",
                location.name
            )));
        }
        let url = base.as_url();
        let host = url.host_str().ok_or_else(|| {
            TransferError::Configuration(format!("location {}: base URI has no host", location.name))
        })?;
        let username = location
            .param("username")
            .map(str::to_string)
            .or_else(|| Some(url.username().to_string()).filter(|u| !u.is_empty()))
            .ok_or_else(|| {
                TransferError::Configuration(format!("location {}: no username", location.name))
            })?;

        let auth = if let Some(key_file) = location.param("key_file") {
            let pem = std::fs::read_to_string(key_file).map_err(|e| {
                TransferError::Configuration(format!(
                    "location {}: cannot read key file {key_file}: {e}",
                    location.name
                ))
            })?;
            SshAuth::PrivateKey {
                pem: Secret::new(pem),
                passphrase: location.param("key_passphrase").map(Secret::new),
            }
        } else if let Some(password) = location.param("password") {
            SshAuth::Password(Secret::new(password))
        } else {
            return Err(TransferError::Configuration(format!(
                "location {}: needs key_file or password",
                location.name
            )));
        };

        let target = SshTarget::new(host, url.port().unwrap_or(22), &username, auth)
            .with_pinned_fingerprint(location.param("host_key").map(str::to_string))
            .with_timeout(timeout);

        Ok(Self {
            base,
            target,
            metadata_supported: location.flag("metadata_supported"),
        })
    }

    fn remote_path(&self, uri: &Url) -> Result<String, TransferError> {
        self.base.check(uri)?;
        decoded_path(uri)
    }

    async fn connect(&self) -> Result<SshSession, TransferError> {
        Ok(SshSession::connect(&self.target).await?)
    }

    async fn digest(
        &self,
        session: &SshSession,
        tool: &str,
        path: &str,
    ) -> Result<Option<String>, TransferError> {
        let out = session
            .exec(&format!("{tool} -- {}", shell_quote(path)))
            .await?;
        if out.success() {
            let stdout = String::from_utf8_lossy(&out.stdout);
            Ok(stdout.split_whitespace().next().map(str::to_string))
        } else if out.stderr_lossy().contains("No such file") {
            Ok(None)
        } else {
            Err(TransferError::Protocol(format!(
                "{tool} {path} failed: {}",
                out.stderr_lossy()
            )))
        }
    }

    async fn put(&self, upload: Upload, target: &Url) -> Result<Url, TransferError> {
        let Upload { mut data, size } = upload;

        // scp needs the length in its header, so unknown-length sources go
        // through a temporary file first.
        let (mut data, size) = match size {
            Some(size) => (data, size),
            None => {
                let spool = tempfile::tempfile()?;
                let mut spool = tokio::fs::File::from_std(spool);
                let size = tokio::io::copy(&mut data, &mut spool).await?;
                spool.rewind().await?;
                (Box::pin(spool) as ByteStream, size)
            }
        };

        let session = self.connect().await?;
        let result = async {
            let first = self.remote_path(target)?;
            if let Some((parent, _)) = first.rsplit_once('/')
                && !parent.is_empty()
            {
                session.mkdir_p(parent).await?;
            }

            for attempt in 0..MAX_NAME_ATTEMPTS {
                let url = candidate(target, attempt)?;
                let path = self.remote_path(&url)?;
                if session.exists(&path).await? {
                    continue;
                }
                session.upload(&mut data, size, &path).await?;
                debug!(host = %self.target.host, %path, size, "stored scp replica");
                return Ok(url);
            }
            Err::<Url, _>(TransferError::Protocol(format!(
                "no free name for {target} after {MAX_NAME_ATTEMPTS} attempts"
            )))
        }
        .await;
        session.close().await;
        result
    }
}

/// Download stream that keeps its SSH session alive until dropped.
struct SessionBound<R> {
    inner: R,
    _session: SshSession,
}

impl<R: AsyncRead + Unpin> AsyncRead for SessionBound<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl TransferProvider for ScpProvider {
    fn base(&self) -> &BaseUri {
        &self.base
    }

    fn length<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<Probe<u64>, TransferError>> {
        Box::pin(async move {
            let path = self.remote_path(uri)?;
            let session = self.connect().await?;
            let result = session.file_size(&path).await;
            session.close().await;
            match result {
                Ok(size) => Ok(Probe::Found(size)),
                Err(SshError::NoSuchFile(_)) => Ok(Probe::Missing),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn metadata<'a>(
        &'a self,
        uri: &'a Url,
    ) -> BoxFuture<'a, Result<Probe<RemoteMetadata>, TransferError>> {
        Box::pin(async move {
            let path = self.remote_path(uri)?;
            if !self.metadata_supported {
                return Err(TransferError::NotSupported(
                    "remote does not declare metadata_supported",
                ));
            }
            let session = self.connect().await?;
            let result = async {
                let Some(md5) = self.digest(&session, "md5sum", &path).await? else {
                    return Ok(Probe::Missing);
                };
                let sha512 = self.digest(&session, "sha512sum", &path).await?;
                let length = match session.file_size(&path).await {
                    Ok(size) => Some(size),
                    Err(SshError::NoSuchFile(_)) => return Ok(Probe::Missing),
                    Err(e) => return Err(e.into()),
                };
                Ok::<_, TransferError>(Probe::Found(RemoteMetadata {
                    md5: Some(md5),
                    sha512,
                    length,
                }))
            }
            .await;
            session.close().await;
            result
        })
    }

    fn open<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<ByteStream, TransferError>> {
        Box::pin(async move {
            let path = self.remote_path(uri)?;
            let session = self.connect().await?;
            match session.download(&path).await {
                Ok((header, reader)) => {
                    debug!(host = %self.target.host, %path, size = header.size, "scp download started");
                    Ok(Box::pin(SessionBound {
                        inner: reader,
                        _session: session,
                    }) as ByteStream)
                }
                Err(e) => {
                    session.close().await;
                    Err(e.into())
                }
            }
        })
    }

    fn store<'a>(
        &'a self,
        upload: Upload,
        target: &'a Url,
    ) -> BoxFuture<'a, Result<Url, TransferError>> {
        Box::pin(async move {
            self.base.check(target)?;
            self.put(upload, target).await
        })
    }

    fn remove<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let path = self.remote_path(uri)?;
            let session = self.connect().await?;
            let result = session.remove_file(&path).await;
            session.close().await;
            Ok(result?)
        })
    }
}
