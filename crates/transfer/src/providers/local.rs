use std::io::ErrorKind;
use std::path::PathBuf;

use tardis_model::Location;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use crate::uri::candidate;
use crate::{
    BaseUri, BoxFuture, ByteStream, MAX_NAME_ATTEMPTS, Probe, RemoteMetadata, TransferError,
    TransferProvider, Upload,
};

/// Filesystem or shared-storage backend rooted at a `file:` base URI.
pub struct LocalProvider {
    base: BaseUri,
}

impl LocalProvider {
    pub fn new(base: BaseUri) -> Result<Self, TransferError> {
        if base.scheme() != "file" {
            return Err(TransferError::Configuration(format!(
                "local provider needs a file: base URI, got {}",
                base.as_url()
            )));
        }
        base.as_url().to_file_path().map_err(|()| {
            TransferError::Configuration(format!("{} is not a local path", base.as_url()))
        })?;
        Ok(Self { base })
    }

    pub fn from_location(location: &Location) -> Result<Self, TransferError> {
        Self::new(BaseUri::parse(&location.base_uri)?)
    }

    fn path_of(&self, uri: &Url) -> Result<PathBuf, TransferError> {
        self.base.check(uri)?;
        uri.to_file_path()
            .map_err(|()| TransferError::InvalidPath(format!("{uri} is not a local path")))
    }

    async fn write_new(&self, upload: Upload, target: &Url) -> Result<Url, TransferError> {
        let first = self.path_of(target)?;
        if let Some(parent) = first.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut opened = None;
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let url = candidate(target, attempt)?;
            let path = self.path_of(&url)?;
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => {
                    opened = Some((url, path, file));
                    break;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let Some((url, path, mut file)) = opened else {
            return Err(TransferError::Protocol(format!(
                "no free name for {target} after {MAX_NAME_ATTEMPTS} attempts"
            )));
        };

        let Upload { mut data, size } = upload;
        let written = async {
            let n = tokio::io::copy(&mut data, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, TransferError>(n)
        }
        .await;

        match written {
            Ok(n) if size.is_none_or(|s| s == n) => {
                debug!(path = %path.display(), bytes = n, "stored local replica");
                Ok(url)
            }
            Ok(n) => {
                discard(&path).await;
                Err(TransferError::Protocol(format!(
                    "short write to {url}: expected {} bytes, got {n}",
                    size.unwrap_or_default()
                )))
            }
            Err(e) => {
                discard(&path).await;
                Err(e)
            }
        }
    }
}

async fn discard(path: &std::path::Path) {
    if let Err(e) = fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "failed to remove partial file");
    }
}

impl TransferProvider for LocalProvider {
    fn base(&self) -> &BaseUri {
        &self.base
    }

    fn length<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<Probe<u64>, TransferError>> {
        Box::pin(async move {
            let path = self.path_of(uri)?;
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(Probe::Found(meta.len())),
                Ok(_) => Err(TransferError::Protocol(format!("{uri} is not a regular file"))),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(Probe::Missing),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn metadata<'a>(
        &'a self,
        uri: &'a Url,
    ) -> BoxFuture<'a, Result<Probe<RemoteMetadata>, TransferError>> {
        Box::pin(async move {
            self.path_of(uri)?;
            Err(TransferError::NotSupported(
                "local storage does not record checksums",
            ))
        })
    }

    fn open<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<ByteStream, TransferError>> {
        Box::pin(async move {
            let path = self.path_of(uri)?;
            match fs::File::open(&path).await {
                Ok(file) => Ok(Box::pin(file) as ByteStream),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Err(TransferError::NotFound(uri.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn store<'a>(
        &'a self,
        upload: Upload,
        target: &'a Url,
    ) -> BoxFuture<'a, Result<Url, TransferError>> {
        Box::pin(self.write_new(upload, target))
    }

    fn remove<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let path = self.path_of(uri)?;
            match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn provider(dir: &tempfile::TempDir) -> LocalProvider {
        let base = Url::from_directory_path(dir.path()).unwrap();
        LocalProvider::new(BaseUri::parse(base.as_str()).unwrap()).unwrap()
    }

    async fn read_all(p: &LocalProvider, uri: &Url) -> Vec<u8> {
        let mut out = Vec::new();
        p.open(uri).await.unwrap().read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn rejects_non_file_base() {
        let base = BaseUri::parse("http://h/x/").unwrap();
        assert!(matches!(
            LocalProvider::new(base),
            Err(TransferError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn store_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(&dir);
        let target = p.base().join("7/raw/a.txt").unwrap();

        let stored = p
            .store(Upload::from_bytes(b"hello world".to_vec()), &target)
            .await
            .unwrap();
        assert_eq!(stored, target);
        assert_eq!(read_all(&p, &stored).await, b"hello world");
        assert_eq!(p.length(&stored).await.unwrap(), Probe::Found(11));
    }

    #[tokio::test]
    async fn collision_gets_new_name() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(&dir);
        let target = p.base().join("a.txt").unwrap();

        let first = p.store(Upload::from_bytes(b"one".to_vec()), &target).await.unwrap();
        let second = p.store(Upload::from_bytes(b"two".to_vec()), &target).await.unwrap();
        assert_eq!(first, target);
        assert_eq!(p.base().relativize(&second).as_deref(), Some("a_1.txt"));
        assert_eq!(read_all(&p, &first).await, b"one");
        assert_eq!(read_all(&p, &second).await, b"two");
    }

    #[tokio::test]
    async fn short_upload_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(&dir);
        let target = p.base().join("short.bin").unwrap();
        let upload = Upload::new(Box::pin(std::io::Cursor::new(vec![1u8; 4])), Some(10));

        assert!(p.store(upload, &target).await.is_err());
        assert_eq!(p.length(&target).await.unwrap(), Probe::Missing);
    }

    #[tokio::test]
    async fn missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(&dir);
        let uri = p.base().join("nope").unwrap();
        assert_eq!(p.length(&uri).await.unwrap(), Probe::Missing);
        assert!(matches!(p.open(&uri).await, Err(TransferError::NotFound(_))));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(&dir);
        let uri = p
            .store(Upload::from_bytes(vec![0; 3]), &p.base().join("x").unwrap())
            .await
            .unwrap();
        p.remove(&uri).await.unwrap();
        p.remove(&uri).await.unwrap();
    }

    #[tokio::test]
    async fn foreign_uri_fails_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(&dir);
        let outside = Url::parse("file:///etc/passwd").unwrap();
        assert!(matches!(p.length(&outside).await, Err(TransferError::Protocol(_))));
        assert!(matches!(p.remove(&outside).await, Err(TransferError::Protocol(_))));
        assert!(matches!(p.metadata(&outside).await, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn metadata_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(&dir);
        let uri = p.base().join("a").unwrap();
        assert!(matches!(p.metadata(&uri).await, Err(TransferError::NotSupported(_))));
    }
}
