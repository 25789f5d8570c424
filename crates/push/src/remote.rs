//! Remote sessions a push pass delivers files through.

use std::time::Duration;

use tardis_credentials::ssh_target;
use tardis_model::{Credential, RemoteHost};
use tardis_ssh::{SshError, SshSession, shell_quote};
use tardis_transfer::ByteStream;

use crate::{BoxFuture, PushError};

/// One open connection to a remote host, reused for a whole pass.
///
/// Implementations report [`PushError::Session`] when the connection is
/// unusable and [`PushError::File`] for failures confined to one path.
pub trait RemoteSession: Send + Sync {
    fn mkdir_p<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), PushError>>;

    fn upload<'a>(
        &'a self,
        data: ByteStream,
        size: u64,
        path: &'a str,
    ) -> BoxFuture<'a, Result<(), PushError>>;

    /// MD5 of a remote file as computed on the host, `None` if it cannot tell.
    fn md5<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<String>, PushError>>;

    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Opens sessions for a credential on a host.
pub trait SessionFactory: Send + Sync {
    fn open<'a>(
        &'a self,
        credential: &'a Credential,
        host: &'a RemoteHost,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteSession>, PushError>>;
}

/// Sessions over SSH, with files sent by SCP.
pub struct SshSessionFactory {
    timeout: Duration,
}

impl SshSessionFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl SessionFactory for SshSessionFactory {
    fn open<'a>(
        &'a self,
        credential: &'a Credential,
        host: &'a RemoteHost,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteSession>, PushError>> {
        Box::pin(async move {
            let target = ssh_target(credential, host, self.timeout)?;
            let session = SshSession::connect(&target)
                .await
                .map_err(|e| PushError::Session(e.to_string()))?;
            Ok(Box::new(SshRemote(session)) as Box<dyn RemoteSession>)
        })
    }
}

struct SshRemote(SshSession);

fn classify(e: SshError) -> PushError {
    if e.is_session_fatal() {
        PushError::Session(e.to_string())
    } else {
        PushError::File(e.to_string())
    }
}

impl RemoteSession for SshRemote {
    fn mkdir_p<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), PushError>> {
        Box::pin(async move { self.0.mkdir_p(path).await.map_err(classify) })
    }

    fn upload<'a>(
        &'a self,
        mut data: ByteStream,
        size: u64,
        path: &'a str,
    ) -> BoxFuture<'a, Result<(), PushError>> {
        Box::pin(async move { self.0.upload(&mut data, size, path).await.map_err(classify) })
    }

    fn md5<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<String>, PushError>> {
        Box::pin(async move {
            let out = self
                .0
                .exec(&format!("md5sum -- {}", shell_quote(path)))
                .await
                .map_err(classify)?;
            if !out.success() {
                return Ok(None);
            }
            let stdout = String::from_utf8_lossy(&out.stdout);
            Ok(stdout.split_whitespace().next().map(str::to_string))
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let SshRemote(session) = *self;
        Box::pin(async move { session.close().await })
    }
}
