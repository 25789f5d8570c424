//! russh client sessions.
//!
//! One [`SshSession`] is one authenticated connection. Commands and SCP
//! transfers each open their own channel, so a session can be reused
//! for every file of a push pass.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::{Certificate, HashAlg, PrivateKeyWithHashAlg, PublicKey, decode_secret_key};
use russh::{ChannelMsg, Disconnect};
use tardis_model::Secret;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info};

use crate::scp::{self, ScpHeader};
use crate::{DEFAULT_TIMEOUT, SshError, shell_quote, verify_host_key};

/// How to authenticate as the remote user.
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(Secret),
    PrivateKey {
        pem: Secret,
        passphrase: Option<Secret>,
    },
    /// A private key plus the OpenSSH certificate signed for it.
    Certificate { pem: Secret, certificate: String },
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    /// Expected `SHA256:` host key fingerprint.
    pub pinned_fingerprint: Option<String>,
    pub timeout: Duration,
}

impl SshTarget {
    pub fn new(host: &str, port: u16, username: &str, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth,
            pinned_fingerprint: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_pinned_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.pinned_fingerprint = fingerprint;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Captured result of a remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_status: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Handler that enforces the pinned host key before any data is exchanged.
struct PinnedHostKey {
    host: String,
    pinned: Option<String>,
    rejected: Arc<Mutex<Option<String>>>,
}

impl client::Handler for PinnedHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let presented = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match verify_host_key(&self.host, self.pinned.as_deref(), &presented) {
            Ok(()) => Ok(true),
            Err(_) => {
                if let Ok(mut slot) = self.rejected.lock() {
                    *slot = Some(presented);
                }
                Ok(false)
            }
        }
    }
}

/// An authenticated SSH connection.
pub struct SshSession {
    handle: Handle<PinnedHostKey>,
    host: String,
    timeout: Duration,
}

impl SshSession {
    /// Connects, checks the host key against the pin and authenticates.
    pub async fn connect(target: &SshTarget) -> Result<Self, SshError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(target.timeout * 5),
            ..Default::default()
        });
        let rejected = Arc::new(Mutex::new(None));
        let handler = PinnedHostKey {
            host: target.host.clone(),
            pinned: target.pinned_fingerprint.clone(),
            rejected: Arc::clone(&rejected),
        };

        let connect = client::connect(config, (target.host.as_str(), target.port), handler);
        let mut handle = match tokio::time::timeout(target.timeout, connect).await {
            Err(_) => return Err(SshError::Timeout),
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let presented = rejected.lock().ok().and_then(|mut r| r.take());
                return Err(match presented {
                    Some(presented) => SshError::HostKeyMismatch {
                        host: target.host.clone(),
                        expected: target.pinned_fingerprint.clone().unwrap_or_default(),
                        presented,
                    },
                    None => SshError::Connect {
                        host: target.host.clone(),
                        reason: e.to_string(),
                    },
                });
            }
        };

        let auth = tokio::time::timeout(target.timeout, authenticate(&mut handle, target))
            .await
            .map_err(|_| SshError::Timeout)??;
        if !auth {
            return Err(SshError::AuthFailed {
                user: target.username.clone(),
                host: target.host.clone(),
            });
        }

        info!(host = %target.host, user = %target.username, "ssh session established");
        Ok(Self {
            handle,
            host: target.host.clone(),
            timeout: target.timeout,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns `true` once the underlying connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Runs a command and collects its output.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        tokio::time::timeout(self.timeout, self.exec_inner(command))
            .await
            .map_err(|_| SshError::Timeout)?
    }

    async fn exec_inner(&self, command: &str) -> Result<ExecOutput, SshError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut out = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => out.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => out.stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => out.exit_status = Some(exit_status),
                _ => {}
            }
        }
        debug!(host = %self.host, %command, status = ?out.exit_status, "remote command finished");
        Ok(out)
    }

    /// Starts a command and returns its stdin/stdout as one byte stream.
    async fn exec_stream(
        &self,
        command: &str,
    ) -> Result<impl AsyncRead + AsyncWrite + Unpin + Send + use<>, SshError> {
        let open = async {
            let channel = self.handle.channel_open_session().await?;
            channel.exec(true, command).await?;
            Ok::<_, SshError>(channel.into_stream())
        };
        tokio::time::timeout(self.timeout, open)
            .await
            .map_err(|_| SshError::Timeout)?
    }

    /// Creates `path` and any missing parents.
    pub async fn mkdir_p(&self, path: &str) -> Result<(), SshError> {
        let out = self.exec(&format!("mkdir -p -- {}", shell_quote(path))).await?;
        if out.success() {
            Ok(())
        } else {
            Err(SshError::Remote(format!(
                "mkdir {path} failed: {}",
                out.stderr_lossy()
            )))
        }
    }

    /// Removes a file; an absent file is not an error.
    pub async fn remove_file(&self, path: &str) -> Result<(), SshError> {
        let out = self.exec(&format!("rm -f -- {}", shell_quote(path))).await?;
        if out.success() {
            Ok(())
        } else {
            Err(SshError::Remote(format!(
                "rm {path} failed: {}",
                out.stderr_lossy()
            )))
        }
    }

    /// Returns `true` if anything exists at `path`.
    pub async fn exists(&self, path: &str) -> Result<bool, SshError> {
        let out = self.exec(&format!("test -e {}", shell_quote(path))).await?;
        match out.exit_status {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(SshError::Remote(format!(
                "test -e {path} failed: {}",
                out.stderr_lossy()
            ))),
        }
    }

    /// Uploads `size` bytes from `data` to `remote_path` over SCP.
    pub async fn upload<R>(&self, data: &mut R, size: u64, remote_path: &str) -> Result<(), SshError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let name = file_name(remote_path)?;
        let mut stream = self
            .exec_stream(&format!("scp -t -- {}", shell_quote(remote_path)))
            .await?;
        scp::send_file(&mut stream, &ScpHeader::new(name, size), data).await?;
        debug!(host = %self.host, path = %remote_path, size, "scp upload complete");
        Ok(())
    }

    /// Returns the size of a remote file from its SCP header without
    /// reading the content.
    pub async fn file_size(&self, remote_path: &str) -> Result<u64, SshError> {
        let mut stream = self
            .exec_stream(&format!("scp -f -- {}", shell_quote(remote_path)))
            .await?;
        let header = tokio::time::timeout(self.timeout, scp::receive_header(&mut stream))
            .await
            .map_err(|_| SshError::Timeout)??;
        Ok(header.size)
    }

    /// Starts an SCP download and returns a reader over exactly the file's bytes.
    pub async fn download(
        &self,
        remote_path: &str,
    ) -> Result<(ScpHeader, impl AsyncRead + Unpin + Send + use<>), SshError> {
        let mut stream = self
            .exec_stream(&format!("scp -f -- {}", shell_quote(remote_path)))
            .await?;
        let header = tokio::time::timeout(self.timeout, scp::receive_header(&mut stream))
            .await
            .map_err(|_| SshError::Timeout)??;
        let size = header.size;
        Ok((header, stream.take(size)))
    }

    /// Closes the connection.
    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

async fn authenticate(
    handle: &mut Handle<PinnedHostKey>,
    target: &SshTarget,
) -> Result<bool, SshError> {
    let user = target.username.as_str();
    let result = match &target.auth {
        SshAuth::Password(password) => handle.authenticate_password(user, password.expose()).await?,
        SshAuth::PrivateKey { pem, passphrase } => {
            let key = decode_secret_key(pem.expose(), passphrase.as_ref().map(Secret::expose))?;
            let hash = handle.best_supported_rsa_hash().await?.flatten();
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
                .await?
        }
        SshAuth::Certificate { pem, certificate } => {
            let key = decode_secret_key(pem.expose(), None)?;
            let cert = Certificate::from_openssh(certificate.trim())
                .map_err(|e| SshError::Key(format!("invalid certificate: {e}")))?;
            handle
                .authenticate_openssh_cert(user, Arc::new(key), cert)
                .await?
        }
    };
    Ok(result.success())
}

fn file_name(remote_path: &str) -> Result<&str, SshError> {
    remote_path
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| SshError::Protocol(format!("remote path has no file name: {remote_path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_from_path() {
        assert_eq!(file_name("/base/mytardis-1/ds_7/a.txt").unwrap(), "a.txt");
        assert_eq!(file_name("a.txt").unwrap(), "a.txt");
        assert!(file_name("/base/dir/").is_err());
    }

    #[test]
    fn target_builder() {
        let target = SshTarget::new("hpc", 2222, "alice", SshAuth::Password(Secret::new("pw")))
            .with_pinned_fingerprint(Some("SHA256:abc".into()))
            .with_timeout(Duration::from_secs(5));
        assert_eq!(target.port, 2222);
        assert_eq!(target.pinned_fingerprint.as_deref(), Some("SHA256:abc"));
        assert_eq!(target.timeout, Duration::from_secs(5));
        assert!(!format!("{target:?}").contains("pw\""));
    }

    #[tokio::test]
    async fn unreachable_host_fails_without_transfer() {
        // Port 9 on loopback: nothing listens there in the test environment.
        let target = SshTarget::new("127.0.0.1", 9, "nobody", SshAuth::Password(Secret::new("x")))
            .with_timeout(Duration::from_secs(2));
        let err = SshSession::connect(&target).await.err().unwrap();
        assert!(err.is_session_fatal());
    }

    mod loopback {
        use std::net::TcpListener;

        use super::*;
        use crate::testing::TestHost;

        fn can_bind_localhost() -> bool {
            TcpListener::bind("127.0.0.1:0").is_ok()
        }

        fn target(host: &TestHost, pin: &str) -> SshTarget {
            SshTarget::new("127.0.0.1", host.port, "alice", SshAuth::Password(Secret::new("pw")))
                .with_pinned_fingerprint(Some(pin.into()))
                .with_timeout(Duration::from_secs(10))
        }

        #[tokio::test]
        async fn wrong_pin_is_refused_before_authentication() {
            if !can_bind_localhost() {
                return;
            }
            let dir = tempfile::tempdir().unwrap();
            let host = TestHost::start(dir.path(), "alice", "pw").await.unwrap();
            let pin = "SHA256:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

            let err = SshSession::connect(&target(&host, pin)).await.err().unwrap();
            match err {
                SshError::HostKeyMismatch {
                    host: h,
                    expected,
                    presented,
                } => {
                    assert_eq!(h, "127.0.0.1");
                    assert_eq!(expected, pin);
                    assert_eq!(presented, host.fingerprint);
                }
                other => panic!("expected host key mismatch, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn unpinned_host_is_accepted() {
            if !can_bind_localhost() {
                return;
            }
            let dir = tempfile::tempdir().unwrap();
            let host = TestHost::start(dir.path(), "alice", "pw").await.unwrap();
            let target = target(&host, "unused").with_pinned_fingerprint(None);

            let session = SshSession::connect(&target).await.unwrap();
            assert!(!session.is_closed());
            session.close().await;
        }

        #[tokio::test]
        async fn wrong_password_is_auth_failure() {
            if !can_bind_localhost() {
                return;
            }
            let dir = tempfile::tempdir().unwrap();
            let host = TestHost::start(dir.path(), "alice", "pw").await.unwrap();
            let mut target = target(&host, &host.fingerprint);
            target.auth = SshAuth::Password(Secret::new("nope"));

            let err = SshSession::connect(&target).await.err().unwrap();
            assert!(matches!(err, SshError::AuthFailed { .. }), "{err:?}");
        }

        #[tokio::test]
        async fn upload_download_and_remove() {
            if !can_bind_localhost() {
                return;
            }
            let dir = tempfile::tempdir().unwrap();
            let host = TestHost::start(dir.path(), "alice", "pw").await.unwrap();
            let session = SshSession::connect(&target(&host, &host.fingerprint))
                .await
                .unwrap();

            session.mkdir_p("/data/7").await.unwrap();
            assert!(!session.exists("/data/7/a b.txt").await.unwrap());

            let content = b"replica bytes";
            session
                .upload(&mut &content[..], content.len() as u64, "/data/7/a b.txt")
                .await
                .unwrap();
            assert_eq!(std::fs::read(dir.path().join("data/7/a b.txt")).unwrap(), content);
            assert!(session.exists("/data/7/a b.txt").await.unwrap());
            assert_eq!(session.file_size("/data/7/a b.txt").await.unwrap(), 13);

            let (header, mut reader) = session.download("/data/7/a b.txt").await.unwrap();
            assert_eq!(header.name, "a b.txt");
            let mut back = Vec::new();
            reader.read_to_end(&mut back).await.unwrap();
            assert_eq!(back, content);

            assert!(matches!(
                session.file_size("/data/7/gone.txt").await,
                Err(SshError::NoSuchFile(_))
            ));

            session.remove_file("/data/7/a b.txt").await.unwrap();
            session.remove_file("/data/7/a b.txt").await.unwrap();
            assert!(!session.exists("/data/7/a b.txt").await.unwrap());
            session.close().await;
        }
    }
}
