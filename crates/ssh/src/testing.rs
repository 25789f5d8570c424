//! A loopback SSH host for tests.
//!
//! [`TestHost`] runs a russh server on `127.0.0.1` that accepts one
//! user/password pair and serves the handful of commands the client side
//! issues (`mkdir -p`, `test -e`, `rm -f`, `scp -t`, `scp -f`) against a
//! local directory. Remote absolute paths are resolved under that
//! directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use russh::keys::HashAlg;
use russh::keys::ssh_key::PrivateKey;
use russh::keys::ssh_key::private::Ed25519Keypair;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A running loopback SSH host. Stops when dropped.
pub struct TestHost {
    pub port: u16,
    /// `SHA256:` fingerprint of the host key.
    pub fingerprint: String,
    accept: JoinHandle<()>,
}

impl TestHost {
    /// Starts a host serving `root` to `user` authenticated by `password`.
    pub async fn start(root: &Path, user: &str, password: &str) -> std::io::Result<Self> {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let key = PrivateKey::from(Ed25519Keypair::from_seed(&seed));
        let fingerprint = key.public_key().fingerprint(HashAlg::Sha256).to_string();

        let config = Arc::new(server::Config {
            keys: vec![key],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let host = FakeHost {
            root: root.to_path_buf(),
            user: user.into(),
            password: password.into(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let config = Arc::clone(&config);
                let handler = host.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, stream, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        Ok(Self {
            port,
            fingerprint,
            accept,
        })
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

#[derive(Clone)]
struct FakeHost {
    root: PathBuf,
    user: String,
    password: String,
}

impl server::Handler for FakeHost {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == self.user && password == self.password {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tokio::spawn(serve_channel(self.root.clone(), channel));
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }
}

/// Waits for the exec request, runs it, then reports the exit status.
async fn serve_channel(root: PathBuf, mut channel: Channel<Msg>) {
    let command = loop {
        match channel.wait().await {
            Some(ChannelMsg::Exec { command, .. }) => {
                break String::from_utf8_lossy(&command).into_owned();
            }
            Some(_) => continue,
            None => return,
        }
    };

    let mut stderr = Box::pin(channel.make_writer_ext(Some(1)));
    let mut stdout = Box::pin(channel.make_writer());
    let status = {
        let reader = channel.make_reader();
        tokio::pin!(reader);
        match run(&root, &command, &mut reader, &mut stdout).await {
            Ok(status) => status,
            Err(message) => {
                let _ = stderr.write_all(format!("{message}\n").as_bytes()).await;
                let _ = stderr.flush().await;
                1
            }
        }
    };
    let _ = stdout.flush().await;
    let _ = channel.exit_status(status).await;
    let _ = channel.eof().await;
    let _ = channel.close().await;
}

async fn run<R, W>(root: &Path, command: &str, stdin: &mut R, stdout: &mut W) -> Result<u32, String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let local = |arg: &str| -> Result<PathBuf, String> {
        let path = unquote(arg)?;
        Ok(root.join(path.trim_start_matches('/')))
    };

    if let Some(arg) = command.strip_prefix("mkdir -p -- ") {
        let path = local(arg)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| format!("mkdir: {}: {e}", path.display()))?;
        Ok(0)
    } else if let Some(arg) = command.strip_prefix("rm -f -- ") {
        match tokio::fs::remove_file(local(arg)?).await {
            Ok(()) => Ok(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(format!("rm: {e}")),
        }
    } else if let Some(arg) = command.strip_prefix("test -e ") {
        let exists = tokio::fs::try_exists(local(arg)?).await.unwrap_or(false);
        Ok(if exists { 0 } else { 1 })
    } else if let Some(arg) = command.strip_prefix("scp -t -- ") {
        sink(&local(arg)?, stdin, stdout).await
    } else if let Some(arg) = command.strip_prefix("scp -f -- ") {
        source(&local(arg)?, stdin, stdout).await
    } else {
        Err(format!("sh: {command}: not found"))
    }
}

/// The receiving end of an upload.
async fn sink<R, W>(path: &Path, stdin: &mut R, stdout: &mut W) -> Result<u32, String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let io = |e: std::io::Error| e.to_string();
    ack(stdout).await.map_err(io)?;

    let line = read_line(stdin).await.map_err(io)?;
    let size: usize = line
        .strip_prefix('C')
        .and_then(|rest| rest.split(' ').nth(1))
        .and_then(|size| size.parse().ok())
        .ok_or_else(|| format!("bad scp record {line:?}"))?;
    ack(stdout).await.map_err(io)?;

    let mut content = vec![0u8; size];
    stdin.read_exact(&mut content).await.map_err(io)?;
    let mut end = [0u8; 1];
    stdin.read_exact(&mut end).await.map_err(io)?;
    tokio::fs::write(path, &content)
        .await
        .map_err(|e| format!("scp: {}: {e}", path.display()))?;
    ack(stdout).await.map_err(io)?;
    Ok(0)
}

/// The sending end of a download.
async fn source<R, W>(path: &Path, stdin: &mut R, stdout: &mut W) -> Result<u32, String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let io = |e: std::io::Error| e.to_string();
    let mut ready = [0u8; 1];
    stdin.read_exact(&mut ready).await.map_err(io)?;

    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) => {
            let message = match e.kind() {
                std::io::ErrorKind::NotFound => "No such file or directory".to_string(),
                _ => e.to_string(),
            };
            let line = format!("\x01scp: {}: {message}\n", path.display());
            stdout.write_all(line.as_bytes()).await.map_err(io)?;
            stdout.flush().await.map_err(io)?;
            return Ok(1);
        }
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    stdout
        .write_all(format!("C0644 {} {name}\n", content.len()).as_bytes())
        .await
        .map_err(io)?;
    stdout.flush().await.map_err(io)?;
    stdin.read_exact(&mut ready).await.map_err(io)?;

    stdout.write_all(&content).await.map_err(io)?;
    stdout.write_all(&[0]).await.map_err(io)?;
    stdout.flush().await.map_err(io)?;
    // A client that only wanted the header hangs up here.
    let _ = stdin.read_exact(&mut ready).await;
    Ok(0)
}

async fn ack<W: AsyncWrite + Unpin>(stdout: &mut W) -> std::io::Result<()> {
    stdout.write_all(&[0]).await?;
    stdout.flush().await
}

async fn read_line<R: AsyncRead + Unpin>(stdin: &mut R) -> std::io::Result<String> {
    let mut line = Vec::new();
    loop {
        let mut b = [0u8; 1];
        stdin.read_exact(&mut b).await?;
        if b[0] == b'\n' {
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        line.push(b[0]);
    }
}

/// Reverses POSIX single-quote escaping.
fn unquote(arg: &str) -> Result<String, String> {
    let mut out = String::new();
    let mut chars = arg.chars();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        match (quoted, c) {
            (_, '\'') => quoted = !quoted,
            (false, '\\') => out.extend(chars.next()),
            (_, c) => out.push(c),
        }
    }
    if quoted {
        Err(format!("unterminated quote in {arg:?}"))
    } else {
        Ok(out)
    }
}
