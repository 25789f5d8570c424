//! SCP wire protocol.
//!
//! The remote side runs `scp -t <path>` (sink, for uploads) or
//! `scp -f <path>` (source, for downloads) and talks over the exec
//! channel's stdin/stdout:
//!
//! ```text
//! sink:    <- \0   -> C0644 <size> <name>\n   <- \0   -> <data> \0   <- \0
//! source:  -> \0   <- C0644 <size> <name>\n   -> \0   <- <data> \0   -> \0
//! ```
//!
//! A status byte of `1` (warning) or `2` (fatal) is followed by a
//! message line instead of `\0`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::SshError;

/// File mode used for uploads.
pub const DEFAULT_MODE: u32 = 0o644;

/// Upper bound on a protocol line; anything longer is a protocol error.
const MAX_LINE: usize = 4096;

/// The `C` record announcing a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpHeader {
    pub mode: u32,
    pub size: u64,
    pub name: String,
}

impl ScpHeader {
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            mode: DEFAULT_MODE,
            size,
            name: name.into(),
        }
    }

    fn encode(&self) -> Result<String, SshError> {
        if self.name.is_empty() || self.name.contains(['/', '\n', '\0']) {
            return Err(SshError::Protocol(format!(
                "invalid scp file name: {:?}",
                self.name
            )));
        }
        Ok(format!("C{:04o} {} {}\n", self.mode & 0o7777, self.size, self.name))
    }

    fn parse(line: &str) -> Result<Self, SshError> {
        let bad = || SshError::Protocol(format!("malformed scp header: {line:?}"));
        let mut parts = line.splitn(3, ' ');
        let mode = parts.next().ok_or_else(bad)?;
        let size = parts.next().ok_or_else(bad)?;
        let name = parts.next().ok_or_else(bad)?;
        Ok(Self {
            mode: u32::from_str_radix(mode, 8).map_err(|_| bad())?,
            size: size.parse().map_err(|_| bad())?,
            name: name.to_string(),
        })
    }
}

/// Uploads one file to a remote `scp -t` sink.
///
/// Exactly `header.size` bytes are taken from `data`; a shorter source is
/// a protocol error and the remote file is left incomplete.
pub async fn send_file<S, R>(stream: &mut S, header: &ScpHeader, data: &mut R) -> Result<(), SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin + ?Sized,
{
    let record = header.encode()?;
    read_ack(stream).await?;

    stream.write_all(record.as_bytes()).await?;
    stream.flush().await?;
    read_ack(stream).await?;

    let copied = tokio::io::copy(&mut data.take(header.size), stream).await?;
    if copied != header.size {
        return Err(SshError::Protocol(format!(
            "source ended after {copied} of {} bytes",
            header.size
        )));
    }
    stream.write_all(&[0]).await?;
    stream.flush().await?;
    read_ack(stream).await?;

    stream.shutdown().await?;
    Ok(())
}

/// Starts a download from a remote `scp -f` source and returns the file
/// header. The next `header.size` bytes on `stream` are the file content.
pub async fn receive_header<S>(stream: &mut S) -> Result<ScpHeader, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[0]).await?;
    stream.flush().await?;

    loop {
        let kind = read_byte(stream).await?;
        match kind {
            b'C' => {
                let header = ScpHeader::parse(&read_line(stream).await?)?;
                stream.write_all(&[0]).await?;
                stream.flush().await?;
                return Ok(header);
            }
            // Modification times (`scp -p`); acknowledged and skipped.
            b'T' => {
                read_line(stream).await?;
                stream.write_all(&[0]).await?;
                stream.flush().await?;
            }
            1 | 2 => return Err(remote_error(read_line(stream).await?)),
            b'D' => {
                return Err(SshError::Protocol(
                    "remote path is a directory".into(),
                ));
            }
            other => {
                return Err(SshError::Protocol(format!(
                    "unexpected scp record type 0x{other:02x}"
                )));
            }
        }
    }
}

/// Completes a download after the content has been read.
pub async fn finish_receive<S>(stream: &mut S) -> Result<(), SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_ack(stream).await?;
    stream.write_all(&[0]).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_ack<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), SshError> {
    match read_byte(stream).await? {
        0 => Ok(()),
        1 | 2 => Err(remote_error(read_line(stream).await?)),
        other => Err(SshError::Protocol(format!(
            "unexpected scp status byte 0x{other:02x}"
        ))),
    }
}

async fn read_byte<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u8, SshError> {
    let mut b = [0u8; 1];
    match stream.read_exact(&mut b).await {
        Ok(_) => Ok(b[0]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SshError::Disconnected(
            "remote scp closed the channel".into(),
        )),
        Err(e) => Err(e.into()),
    }
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, SshError> {
    let mut line = Vec::new();
    loop {
        let b = read_byte(stream).await?;
        if b == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE {
            return Err(SshError::Protocol("scp line too long".into()));
        }
        line.push(b);
    }
    String::from_utf8(line).map_err(|_| SshError::Protocol("scp line is not UTF-8".into()))
}

fn remote_error(message: String) -> SshError {
    let message = message.trim().to_string();
    if message.contains("No such file or directory") {
        SshError::NoSuchFile(message)
    } else {
        SshError::Remote(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    async fn read_until_newline(s: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        loop {
            let b = s.read_u8().await.unwrap();
            if b == b'\n' {
                return String::from_utf8(out).unwrap();
            }
            out.push(b);
        }
    }

    /// Minimal `scp -t` implementation.
    async fn fake_sink(mut remote: DuplexStream) -> (String, Vec<u8>) {
        remote.write_all(&[0]).await.unwrap();
        let header = read_until_newline(&mut remote).await;
        remote.write_all(&[0]).await.unwrap();
        let size: usize = header.split(' ').nth(1).unwrap().parse().unwrap();
        let mut data = vec![0u8; size];
        remote.read_exact(&mut data).await.unwrap();
        assert_eq!(remote.read_u8().await.unwrap(), 0);
        remote.write_all(&[0]).await.unwrap();
        (header, data)
    }

    /// Minimal `scp -f` implementation.
    async fn fake_source(mut remote: DuplexStream, name: &str, data: Vec<u8>) {
        assert_eq!(remote.read_u8().await.unwrap(), 0);
        remote
            .write_all(format!("C0640 {} {name}\n", data.len()).as_bytes())
            .await
            .unwrap();
        assert_eq!(remote.read_u8().await.unwrap(), 0);
        remote.write_all(&data).await.unwrap();
        remote.write_all(&[0]).await.unwrap();
        assert_eq!(remote.read_u8().await.unwrap(), 0);
    }

    #[test]
    fn header_encode_and_parse() {
        let h = ScpHeader::new("a.txt", 11);
        let line = h.encode().unwrap();
        assert_eq!(line, "C0644 11 a.txt\n");
        let parsed = ScpHeader::parse(line[1..].trim_end()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn header_name_with_spaces() {
        let parsed = ScpHeader::parse("0600 5 my file.dat").unwrap();
        assert_eq!(parsed.name, "my file.dat");
        assert_eq!(parsed.mode, 0o600);
    }

    #[test]
    fn header_rejects_slash_in_name() {
        assert!(ScpHeader::new("../evil", 1).encode().is_err());
        assert!(ScpHeader::new("", 1).encode().is_err());
    }

    #[test]
    fn header_rejects_garbage() {
        assert!(ScpHeader::parse("0644").is_err());
        assert!(ScpHeader::parse("zz 1 a").is_err());
        assert!(ScpHeader::parse("0644 -1 a").is_err());
    }

    #[tokio::test]
    async fn upload_delivers_exact_bytes() {
        let (mut local, remote) = duplex(64 * 1024);
        let sink = tokio::spawn(fake_sink(remote));

        let payload = b"hello world".to_vec();
        let header = ScpHeader::new("a.txt", payload.len() as u64);
        send_file(&mut local, &header, &mut payload.as_slice())
            .await
            .unwrap();

        let (line, data) = sink.await.unwrap();
        assert_eq!(line, "C0644 11 a.txt");
        assert_eq!(data, payload);
    }

    #[tokio::test]
    async fn upload_of_empty_file() {
        let (mut local, remote) = duplex(1024);
        let sink = tokio::spawn(fake_sink(remote));

        let header = ScpHeader::new("b.txt", 0);
        send_file(&mut local, &header, &mut tokio::io::empty())
            .await
            .unwrap();

        let (line, data) = sink.await.unwrap();
        assert_eq!(line, "C0644 0 b.txt");
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn upload_with_short_source_fails() {
        let (mut local, remote) = duplex(1024);
        let sink = tokio::spawn(fake_sink(remote));

        let header = ScpHeader::new("a.txt", 10);
        let err = send_file(&mut local, &header, &mut &b"short"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Protocol(_)));
        sink.abort();
    }

    #[tokio::test]
    async fn upload_rejected_by_remote() {
        let (mut local, mut remote) = duplex(1024);
        let remote_task = tokio::spawn(async move {
            remote
                .write_all(b"\x02scp: /ro/a.txt: Permission denied\n")
                .await
                .unwrap();
        });

        let header = ScpHeader::new("a.txt", 1);
        let err = send_file(&mut local, &header, &mut &b"x"[..])
            .await
            .unwrap_err();
        match err {
            SshError::Remote(msg) => assert!(msg.contains("Permission denied")),
            e => panic!("unexpected error: {e}"),
        }
        remote_task.await.unwrap();
    }

    #[tokio::test]
    async fn download_roundtrip() {
        let (mut local, remote) = duplex(64 * 1024);
        let payload = (0..5000u32).map(|i| (i % 256) as u8).collect::<Vec<_>>();
        let source = tokio::spawn(fake_source(remote, "data.bin", payload.clone()));

        let header = receive_header(&mut local).await.unwrap();
        assert_eq!(header.size, payload.len() as u64);
        assert_eq!(header.name, "data.bin");
        assert_eq!(header.mode, 0o640);

        let mut data = vec![0u8; header.size as usize];
        local.read_exact(&mut data).await.unwrap();
        finish_receive(&mut local).await.unwrap();
        assert_eq!(data, payload);
        source.await.unwrap();
    }

    #[tokio::test]
    async fn download_of_missing_file() {
        let (mut local, mut remote) = duplex(1024);
        let remote_task = tokio::spawn(async move {
            assert_eq!(remote.read_u8().await.unwrap(), 0);
            remote
                .write_all(b"\x01scp: /data/x: No such file or directory\n")
                .await
                .unwrap();
        });

        let err = receive_header(&mut local).await.unwrap_err();
        assert!(matches!(err, SshError::NoSuchFile(_)));
        remote_task.await.unwrap();
    }

    #[tokio::test]
    async fn download_skips_time_record() {
        let (mut local, mut remote) = duplex(1024);
        let remote_task = tokio::spawn(async move {
            assert_eq!(remote.read_u8().await.unwrap(), 0);
            remote.write_all(b"T1700000000 0 1700000000 0\n").await.unwrap();
            assert_eq!(remote.read_u8().await.unwrap(), 0);
            remote.write_all(b"C0644 3 t.txt\n").await.unwrap();
            assert_eq!(remote.read_u8().await.unwrap(), 0);
            remote.write_all(b"abc\0").await.unwrap();
            assert_eq!(remote.read_u8().await.unwrap(), 0);
        });

        let header = receive_header(&mut local).await.unwrap();
        assert_eq!(header.size, 3);
        let mut data = [0u8; 3];
        local.read_exact(&mut data).await.unwrap();
        finish_receive(&mut local).await.unwrap();
        assert_eq!(&data, b"abc");
        remote_task.await.unwrap();
    }

    #[tokio::test]
    async fn closed_channel_is_disconnect() {
        let (mut local, mut remote) = duplex(1024);
        let remote_task = tokio::spawn(async move {
            assert_eq!(remote.read_u8().await.unwrap(), 0);
        });
        let err = receive_header(&mut local).await.unwrap_err();
        assert!(err.is_session_fatal());
        remote_task.await.unwrap();
    }
}
