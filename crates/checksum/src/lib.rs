//! Single-pass checksum computation for replica verification.
//!
//! Every byte is fed once through MD5 and SHA-512 while the first
//! [`SNIFF_LEN`] bytes are kept aside to detect a content type.

mod reader;

use std::io::Read;
use std::path::Path;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt};

pub use reader::{ChecksumHandle, HashingReader};

/// Number of leading bytes inspected for content-type detection.
pub const SNIFF_LEN: usize = 8192;

/// Read buffer size for streaming checksums.
const READ_BUF: usize = 64 * 1024;

/// Content type reported when nothing more specific is detected.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Checksums and size of a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub md5: String,
    pub sha512: String,
    pub size: u64,
    pub content_type: String,
}

/// Incremental MD5 + SHA-512 + content-type computer.
#[derive(Clone)]
pub struct ChecksumComputer {
    md5: Md5,
    sha512: Sha512,
    size: u64,
    head: Vec<u8>,
}

impl Default for ChecksumComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumComputer {
    pub fn new() -> Self {
        Self {
            md5: Md5::new(),
            sha512: Sha512::new(),
            size: 0,
            head: Vec::new(),
        }
    }

    /// Feeds the next slice of bytes.
    pub fn update(&mut self, data: &[u8]) {
        if self.head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.head.len()).min(data.len());
            self.head.extend_from_slice(&data[..take]);
        }
        self.md5.update(data);
        self.sha512.update(data);
        self.size += data.len() as u64;
    }

    /// Bytes consumed so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Consumes the computer and returns the final checksums.
    pub fn finish(self) -> Checksums {
        Checksums {
            md5: hex::encode(self.md5.finalize()),
            sha512: hex::encode(self.sha512.finalize()),
            size: self.size,
            content_type: sniff_content_type(&self.head).to_string(),
        }
    }
}

/// Computes checksums of an in-memory buffer.
pub fn checksum_bytes(data: &[u8]) -> Checksums {
    let mut c = ChecksumComputer::new();
    c.update(data);
    c.finish()
}

/// Computes checksums of a file with blocking reads.
pub fn checksum_file(path: &Path) -> std::io::Result<Checksums> {
    let mut file = std::fs::File::open(path)?;
    let mut computer = ChecksumComputer::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        computer.update(&buf[..n]);
    }
    Ok(computer.finish())
}

/// Drains an async reader exactly once and returns its checksums.
pub async fn checksum_reader<R>(reader: &mut R) -> std::io::Result<Checksums>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut computer = ChecksumComputer::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        computer.update(&buf[..n]);
    }
    Ok(computer.finish())
}

/// Detects a MIME type from leading bytes.
///
/// Magic-number matches win; otherwise NUL-free UTF-8 is `text/plain`
/// and anything else is `application/octet-stream`.
pub fn sniff_content_type(head: &[u8]) -> &'static str {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type();
    }
    if head.is_empty() {
        return OCTET_STREAM;
    }
    if !head.contains(&0) && looks_like_utf8(head) {
        return "text/plain";
    }
    OCTET_STREAM
}

/// UTF-8 check tolerant of a multi-byte sequence cut off at the sniff boundary.
fn looks_like_utf8(head: &[u8]) -> bool {
    match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none() && head.len() - e.valid_up_to() < 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";
    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";
    const EMPTY_SHA512: &str = "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e";

    #[test]
    fn known_digests() {
        let c = checksum_bytes(b"hello world");
        assert_eq!(c.md5, HELLO_MD5);
        assert_eq!(c.sha512.len(), 128);
        assert_eq!(c.size, 11);
        assert_eq!(c.content_type, "text/plain");
    }

    #[test]
    fn empty_input() {
        let c = checksum_bytes(b"");
        assert_eq!(c.md5, EMPTY_MD5);
        assert_eq!(c.sha512, EMPTY_SHA512);
        assert_eq!(c.size, 0);
        assert_eq!(c.content_type, OCTET_STREAM);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut c = ChecksumComputer::new();
        for part in data.chunks(777) {
            c.update(part);
        }
        assert_eq!(c.size(), data.len() as u64);
        assert_eq!(c.finish(), checksum_bytes(&data));
    }

    #[test]
    fn single_bit_flip_changes_both_digests() {
        let mut data = b"The quick brown fox jumps over the lazy dog".to_vec();
        let original = checksum_bytes(&data);
        data[10] ^= 0x01;
        let flipped = checksum_bytes(&data);
        assert_ne!(original.md5, flipped.md5);
        assert_ne!(original.sha512, flipped.sha512);
        assert_eq!(original.size, flipped.size);
    }

    #[test]
    fn sniffs_png_magic() {
        let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        png.extend_from_slice(&[0u8; 32]);
        assert_eq!(sniff_content_type(&png), "image/png");
    }

    #[test]
    fn binary_with_nul_is_octet_stream() {
        assert_eq!(sniff_content_type(&[1, 2, 0, 3]), OCTET_STREAM);
    }

    #[test]
    fn truncated_utf8_at_boundary_is_text() {
        let mut head = "é".repeat(10).into_bytes();
        head.pop();
        assert_eq!(sniff_content_type(&head), "text/plain");
    }

    #[test]
    fn file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let data = b"test content for checksum";
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();
        assert_eq!(checksum_file(&path).unwrap(), checksum_bytes(data));
    }

    #[tokio::test]
    async fn reader_checksum_matches_bytes() {
        let data = vec![42u8; 3 * READ_BUF + 17];
        let mut cursor = std::io::Cursor::new(data.clone());
        let c = checksum_reader(&mut cursor).await.unwrap();
        assert_eq!(c, checksum_bytes(&data));
    }
}
