use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::{ChecksumComputer, Checksums};

/// Shared handle to the checksums accumulated by a [`HashingReader`].
///
/// The reader is usually moved into a provider's `store`, so the handle is
/// how the caller gets the digests back once the copy has finished.
#[derive(Clone)]
pub struct ChecksumHandle {
    state: Arc<Mutex<ChecksumComputer>>,
}

impl ChecksumHandle {
    /// Returns the checksums of every byte read so far.
    pub fn snapshot(&self) -> Checksums {
        let computer = self.state.lock().unwrap_or_else(|e| e.into_inner());
        computer.clone().finish()
    }

    /// Bytes read so far.
    pub fn size(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).size()
    }
}

/// Pass-through reader that hashes bytes as they flow to the consumer.
pub struct HashingReader<R> {
    inner: R,
    state: Arc<Mutex<ChecksumComputer>>,
}

impl<R: AsyncRead + Unpin> HashingReader<R> {
    pub fn new(inner: R) -> (Self, ChecksumHandle) {
        let state = Arc::new(Mutex::new(ChecksumComputer::new()));
        let handle = ChecksumHandle {
            state: Arc::clone(&state),
        };
        (Self { inner, state }, handle)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                if !fresh.is_empty() {
                    this.state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .update(fresh);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
