//! Test utilities for httpcap - scripted bodies and in-memory sinks
//!
//! Shared by the unit tests and the integration tests under `tests/`:
//! - Body streams that deliver fixed chunks, optionally ending in an error
//! - Pre-filled capture buffers
//! - Log sinks that record into memory or fail every write

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

use crate::capture::{CaptureBuffer, CaptureStream};

/// A body that yields each chunk in order and then ends
pub fn chunked_body(chunks: &[&[u8]]) -> BoxStream<'static, io::Result<Bytes>> {
    let chunks: Vec<io::Result<Bytes>> = chunks
        .iter()
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    stream::iter(chunks).boxed()
}

/// A body that yields each chunk in order and then fails with `kind`
pub fn failing_body(chunks: &[&[u8]], kind: io::ErrorKind) -> BoxStream<'static, io::Result<Bytes>> {
    let mut items: Vec<io::Result<Bytes>> = chunks
        .iter()
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    items.push(Err(io::Error::new(kind, "scripted body failure")));
    stream::iter(items).boxed()
}

/// A buffer holding `body`, captured the way the proxy captures bodies
pub async fn captured_buffer(body: &[u8]) -> CaptureBuffer {
    let mut stream = CaptureStream::new(chunked_body(&[body]));
    while stream.next().await.is_some() {}
    stream.buffer().clone()
}

/// In-memory log sink; clones share the same bytes
#[derive(Debug, Clone, Default)]
pub struct SharedSink {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl AsyncWrite for SharedSink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Log sink whose every write fails, like a full disk
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSink;

impl AsyncWrite for FailingSink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::other("no space left on device")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
