//! Tee capture over streamed HTTP bodies
//!
//! `CaptureStream` forwards every chunk of the wrapped body unchanged and
//! appends it to a shared `CaptureBuffer` on the same poll that hands it to the
//! consumer, so the capture never runs ahead of (or behind) what the consumer saw.
//!
//! Closing happens either through [`CaptureStream::close`] or by dropping the
//! wrapper, which is how HTTP stacks release a body. Both paths notify the
//! registered close handler exactly once.

use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Close notification handler, receives the close error if there was one
pub type OnClose = Box<dyn FnOnce(Option<&io::Error>) + Send + 'static>;

/// Append-only byte accumulator shared between a capture stream and its readers
///
/// Cloning is cheap and every clone sees the same bytes.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<BytesMut>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes captured so far
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of everything captured so far
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock())
    }

    fn append(&self, chunk: &[u8]) {
        self.lock().extend_from_slice(chunk);
    }

    fn lock(&self) -> MutexGuard<'_, BytesMut> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A body stream wrapper that records all chunks while forwarding them
pub struct CaptureStream<S> {
    inner: Option<S>,
    buffer: CaptureBuffer,
    error: Option<io::Error>,
    close_attempted: bool,
    closed: bool,
    on_close: Option<OnClose>,
}

impl<S> CaptureStream<S> {
    /// Wrap a body without any close notification
    pub fn new(inner: S) -> Self {
        Self {
            inner: Some(inner),
            buffer: CaptureBuffer::new(),
            error: None,
            close_attempted: false,
            closed: false,
            on_close: None,
        }
    }

    /// Wrap a body and call `on_close` once when it is closed
    pub fn with_on_close<F>(inner: S, on_close: F) -> Self
    where
        F: FnOnce(Option<&io::Error>) + Send + 'static,
    {
        let mut stream = Self::new(inner);
        stream.on_close = Some(Box::new(on_close));
        stream
    }

    /// Wrap a body and get a future that resolves once it is closed
    ///
    /// The future yields the close error, `None` for a clean close.
    pub fn with_close_signal(inner: S) -> (Self, CloseSignal) {
        let (tx, rx) = oneshot::channel();
        let stream = Self::with_on_close(inner, move |error| {
            let _ = tx.send(error.map(copy_error));
        });
        (stream, CloseSignal { receiver: rx })
    }

    /// Handle to the captured bytes, valid after close
    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    /// Number of bytes captured so far
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the stream was closed without error
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the wrapped body and report the outcome
    ///
    /// The close error is the first error the body produced while being read.
    /// Repeated calls are no-ops returning `Ok(())`.
    pub fn close(&mut self) -> io::Result<()> {
        if self.close_attempted {
            return Ok(());
        }
        self.close_attempted = true;
        drop(self.inner.take());

        let result = match self.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        };

        if let Some(on_close) = self.on_close.take() {
            on_close(result.as_ref().err());
        }
        self.closed = result.is_ok();
        result
    }
}

impl<S> Stream for CaptureStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    this.buffer.append(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                if this.error.is_none() {
                    this.error = Some(copy_error(&error));
                }
                Poll::Ready(Some(Err(error)))
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            Some(inner) => inner.size_hint(),
            None => (0, Some(0)),
        }
    }
}

impl<S> Drop for CaptureStream<S> {
    fn drop(&mut self) {
        if !self.close_attempted {
            let _ = self.close();
        }
    }
}

impl<S> std::fmt::Debug for CaptureStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStream")
            .field("size", &self.size())
            .field("closed", &self.closed)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Resolves once the paired `CaptureStream` has been closed
///
/// Output is the close error, `None` when the body closed cleanly.
#[derive(Debug)]
pub struct CloseSignal {
    receiver: oneshot::Receiver<Option<io::Error>>,
}

impl Future for CloseSignal {
    type Output = Option<io::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Some(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "capture stream went away without closing",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn copy_error(error: &io::Error) -> io::Error {
    io::Error::new(error.kind(), error.to_string())
}
