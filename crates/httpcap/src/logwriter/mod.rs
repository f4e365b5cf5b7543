//! Asynchronous capture log writer
//!
//! Log records are queued on a bounded channel and written by a single
//! background task, so records never interleave on the sink and callers never
//! wait on disk I/O:
//! - `LogSender::flush` enqueues a finished record without blocking
//! - the drain task writes records to the sink in queue order, optionally
//!   echoing them to a second (console) sink
//! - a failed sink write is reported once on the error channel and stops all
//!   further writes
//! - `LogWriter::shutdown` waits for records deferred by a full queue, closes
//!   the queue and waits until every queued record has been written

use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{CaptureError, ErrorSender, Result};
use crate::inflight::{InFlight, InFlightGuard};

/// Type-erased log destination
pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Where log records are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    /// Standard output
    Stdout,
    /// A file, truncated when opened
    File(PathBuf),
}

impl LogSink {
    /// `None` selects standard output
    pub fn from_path(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => LogSink::File(path),
            None => LogSink::Stdout,
        }
    }

    /// Open the destination for writing
    pub async fn open(&self) -> Result<BoxedSink> {
        match self {
            LogSink::Stdout => Ok(Box::new(tokio::io::stdout())),
            LogSink::File(path) => {
                let file = tokio::fs::File::create(path).await.map_err(|e| {
                    CaptureError::LogSink(format!(
                        "Failed to open log file {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Box::new(file))
            }
        }
    }
}

/// Text of one log entry, written to the sink as a single unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecord {
    text: String,
}

impl LogRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line; the newline is added here
    pub fn line(&mut self, args: fmt::Arguments<'_>) {
        use fmt::Write;
        // Writing into a String cannot fail
        let _ = self.text.write_fmt(args);
        self.text.push('\n');
    }

    /// Append an empty line
    pub fn blank(&mut self) {
        self.text.push('\n');
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn into_bytes(self) -> Bytes {
        Bytes::from(self.text)
    }
}

/// Cloneable handle for submitting records to the writer task
#[derive(Debug, Clone)]
pub struct LogSender {
    tx: mpsc::Sender<Bytes>,
    deferred: Arc<InFlight>,
}

impl LogSender {
    /// Queue a record for writing without waiting
    ///
    /// When the queue is full the record is handed to a background task that
    /// waits for room, so records submitted under back-pressure may be written
    /// out of submission order. Must be called from within a tokio runtime.
    pub fn flush(&self, record: LogRecord) {
        if record.is_empty() {
            return;
        }

        match self.tx.try_send(record.into_bytes()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(bytes)) => {
                let tx = self.tx.clone();
                let guard = InFlightGuard::enter(&self.deferred);
                tokio::spawn(async move {
                    let _guard = guard;
                    if tx.send(bytes).await.is_err() {
                        tracing::debug!("Log queue closed while waiting, record dropped");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Log queue closed, record dropped");
            }
        }
    }
}

/// Owner of the background writer task
pub struct LogWriter {
    handle: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
    deferred: Arc<InFlight>,
}

impl LogWriter {
    /// Start the writer task
    ///
    /// `tee` receives a copy of every record written to `sink`. Dropping the
    /// returned `LogWriter` closes the queue just like `shutdown`, without
    /// waiting for the drain.
    pub fn spawn(
        sink: BoxedSink,
        tee: Option<BoxedSink>,
        capacity: usize,
        errors: ErrorSender,
    ) -> (LogWriter, LogSender) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let deferred = Arc::new(InFlight::default());

        let handle = tokio::spawn(drain(rx, sink, tee, errors, shutdown_rx));

        (
            LogWriter {
                handle,
                shutdown: Some(shutdown_tx),
                deferred: Arc::clone(&deferred),
            },
            LogSender { tx, deferred },
        )
    }

    /// Close the queue and wait until every queued record has been written
    ///
    /// Records already handed to [`LogSender::flush`] are written, including
    /// those still waiting for room in a full queue.
    pub async fn shutdown(mut self) {
        self.deferred.wait_idle().await;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = self.handle.await {
            tracing::warn!("Log writer task failed: {e}");
        }
    }
}

async fn drain(
    mut rx: mpsc::Receiver<Bytes>,
    mut sink: BoxedSink,
    mut tee: Option<BoxedSink>,
    errors: ErrorSender,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut closing = false;
    let mut failed = false;
    let mut written = 0usize;
    let mut dropped = 0usize;

    loop {
        let record = tokio::select! {
            record = rx.recv() => record,
            _ = &mut shutdown, if !closing => {
                // Stop accepting records but keep draining what is queued
                closing = true;
                rx.close();
                continue;
            }
        };
        let Some(record) = record else {
            break;
        };

        if failed {
            dropped += 1;
            continue;
        }

        if let Err(e) = write_record(&mut sink, &record).await {
            tracing::error!("Log sink write failed, further records are dropped: {e}");
            failed = true;
            dropped += 1;
            errors.deliver(CaptureError::LogSink(e.to_string())).await;
            continue;
        }
        written += 1;

        if let Some(console) = tee.as_mut() {
            if let Err(e) = write_record(console, &record).await {
                tracing::warn!("Log tee write failed, disabling tee: {e}");
                tee = None;
            }
        }
    }

    tracing::debug!("Log writer stopped ({written} records written, {dropped} dropped)");
}

async fn write_record(sink: &mut BoxedSink, record: &[u8]) -> std::io::Result<()> {
    sink.write_all(record).await?;
    sink.flush().await
}
