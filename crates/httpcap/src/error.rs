//! Error types for httpcap

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for capture operations
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Configuration errors (bad TOML, invalid filter regex, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A captured body could not be decompressed
    #[error("Decompression error: {0}")]
    Decompress(String),

    /// A captured body could not be written to the capture directory
    #[error("Failed to save {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed `Content-Range` header value
    #[error("Content-Range error: {0}")]
    ContentRange(String),

    /// Malformed media type
    #[error("Media type error: {0}")]
    MediaType(String),

    /// The log sink rejected a write; the log writer stops after this
    #[error("Log sink error: {0}")]
    LogSink(String),

    /// Proxy/HTTP errors
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Receiving end of the shared error channel, observed by the host process
pub type ErrorReceiver = tokio::sync::mpsc::Receiver<CaptureError>;

/// Sending end of the shared error channel
///
/// Processing and log sink failures are reported here once; nothing is retried.
#[derive(Debug, Clone)]
pub struct ErrorSender {
    tx: tokio::sync::mpsc::Sender<CaptureError>,
}

impl ErrorSender {
    /// Report an error without waiting
    ///
    /// When the channel is full or nobody listens anymore the error is only
    /// written to the tracing log.
    pub fn report(&self, error: CaptureError) {
        if let Err(e) = self.tx.try_send(error) {
            tracing::warn!("Error channel unavailable, dropping: {}", e.into_inner());
        }
    }

    /// Report an error, waiting for room on the channel
    ///
    /// For fatal errors raised off the request path; only a closed channel
    /// drops the error.
    pub async fn deliver(&self, error: CaptureError) {
        if let Err(e) = self.tx.send(error).await {
            tracing::warn!("Error channel closed, dropping: {}", e.0);
        }
    }
}

/// Create the shared error channel
pub fn error_channel(capacity: usize) -> (ErrorSender, ErrorReceiver) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
    (ErrorSender { tx }, rx)
}
