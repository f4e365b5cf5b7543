//! Request and response hooks called by the proxy
//!
//! The request hook records a new exchange and wraps the request body; the
//! response hook attaches the response to that exchange and wraps its body
//! with a close notification that triggers close-time processing.

use bytes::Bytes;
use futures::stream::Stream;
use http::{Request, Response};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::session::{Exchange, RequestSnapshot, ResponseSnapshot, SessionId, SessionTable};
use super::stream::CaptureStream;
use crate::inflight::{InFlight, InFlightGuard};
use crate::logwriter::{LogRecord, LogSender};
use crate::process::{CloseProcessor, status_text, timestamp};

/// Response body handed back by [`Recorder::on_response`]
#[derive(Debug)]
pub enum TappedBody<B> {
    /// Body is being captured
    Captured(CaptureStream<B>),
    /// No exchange was recorded for the session, body passes through as is
    Bypass(B),
}

impl<B> Stream for TappedBody<B>
where
    B: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            TappedBody::Captured(stream) => Pin::new(stream).poll_next(cx),
            TappedBody::Bypass(body) => Pin::new(body).poll_next(cx),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            TappedBody::Captured(stream) => stream.size_hint(),
            TappedBody::Bypass(body) => body.size_hint(),
        }
    }
}

/// Capture hooks for one proxy instance
pub struct Recorder {
    sessions: Arc<SessionTable>,
    processor: Arc<CloseProcessor>,
    log: LogSender,
    in_flight: Arc<InFlight>,
}

impl Recorder {
    /// `processor` must share `sessions`
    pub fn new(sessions: Arc<SessionTable>, processor: Arc<CloseProcessor>, log: LogSender) -> Self {
        Self {
            sessions,
            processor,
            log,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Record a new exchange and wrap the request body
    pub fn on_request<B>(
        &self,
        request: Request<B>,
        session_id: SessionId,
        host: &str,
    ) -> Request<CaptureStream<B>> {
        let (parts, body) = request.into_parts();
        let stream = CaptureStream::new(body);
        let exchange = Arc::new(Exchange::new(
            session_id,
            host,
            RequestSnapshot::from(&parts),
            stream.buffer().clone(),
        ));
        self.sessions.begin(session_id, exchange);

        let mut record = LogRecord::new();
        record.line(format_args!(
            "{} [{session_id}] start_req {} {} ({host})",
            timestamp(),
            parts.method,
            parts.uri
        ));
        self.log.flush(record);

        Request::from_parts(parts, stream)
    }

    /// Attach a response to its exchange and wrap the response body
    ///
    /// Close processing runs on its own task once the framework closes the
    /// returned body.
    pub fn on_response<B>(&self, response: Response<B>, session_id: SessionId) -> Response<TappedBody<B>> {
        let Some(exchange) = self.sessions.lookup(session_id) else {
            tracing::debug!("No exchange for session {session_id}, response not captured");
            return response.map(TappedBody::Bypass);
        };
        if exchange.response().is_some() {
            tracing::debug!("Session {session_id} already has a response, not captured");
            return response.map(TappedBody::Bypass);
        }

        let (parts, body) = response.into_parts();
        let (stream, signal) = CaptureStream::with_close_signal(body);
        if !exchange.set_response(ResponseSnapshot::from(&parts), stream.buffer().clone()) {
            return Response::from_parts(parts, TappedBody::Captured(stream));
        }

        let mut record = LogRecord::new();
        record.line(format_args!(
            "{} [{session_id}] open_resp ({}) {} {}",
            timestamp(),
            status_text(parts.status),
            exchange.request.method,
            exchange.request.uri
        ));
        self.log.flush(record);

        let processor = Arc::clone(&self.processor);
        let guard = InFlightGuard::enter(&self.in_flight);
        tokio::spawn(async move {
            let _guard = guard;
            let outcome = signal.await;
            processor.process(exchange, outcome).await;
        });

        Response::from_parts(parts, TappedBody::Captured(stream))
    }

    /// Drop the exchange of a session whose request could not be forwarded
    pub fn on_failure(&self, session_id: SessionId, error: &dyn fmt::Display) {
        if let Some(exchange) = self.sessions.lookup(session_id) {
            self.processor.abandon(&exchange, error);
        }
    }

    /// Number of responses whose close processing has not finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Wait until every pending close processing has finished
    pub async fn wait_idle(&self) {
        self.in_flight.wait_idle().await;
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("sessions", &self.sessions.len())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
