//! Session table correlating requests with their responses
//!
//! The proxy calls the request and response hooks separately, possibly from
//! different tasks. The table keys each in-flight exchange by the proxy's
//! connection session id and hands out shared `Arc<Exchange>` handles.
//!
//! Removal is identity based: an exchange is only removed by whoever holds the
//! very same `Arc`, so a late close notification for an old exchange cannot
//! remove a newer one that reused its session id.

use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode, Uri};
use std::sync::{Arc, OnceLock};

use super::stream::CaptureBuffer;

/// Proxy-assigned connection identifier
///
/// Opaque: only used as a table key and in file names, never assumed to be
/// sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Request line and headers as seen by the request hook
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl From<&http::request::Parts> for RequestSnapshot {
    fn from(parts: &http::request::Parts) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
        }
    }
}

/// Status and headers as seen by the response hook
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl From<&http::response::Parts> for ResponseSnapshot {
    fn from(parts: &http::response::Parts) -> Self {
        Self {
            status: parts.status,
            headers: parts.headers.clone(),
        }
    }
}

/// One correlated HTTP request/response pair
#[derive(Debug)]
pub struct Exchange {
    /// Session id the exchange was recorded under
    pub session_id: SessionId,
    /// Target host of the request, may be empty
    pub host: String,
    /// Request line and headers
    pub request: RequestSnapshot,
    request_capture: CaptureBuffer,
    response: OnceLock<ResponseSnapshot>,
    response_capture: OnceLock<CaptureBuffer>,
}

impl Exchange {
    pub fn new(
        session_id: SessionId,
        host: impl Into<String>,
        request: RequestSnapshot,
        request_capture: CaptureBuffer,
    ) -> Self {
        Self {
            session_id,
            host: host.into(),
            request,
            request_capture,
            response: OnceLock::new(),
            response_capture: OnceLock::new(),
        }
    }

    /// Attach the response; only the first call wins
    ///
    /// Returns `false` when a response was already attached.
    pub fn set_response(&self, response: ResponseSnapshot, capture: CaptureBuffer) -> bool {
        if self.response.set(response).is_err() {
            return false;
        }
        let _ = self.response_capture.set(capture);
        true
    }

    pub fn request_capture(&self) -> &CaptureBuffer {
        &self.request_capture
    }

    pub fn response(&self) -> Option<&ResponseSnapshot> {
        self.response.get()
    }

    pub fn response_capture(&self) -> Option<&CaptureBuffer> {
        self.response_capture.get()
    }
}

/// Concurrent map of session id to in-flight exchange
///
/// Shard locks are only held for the map operation itself.
#[derive(Debug, Default)]
pub struct SessionTable {
    exchanges: DashMap<SessionId, Arc<Exchange>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an exchange, replacing a stale entry for the same id
    ///
    /// Returns the replaced exchange, if any.
    pub fn begin(&self, session_id: SessionId, exchange: Arc<Exchange>) -> Option<Arc<Exchange>> {
        let stale = self.exchanges.insert(session_id, exchange);
        if stale.is_some() {
            tracing::debug!("Session {session_id} reused, replacing stale exchange");
        }
        stale
    }

    /// Find the exchange recorded for a session id
    pub fn lookup(&self, session_id: SessionId) -> Option<Arc<Exchange>> {
        self.exchanges
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `expected` if it is still the exchange stored under `session_id`
    ///
    /// Compares by identity. Returns `true` exactly once per stored exchange.
    pub fn remove(&self, session_id: SessionId, expected: &Arc<Exchange>) -> bool {
        self.exchanges
            .remove_if(&session_id, |_, stored| Arc::ptr_eq(stored, expected))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
