//! HTTP forward proxy server
//!
//! Accepts absolute-form requests (`GET http://host/path HTTP/1.1`), forwards
//! them upstream and streams the response back, with the capture hooks wrapped
//! around both bodies:
//! - every proxied request gets a fresh session id
//! - hop-by-hop headers are stripped in both directions
//! - `CONNECT` is refused, TLS interception is not supported
//! - origin-form requests only reach `/health`

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use url::Url;

use super::ProxyError;
use crate::capture::{CaptureStream, Recorder, SessionId};
use crate::config::ProxyConfig;
use crate::error::{CaptureError, Result};

/// Hop-by-hop headers that should not be forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// Shared application state for all handlers
pub struct AppState {
    /// Capture hooks
    pub recorder: Arc<Recorder>,
    /// HTTP client for upstream requests
    pub client: reqwest::Client,
    next_session: AtomicU64,
}

impl AppState {
    pub fn new(recorder: Arc<Recorder>, client: reqwest::Client) -> Self {
        Self {
            recorder,
            client,
            next_session: AtomicU64::new(1),
        }
    }

    fn next_session_id(&self) -> SessionId {
        SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed))
    }
}

/// The proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    recorder: Arc<Recorder>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, recorder: Arc<Recorder>) -> Self {
        Self { config, recorder }
    }

    /// Upstream client; never decompresses, so captured bodies stay as sent
    pub fn build_client(config: &ProxyConfig) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CaptureError::Proxy(format!("Failed to create HTTP client: {e}")))
    }

    /// Listen until `shutdown` completes
    pub async fn serve<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let client = Self::build_client(&self.config)?;
        let app = create_router(Arc::new(AppState::new(Arc::clone(&self.recorder), client)));

        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| CaptureError::Config(format!("Invalid listen address: {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CaptureError::Proxy(format!("Failed to bind to {addr}: {e}")))?;
        tracing::info!("Capturing proxy listening on {addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| CaptureError::Proxy(format!("Server error: {e}")))?;

        tracing::info!("Proxy server shut down gracefully");
        Ok(())
    }
}

/// Create the router; every request goes through the proxy handler
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response<Body> {
    if request.method() == Method::CONNECT {
        return create_error_response(
            StatusCode::NOT_IMPLEMENTED,
            "connect_not_supported",
            "CONNECT tunnels are not supported, use plain HTTP",
        );
    }

    if request.uri().scheme().is_none() {
        if request.uri().path() == "/health" {
            return Json(serde_json::json!({
                "status": "ok",
                "sessions": state.recorder.sessions().len(),
                "pending": state.recorder.in_flight(),
            }))
            .into_response();
        }
        return create_error_response(
            StatusCode::BAD_REQUEST,
            "not_a_proxy_request",
            "Expected an absolute-form request URI",
        );
    }

    let target_url = match Url::parse(&request.uri().to_string()) {
        Ok(url) => url,
        Err(e) => {
            return create_error_response(
                StatusCode::BAD_REQUEST,
                "invalid_url",
                &format!("Invalid request URI: {e}"),
            );
        }
    };
    let host = request
        .uri()
        .authority()
        .map(|authority| authority.to_string())
        .unwrap_or_default();

    let session_id = state.next_session_id();
    let request = request.map(|body| -> BodyStream { body.into_data_stream().map_err(io::Error::other).boxed() });
    let request = state.recorder.on_request(request, session_id, &host);

    tracing::debug!("[{session_id}] Proxying {} {target_url}", request.method());

    match forward_request(&state.client, &target_url, request).await {
        Ok(response) => state
            .recorder
            .on_response(response, session_id)
            .map(Body::from_stream),
        Err(e) => {
            state.recorder.on_failure(session_id, &e);
            e.into_response()
        }
    }
}

/// Forward a captured request upstream and return the streamed response
async fn forward_request(
    client: &reqwest::Client,
    target_url: &Url,
    request: axum::http::Request<CaptureStream<BodyStream>>,
) -> std::result::Result<axum::http::Response<BodyStream>, ProxyError> {
    let (parts, body) = request.into_parts();

    let mut headers = strip_hop_by_hop(&parts.headers);
    if let Some(host) = target_url.host_str() {
        let host_value = match target_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&host_value) {
            headers.insert(header::HOST, value);
        }
    }

    let response = client
        .request(parts.method, target_url.clone())
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProxyError::Network(format!("Request timed out: {e}"))
            } else if e.is_connect() {
                ProxyError::Network(format!("Failed to connect to upstream: {e}"))
            } else {
                ProxyError::Network(format!("Request failed: {e}"))
            }
        })?;

    let mut builder = axum::http::Response::builder().status(response.status());
    for (name, value) in strip_hop_by_hop(response.headers()).iter() {
        builder = builder.header(name, value);
    }

    let body: BodyStream = response.bytes_stream().map_err(io::Error::other).boxed();
    builder
        .body(body)
        .map_err(|e| ProxyError::Request(format!("Failed to build response: {e}")))
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}

/// Create a JSON error response
fn create_error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.append(header::ACCEPT, HeaderValue::from_static("text/html"));
        headers.append(header::ACCEPT, HeaderValue::from_static("*/*"));

        let forwarded = strip_hop_by_hop(&headers);
        assert!(forwarded.get(header::CONNECTION).is_none());
        assert!(forwarded.get("proxy-connection").is_none());
        assert!(forwarded.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(forwarded.get_all(header::ACCEPT).iter().count(), 2);
    }
}
