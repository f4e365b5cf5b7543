//! Errors returned to proxy clients
//!
//! A failed forward never takes the proxy down. The client gets a JSON
//! `502 Bad Gateway` naming what went wrong and the exchange is dropped from
//! the capture.

use axum::{
    Json,
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use thiserror::Error;

/// Errors that can occur while forwarding a request
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// The client request cannot be forwarded as is
    #[error("Request error: {0}")]
    Request(String),

    /// Network-level error (connection, timeout, etc.)
    #[error("Network error: {0}")]
    Network(String),
}

impl ProxyError {
    /// Short name used in logs and error bodies
    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::Request(_) => "request",
            ProxyError::Network(_) => "network",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        tracing::warn!("Proxy {} error: {self}", self.category());
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "proxy_error",
                "category": self.category(),
            }
        });
        (StatusCode::BAD_GATEWAY, Json(body)).into_response()
    }
}
