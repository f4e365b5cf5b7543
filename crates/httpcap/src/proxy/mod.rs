//! Plain-HTTP forward proxy hosting the capture hooks

mod error;
mod server;

pub use error::ProxyError;
pub use server::{AppState, ProxyServer, create_router};
