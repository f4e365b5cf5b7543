//! httpcap - capture HTTP traffic flowing through a proxy
//!
//! This crate records request and response bodies while they stream through
//! a proxy, correlates each request with its response and, once the response
//! has been closed, writes the exchange to a capture log and body files.

pub mod capture;
pub mod config;
pub mod error;
mod inflight;
pub mod logwriter;
pub mod process;
pub mod proxy;
pub mod testing;

pub use error::{CaptureError, Result};
