//! Capture of HTTP bodies as they stream through the proxy

mod hooks;
mod session;
mod stream;

pub use hooks::{Recorder, TappedBody};
pub use session::{Exchange, RequestSnapshot, ResponseSnapshot, SessionId, SessionTable};
pub use stream::{CaptureBuffer, CaptureStream, CloseSignal, OnClose};
