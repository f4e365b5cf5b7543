//! Close-time processing of captured exchanges
//!
//! Once a response body has been closed, the processor turns the exchange
//! into a log record and, depending on the policy, body files in the capture
//! directory.

mod body;
mod media;
mod naming;
mod policy;
mod processor;
mod range;

pub use body::{FORM_URLENCODED, decode_content, decode_form};
pub use media::{MediaType, header_params};
pub use naming::{
    FALLBACK_EXTENSION, ResponseName, UNKNOWN_BASENAME, disposition_filename, request_file_name,
    split_extension, url_filename,
};
pub use policy::CapturePolicy;
pub use processor::CloseProcessor;
pub use range::ContentRange;

use http::StatusCode;

/// Local time in RFC 3339, second precision
pub(crate) fn timestamp() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}

/// `200 OK` style status text
pub(crate) fn status_text(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_u16()),
        None => status.as_u16().to_string(),
    }
}
