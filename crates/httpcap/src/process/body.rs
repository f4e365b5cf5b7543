//! Body decoding applied before a captured body is logged or saved

use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use http::{HeaderMap, header};
use std::io::Read;

use crate::error::{CaptureError, Result};

/// Media type of HTML form submissions
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Undo a gzip `Content-Encoding`; other encodings are left alone
pub fn decode_content(headers: &HeaderMap, body: Bytes) -> Result<Bytes> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let value = value.trim();
            value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip")
        })
        .unwrap_or(false);
    if !gzipped {
        return Ok(body);
    }

    let mut decoded = Vec::with_capacity(body.len() * 2);
    MultiGzDecoder::new(&body[..])
        .read_to_end(&mut decoded)
        .map_err(|e| CaptureError::Decompress(format!("gzip: {e}")))?;
    Ok(Bytes::from(decoded))
}

/// Render a form body as `key=value` lines, keeping field order
///
/// `None` when the body is not UTF-8, in which case it is kept as is.
pub fn decode_form(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    let mut lines = String::with_capacity(text.len());
    for (key, value) in url::form_urlencoded::parse(text.trim_end().as_bytes()) {
        lines.push_str(&key);
        lines.push('=');
        lines.push_str(&value);
        lines.push('\n');
    }
    Some(lines)
}
