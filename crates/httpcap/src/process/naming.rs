//! Deterministic file names for captured bodies

use http::{HeaderMap, Uri, header};

use super::media::{MediaType, header_params};
use crate::capture::SessionId;

/// Extension used when nothing better is known
pub const FALLBACK_EXTENSION: &str = ".bin";

/// Base name used when neither the headers nor the URL name the resource
pub const UNKNOWN_BASENAME: &str = "unknown";

/// Split `name` into base and extension at the last dot
///
/// The extension keeps its dot and is empty when there is none.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) => name.split_at(idx),
        None => (name, ""),
    }
}

/// `filename` parameter of the first `Content-Disposition` header
///
/// Directory components are stripped so the name stays inside the capture
/// directory.
pub fn disposition_filename(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_DISPOSITION)?.to_str().ok()?;
    let filename = header_params(value).remove("filename")?;
    let filename = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    match filename {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

/// Last segment of the request path, still percent-encoded
pub fn url_filename(uri: &Uri) -> Option<String> {
    let segment = uri.path().rsplit('/').next().unwrap_or_default();
    match segment {
        "" | "." | ".." => None,
        segment => Some(segment.to_string()),
    }
}

/// `{id:06}_a_{METHOD}{ext}`
pub fn request_file_name(session_id: SessionId, method: &str, media: Option<&MediaType>) -> String {
    let ext = media
        .map(|media| media.extension.as_str())
        .filter(|ext| !ext.is_empty())
        .unwrap_or(FALLBACK_EXTENSION);
    format!("{session_id:06}_a_{method}{ext}")
}

/// Inputs for naming a saved response body
#[derive(Debug, Clone, Copy)]
pub struct ResponseName<'a> {
    pub session_id: SessionId,
    /// Name from `Content-Disposition` or the URL, if any
    pub filename: Option<&'a str>,
    /// Classified `Content-Type`, if any
    pub media: Option<&'a MediaType>,
    /// Partial-content marker inserted before the extension
    pub marker: Option<&'a str>,
    /// Length limit for `{id}_b_{base}`
    pub max_len: usize,
}

impl ResponseName<'_> {
    /// `{id:06}_b_{base}[{marker}]{ext}`
    ///
    /// `{id:06}_b_{base}` is cut to `max_len` bytes on a character boundary; the
    /// marker and extension always survive.
    pub fn build(&self) -> String {
        let (filename, unknown) = match self.filename {
            Some(name) if !name.is_empty() => (name, false),
            _ => (UNKNOWN_BASENAME, true),
        };

        let (base, ext) = split_extension(filename);
        let ext = if !ext.is_empty() {
            ext
        } else {
            self.media
                .map(|media| media.extension.as_str())
                .filter(|ext| !ext.is_empty())
                .unwrap_or(FALLBACK_EXTENSION)
        };
        let base = if unknown && ext == ".html" { "index" } else { base };

        let mut name = format!("{:06}_b_{base}", self.session_id);
        truncate_at_char_boundary(&mut name, self.max_len);
        if let Some(marker) = self.marker {
            name.push_str(marker);
        }
        name.push_str(ext);
        name
    }
}

fn truncate_at_char_boundary(name: &mut String, max_len: usize) {
    if name.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    name.truncate(cut);
}
