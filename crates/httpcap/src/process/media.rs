//! Media type classification
//!
//! Decides whether a body is text and which file extension it gets.

use std::collections::BTreeMap;

use crate::error::{CaptureError, Result};

/// Top-level types whose bodies are text
const TEXT_TOP_LEVEL: &[&str] = &["text", "xml"];

/// Full media types outside the text top-levels that are still text
const TEXT_MEDIA_TYPES: &[&str] = &["application/json", "application/javascript"];

/// Extensions that take precedence over the registry
const EXTENSION_OVERRIDES: &[(&str, &str)] = &[
    ("text/plain", ".txt"),
    ("text/html", ".html"),
    ("image/jpeg", ".jpg"),
];

/// A parsed and classified `Content-Type` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    /// Lowercased `type/subtype`
    pub essence: String,
    /// Parameters keyed by lowercased name, values unquoted
    pub params: BTreeMap<String, String>,
    /// Extension with its leading dot, empty when unknown
    pub extension: String,
    pub is_text: bool,
}

impl MediaType {
    pub fn parse(value: &str) -> Result<Self> {
        let mime: mime::Mime = value
            .trim()
            .parse()
            .map_err(|e| CaptureError::MediaType(format!("{value:?}: {e}")))?;

        let essence = mime.essence_str().to_ascii_lowercase();
        let params = mime
            .params()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.as_str().trim_matches('"').to_string(),
                )
            })
            .collect();

        let top_level = essence.split('/').next().unwrap_or_default();
        let is_text =
            TEXT_TOP_LEVEL.contains(&top_level) || TEXT_MEDIA_TYPES.contains(&essence.as_str());

        Ok(Self {
            extension: extension_for(&essence),
            essence,
            params,
            is_text,
        })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn extension_for(essence: &str) -> String {
    if let Some((_, ext)) = EXTENSION_OVERRIDES.iter().find(|(ty, _)| *ty == essence) {
        return (*ext).to_string();
    }
    mime_guess::get_mime_extensions_str(essence)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

/// Parameters of a header value shaped like `token; name=value; name="value"`
///
/// `Content-Disposition` has no `type/subtype` head and its filenames may hold
/// characters `mime` rejects, so it is split here. Names are lowercased; the
/// first occurrence of a name wins.
pub fn header_params(value: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let Some((_, mut rest)) = value.split_once(';') else {
        return params;
    };

    while let Some((name, after)) = rest.split_once('=') {
        let name = name.trim().to_ascii_lowercase();
        let after = after.trim_start();

        let (value, tail) = match after.strip_prefix('"') {
            Some(quoted) => unquote(quoted),
            None => {
                let end = after.find(';').unwrap_or(after.len());
                (after[..end].trim().to_string(), &after[end..])
            }
        };

        if !name.is_empty() {
            params.entry(name).or_insert(value);
        }
        match tail.split_once(';') {
            Some((_, next)) => rest = next,
            None => break,
        }
    }
    params
}

/// Read a quoted string up to its closing quote, undoing `\` escapes
fn unquote(quoted: &str) -> (String, &str) {
    let mut value = String::new();
    let mut chars = quoted.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => value.extend(chars.next().map(|(_, escaped)| escaped)),
            '"' => return (value, &quoted[idx + 1..]),
            c => value.push(c),
        }
    }
    (value, "")
}
