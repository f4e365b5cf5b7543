//! `Content-Range` parsing and partial-content markers

use crate::error::{CaptureError, Result};

/// Byte range declared by a `Content-Range` header
///
/// Positions are zero based with an inclusive `end`. A `total` of zero means
/// the complete length is unknown (`*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ContentRange {
    /// Parse `bytes <start>-<end>/<total|*>` or `bytes */<total|*>`
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (unit, rest) = value
            .split_once(' ')
            .ok_or_else(|| CaptureError::ContentRange(format!("missing unit: {value:?}")))?;
        if unit != "bytes" {
            return Err(CaptureError::ContentRange(format!("unknown unit: {unit}")));
        }

        let (range, total) = rest
            .trim_start()
            .split_once('/')
            .ok_or_else(|| CaptureError::ContentRange(format!("missing total: {value:?}")))?;

        let (start, end) = if range == "*" {
            (0, 0)
        } else {
            let (start, end) = range
                .split_once('-')
                .ok_or_else(|| CaptureError::ContentRange(format!("bad range: {range:?}")))?;
            let start = if start.is_empty() { 0 } else { parse_position(start)? };
            let end = if end.is_empty() { start } else { parse_position(end)? };
            (start, end)
        };

        let total = if total == "*" { 0 } else { parse_position(total)? };

        Ok(Self { start, end, total })
    }

    /// File name marker for a 206 body of `captured` bytes starting at `start`
    ///
    /// `None` when nothing was captured or the capture covers the complete
    /// resource.
    pub fn partial_marker(&self, captured: u64) -> Option<String> {
        let actual_end = self.start.saturating_add(captured);
        if actual_end == 0 {
            return None;
        }
        if self.total > 0 && self.start == 0 && actual_end == self.total {
            return None;
        }

        let mut marker = format!("[partial_{}-{}", self.start, actual_end - 1);
        if self.total > 0 {
            marker.push_str(&format!("({})", self.total));
        }
        marker.push(']');
        Some(marker)
    }
}

fn parse_position(digits: &str) -> Result<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CaptureError::ContentRange(format!("bad position: {digits:?}")));
    }
    digits
        .parse()
        .map_err(|e| CaptureError::ContentRange(format!("bad position {digits:?}: {e}")))
}
