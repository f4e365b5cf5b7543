//! Save/skip filters and inline policy for captured bodies

use regex::Regex;
use std::collections::HashSet;

use crate::config::{CaptureConfig, FilterConfig, InlineMode};
use crate::error::{CaptureError, Result};

/// Compiled content policy
///
/// Each allow/deny pair combines the same way: with neither list everything is
/// saved, with only a deny list everything but the matches, with only an allow
/// list only the matches, and with both lists the matches of the allow list
/// that the deny list does not match.
#[derive(Debug, Clone, Default)]
pub struct CapturePolicy {
    save_content_types: HashSet<String>,
    skip_content_types: HashSet<String>,
    save_if_match: Vec<Regex>,
    skip_if_match: Vec<Regex>,
    pub inline: InlineMode,
    pub raw_form: bool,
    pub filename_max_len: usize,
}

impl CapturePolicy {
    pub fn from_config(capture: &CaptureConfig, filter: &FilterConfig) -> Result<Self> {
        Ok(Self {
            save_content_types: content_type_set(&filter.save_content_types),
            skip_content_types: content_type_set(&filter.skip_content_types),
            save_if_match: compile_all(&filter.save_if_match)?,
            skip_if_match: compile_all(&filter.skip_if_match)?,
            inline: capture.inline,
            raw_form: capture.raw_form,
            filename_max_len: capture.filename_max_len,
        })
    }

    /// Whether a body with this media type essence may be saved
    ///
    /// An empty string stands for a body without `Content-Type`.
    pub fn content_type_saveable(&self, essence: &str) -> bool {
        let essence = essence.to_ascii_lowercase();
        combine(
            !self.save_content_types.is_empty(),
            self.save_content_types.contains(&essence),
            !self.skip_content_types.is_empty(),
            self.skip_content_types.contains(&essence),
        )
    }

    /// Whether a body saved under `filename` may be saved
    pub fn filename_saveable(&self, filename: &str) -> bool {
        let matches = |patterns: &[Regex]| patterns.iter().any(|re| re.is_match(filename));
        combine(
            !self.save_if_match.is_empty(),
            matches(&self.save_if_match),
            !self.skip_if_match.is_empty(),
            matches(&self.skip_if_match),
        )
    }

    pub fn should_save(&self, essence: &str, filename: &str) -> bool {
        self.content_type_saveable(essence) && self.filename_saveable(filename)
    }
}

fn combine(has_allow: bool, allowed: bool, has_deny: bool, denied: bool) -> bool {
    match (has_allow, has_deny) {
        (false, false) => true,
        (true, false) => allowed,
        (false, true) => !denied,
        (true, true) => allowed && !denied,
    }
}

fn content_type_set(types: &[String]) -> HashSet<String> {
    types
        .iter()
        .map(|ty| ty.trim().to_ascii_lowercase())
        .filter(|ty| !ty.is_empty())
        .collect()
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .map_err(|e| CaptureError::Config(format!("Invalid filename pattern {pattern:?}: {e}")))
        })
        .collect()
}
