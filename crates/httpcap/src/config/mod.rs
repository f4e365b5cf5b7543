use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{CaptureError, Result};

/// Main configuration structure for httpcap
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Capture directory and log output
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Save/skip filters for captured bodies
    #[serde(default)]
    pub filter: FilterConfig,
    /// HTTP proxy listener configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// How captured bodies are written into the log itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InlineMode {
    /// Bodies always go to separate files
    #[default]
    Off,
    /// Text bodies are written into the log, binary bodies to files
    Text,
    /// Every body is written into the log
    All,
}

impl InlineMode {
    /// Whether a body with the given classification is logged inline
    pub fn inlines(self, is_text: bool) -> bool {
        match self {
            InlineMode::Off => false,
            InlineMode::Text => is_text,
            InlineMode::All => true,
        }
    }
}

/// Capture output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Directory receiving captured body files
    #[serde(default = "default_capture_dir")]
    pub dir: PathBuf,
    /// Log file name; relative names live inside `dir`, "-" means stdout
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// Echo log records to stdout as well
    #[serde(default)]
    pub tee: bool,
    /// Remove regular files from `dir` on start
    #[serde(default)]
    pub clean_on_start: bool,
    /// Inline body logging mode
    #[serde(default)]
    pub inline: InlineMode,
    /// Keep x-www-form-urlencoded bodies as raw query strings
    #[serde(default)]
    pub raw_form: bool,
    /// Maximum length of a saved response file name, extension excluded
    #[serde(default = "default_filename_max_len")]
    pub filename_max_len: usize,
    /// Number of log records that can wait for the writer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl CaptureConfig {
    /// Resolved log destination, `None` for stdout
    pub fn log_path(&self) -> Option<PathBuf> {
        if self.log_file == "-" {
            return None;
        }
        let path = PathBuf::from(&self.log_file);
        if path.is_absolute() {
            Some(path)
        } else {
            Some(self.dir.join(path))
        }
    }

    /// Create the capture directory, clearing old files when configured to
    ///
    /// Only regular files are removed; subdirectories are left alone.
    pub fn prepare_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            CaptureError::Config(format!(
                "Failed to create capture directory {}: {e}",
                self.dir.display()
            ))
        })?;

        if !self.clean_on_start {
            return Ok(());
        }

        let mut removed = 0usize;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let path = entry.path();
                std::fs::remove_file(&path)
                    .map_err(|source| CaptureError::Persist { path, source })?;
                removed += 1;
            }
        }
        tracing::info!("Removed {removed} files from {}", self.dir.display());
        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dir: default_capture_dir(),
            log_file: default_log_file(),
            tee: false,
            clean_on_start: false,
            inline: InlineMode::default(),
            raw_form: false,
            filename_max_len: default_filename_max_len(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("./captured")
}

fn default_log_file() -> String {
    "log.txt".to_string()
}

fn default_filename_max_len() -> usize {
    32
}

fn default_queue_capacity() -> usize {
    64
}

/// Save/skip filters
///
/// Every list is empty by default, which saves everything.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilterConfig {
    /// Only save bodies with one of these media types
    #[serde(default)]
    pub save_content_types: Vec<String>,
    /// Never save bodies with one of these media types
    #[serde(default)]
    pub skip_content_types: Vec<String>,
    /// Only save files whose name matches one of these regexes
    #[serde(default)]
    pub save_if_match: Vec<String>,
    /// Never save files whose name matches one of these regexes
    #[serde(default)]
    pub skip_if_match: Vec<String>,
}

/// HTTP proxy listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on (e.g., "127.0.0.1:38080")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Upstream request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:38080".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}
