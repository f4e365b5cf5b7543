//! httpcap daemon - capturing HTTP forward proxy

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio::sync::oneshot;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use httpcap::capture::{Recorder, SessionTable};
use httpcap::config::{Config, InlineMode};
use httpcap::error::{ErrorReceiver, Result, error_channel};
use httpcap::logwriter::{BoxedSink, LogSink, LogWriter};
use httpcap::process::{CapturePolicy, CloseProcessor};
use httpcap::proxy::ProxyServer;
use httpcap::CaptureError;

/// How long pending captures may take to finish after the listener stops
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// httpcap - HTTP proxy that captures request and response bodies to disk
#[derive(Parser)]
#[command(name = "httpcap")]
#[command(about = "A forward HTTP proxy that captures request and response bodies to disk")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy server (default command)
    #[command(name = "serve")]
    Serve,
}

/// Command-line settings that take precedence over the config file
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Directory receiving captured bodies
    #[arg(long, short = 'd', global = true)]
    pub dir: Option<PathBuf>,

    /// Log file, relative to the capture directory; "-" for stdout
    #[arg(long, short = 'l', global = true)]
    pub log: Option<String>,

    /// Echo the capture log to stdout
    #[arg(long, global = true)]
    pub tee: bool,

    /// Remove old files from the capture directory on start
    #[arg(long, global = true)]
    pub clean: bool,

    /// Write bodies into the log instead of separate files
    #[arg(long, value_enum, global = true)]
    pub inline: Option<InlineMode>,

    /// Keep form bodies as raw query strings
    #[arg(long, global = true)]
    pub raw_form: bool,

    /// Address to listen on
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Only save bodies of these media types (comma separated)
    #[arg(long, value_delimiter = ',', global = true)]
    pub content_types: Vec<String>,

    /// Only save bodies whose file name matches this regex (repeatable)
    #[arg(long, global = true)]
    pub content_name: Vec<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(dir) = self.dir {
            config.capture.dir = dir;
        }
        if let Some(log) = self.log {
            config.capture.log_file = log;
        }
        config.capture.tee |= self.tee;
        config.capture.clean_on_start |= self.clean;
        if let Some(inline) = self.inline {
            config.capture.inline = inline;
        }
        config.capture.raw_form |= self.raw_form;
        if let Some(listen) = self.listen {
            config.proxy.listen_addr = listen;
        }
        config.filter.save_content_types.extend(self.content_types);
        config.filter.save_if_match.extend(self.content_name);
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config, cli.overrides).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,httpcap=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let path = match config_path {
        Some(path) => Some(path),
        None => {
            let default_paths = [
                dirs::home_dir().map(|h| h.join(".httpcap").join("config.toml")),
                dirs::config_dir().map(|c| c.join("httpcap").join("config.toml")),
                Some(PathBuf::from("config.toml")),
            ];
            default_paths.into_iter().flatten().find(|path| path.exists())
        }
    };

    let Some(path) = path else {
        tracing::info!("No config file found, using defaults");
        return Ok(Config::default());
    };

    tracing::info!("Loading config from: {}", path.display());
    let content = std::fs::read_to_string(&path).map_err(|e| {
        CaptureError::Config(format!("Failed to read config file {}: {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| CaptureError::Config(format!("Failed to parse config: {e}")))
}

async fn serve(config_path: Option<PathBuf>, overrides: Overrides) -> Result<()> {
    let mut config = load_config(config_path)?;
    overrides.apply(&mut config);
    tracing::debug!("Config loaded: {:?}", config);

    config.capture.prepare_dir()?;
    let policy = CapturePolicy::from_config(&config.capture, &config.filter)?;

    let (errors, error_rx) = error_channel(16);

    let sink = LogSink::from_path(config.capture.log_path());
    match &sink {
        LogSink::Stdout => tracing::info!("Writing capture log to stdout"),
        LogSink::File(path) => tracing::info!("Writing capture log to {}", path.display()),
    }
    // Echoing to stdout is pointless when the log already goes there
    let tee: Option<BoxedSink> = (config.capture.tee && sink != LogSink::Stdout)
        .then(|| Box::new(tokio::io::stdout()) as BoxedSink);
    let (log_writer, log) = LogWriter::spawn(
        sink.open().await?,
        tee,
        config.capture.queue_capacity,
        errors.clone(),
    );

    let sessions = Arc::new(SessionTable::new());
    let processor = Arc::new(CloseProcessor::new(
        Arc::clone(&sessions),
        policy,
        config.capture.dir.clone(),
        log.clone(),
        errors,
    ));
    let recorder = Arc::new(Recorder::new(sessions, processor, log));
    tracing::info!("Capturing into {}", config.capture.dir.display());

    let (fatal_tx, fatal_rx) = oneshot::channel();
    let monitor = tokio::spawn(monitor_errors(error_rx, fatal_tx));

    let proxy = ProxyServer::new(config.proxy.clone(), Arc::clone(&recorder));
    let result = proxy
        .serve(async move {
            tokio::select! {
                _ = shutdown_signal() => {},
                Ok(()) = fatal_rx => {
                    tracing::warn!("Capture log unavailable, shutting down");
                },
            }
        })
        .await;

    if tokio::time::timeout(DRAIN_TIMEOUT, recorder.wait_idle()).await.is_err() {
        tracing::warn!(
            "{} captures still pending after {}s, abandoning them",
            recorder.in_flight(),
            DRAIN_TIMEOUT.as_secs()
        );
    }
    log_writer.shutdown().await;
    monitor.abort();

    tracing::info!("httpcap stopped");
    result
}

/// Log processing failures; stop the proxy when the capture log fails
async fn monitor_errors(mut errors: ErrorReceiver, fatal: oneshot::Sender<()>) {
    while let Some(error) = errors.recv().await {
        match error {
            CaptureError::LogSink(_) => {
                tracing::error!("{error}");
                let _ = fatal.send(());
                return;
            }
            error => tracing::error!("Capture failed: {error}"),
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
