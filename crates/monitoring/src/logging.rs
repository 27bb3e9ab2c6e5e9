//! Logging configuration and initialization
//!
//! - Console logging or daily rotating log files
//! - Filter from `RUST_LOG`, `info` if unset or invalid
//! - Destination, directory and file prefix from environment variables

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_FILE_PREFIX: &str = "odata-cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDestination {
    Console,
    File,
}

/// Where log output goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub destination: LogDestination,
    pub log_dir: PathBuf,
    pub file_prefix: String,
}

impl LogSettings {
    /// Reads settings from the environment.
    ///
    /// - `LOG_DESTINATION`: "console" or "file" (default: "file"; unknown values mean file)
    /// - `LOG_DIR`: directory for log files (default: "./logs")
    /// - `LOG_FILE_PREFIX`: prefix of log file names (default: "odata-cache")
    pub fn from_env() -> Self {
        let destination = match env::var("LOG_DESTINATION") {
            Ok(value) if value.eq_ignore_ascii_case("console") => LogDestination::Console,
            _ => LogDestination::File,
        };
        Self {
            destination,
            log_dir: env::var("LOG_DIR")
                .unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string())
                .into(),
            file_prefix: env::var("LOG_FILE_PREFIX").unwrap_or_else(|_| DEFAULT_FILE_PREFIX.to_string()),
        }
    }

    /// Creates the log directory for file output
    fn prepare(&self) -> Result<()> {
        if self.destination == LogDestination::File {
            std::fs::create_dir_all(&self.log_dir)
                .with_context(|| format!("Failed to create log directory '{}'", self.log_dir.display()))?;
        }
        Ok(())
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initializes the global tracing subscriber from [`LogSettings::from_env`]
pub async fn init_logging() -> Result<()> {
    init_logging_with(&LogSettings::from_env())
}

pub fn init_logging_with(settings: &LogSettings) -> Result<()> {
    settings.prepare()?;
    match settings.destination {
        LogDestination::Console => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stdout)
                        .with_ansi(true)
                        .with_target(false),
                )
                .try_init()
                .context("Failed to initialize console tracing subscriber")?;
            info!("📺 Logging to console (stdout)");
        }
        LogDestination::File => {
            let appender = rolling::daily(&settings.log_dir, &settings.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(false),
                )
                .try_init()
                .context("Failed to initialize file tracing subscriber")?;
            info!("📝 Logging to daily rotating files in: {}/", settings.log_dir.display());
            info!(
                "📂 Log file pattern: {}/{}.<YYYY-MM-DD>",
                settings.log_dir.display(),
                settings.file_prefix
            );
            // The writer thread lives as long as the guard; keep it for the process lifetime
            std::mem::forget(guard);
        }
    }
    Ok(())
}

/// Subscriber for tests: output is captured per test, `RUST_LOG` applies.
/// Safe to call from every test; only the first call installs it.
pub fn init_test_logging() {
    let result = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_test_writer().with_target(true))
        .try_init();
    if result.is_err() {
        warn!("Tracing subscriber already installed");
    }
}
