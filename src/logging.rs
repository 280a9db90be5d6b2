//! Tracing subscriber setup for hosts that embed the manager.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

/// Log file name prefix inside `LoggingConfig::directory`.
const LOG_FILE_PREFIX: &str = "session-sandbox.log";

/// Installs a global subscriber according to `config`.
///
/// `RUST_LOG` wins over the verbosity flag when set. The returned guard must
/// be kept alive for file output to be flushed. Calling this when a global
/// subscriber already exists is not an error; the existing one stays.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.verbose));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.json {
        layers.push(fmt::layer().json().with_writer(std::io::stderr).boxed());
    } else {
        layers.push(fmt::layer().with_writer(std::io::stderr).boxed());
    }

    let mut guard = None;
    if let Some(ref directory) = config.directory {
        std::fs::create_dir_all(directory).with_context(|| {
            format!("Failed to create log directory: {}", directory.display())
        })?;
        let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
    }

    if tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already installed");
    }

    Ok(guard)
}

fn default_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("session_sandbox=debug")
    } else {
        EnvFilter::new("session_sandbox=info")
    }
}
