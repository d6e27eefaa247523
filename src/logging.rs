//! Logging setup: human-readable stderr output plus a persistent error
//! log.
//!
//! The stderr layer honors the configured level (or `RUST_LOG`); the file
//! layer captures warnings and errors in append mode, so failures
//! accumulate across runs and can be diagnosed after the fact. Dry runs
//! skip the file layer.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber. Returns the file writer's guard, which
/// must stay alive for the duration of the process.
pub fn init(level: &str, error_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stderr_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    match error_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .context("logging.error_file has no file name")?;
            let appender = tracing_appender::rolling::never(
                dir.unwrap_or_else(|| Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(LevelFilter::WARN);

            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .context("Failed to install logging subscriber")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .try_init()
                .context("Failed to install logging subscriber")?;
            Ok(None)
        }
    }
}
