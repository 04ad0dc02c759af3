//! Tracing setup: console output plus a daily-rotated plain-text copy in
//! the data directory that `/logs` reads back.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "info,relayd=debug,relaygrid=debug";
/// Rotated files kept on disk, today's included.
const KEEP_LOG_FILES: usize = 7;

/// Install the global subscriber. Log lines still buffered are flushed
/// when the returned guard drops, so hold it until exit.
pub fn init(log_path: &Path, json: bool) -> anyhow::Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;

    let dir = log_path.parent().unwrap_or(Path::new("."));
    let prefix = log_path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid log path {}", log_path.display()))?;
    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(KEEP_LOG_FILES)
        .build(dir)
        .with_context(|| format!("failed to open log file in {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);

    let console = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}
