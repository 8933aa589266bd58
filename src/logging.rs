use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing with a compact stdout layer.
///
/// Default level: INFO for everything, DEBUG for this crate; override via
/// RUST_LOG. Used for interactive (subcommand) invocations.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kinvault=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).compact())
        .init();
}

/// Initialize tracing for headless scheduled runs: compact stdout plus a
/// daily-rolling file under `<data_dir>/logs/`, so unattended runs leave a
/// trail even when nothing captures the console.
///
/// The returned guard must be held for the life of the process; dropping it
/// flushes and stops the background writer.
pub fn init_scheduled(data_dir: &Path) -> std::io::Result<WorkerGuard> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "kinvault.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kinvault=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).compact())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    tracing::debug!(dir = %log_dir.display(), "File logging enabled");
    Ok(guard)
}
