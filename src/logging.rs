//! Structured logging setup.
//!
//! The running bridge logs human-readable output to stderr and, when a log
//! directory is configured, JSON lines to a daily-rotated file. One-shot
//! subcommands (`check-config`) log to stderr only.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive; dropping it flushes and closes
/// the log file.
pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise logging for the running bridge.
///
/// With `logs_dir` set, a JSON file layer (`bridge.log.YYYY-MM-DD`, daily
/// rotation) runs alongside the stderr layer. `RUST_LOG` controls filtering
/// (default `info`).
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init(logs_dir: Option<&Path>) -> anyhow::Result<LoggingGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(logs_dir) = logs_dir else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(stderr_layer)
            .init();
        return Ok(LoggingGuard { _guard: None });
    };

    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!("failed to create logs directory {}: {e}", logs_dir.display())
    })?;
    let file_appender = tracing_appender::rolling::daily(logs_dir, "bridge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer().json().with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Ok(LoggingGuard {
        _guard: Some(guard),
    })
}
