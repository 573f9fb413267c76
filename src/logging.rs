//! Tracing subscriber setup shared by the binaries
//!
//! Logs go to stderr and, when configured, to a plain log file. Rotation of
//! that file is left to the host (logrotate and friends).

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;
use crate::error::{RelayError, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. The returned guard flushes the
/// file writer on drop and must be kept alive by the caller.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let mut guard = None;
    let file_layer = match &config.file {
        Some(path) => {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => std::path::PathBuf::from("."),
            };
            let name = path
                .file_name()
                .ok_or_else(|| RelayError::Config(format!("invalid log file {}", path.display())))?;
            std::fs::create_dir_all(&dir)?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| RelayError::Config(format!("logging already initialised: {}", e)))?;

    Ok(guard)
}
