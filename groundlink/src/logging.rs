//! Optional logging bootstrap for embedders.
//!
//! The library itself only emits `tracing` events and never installs a
//! global subscriber. Hosts that do not already have one can call
//! [`init_logging`] to get a sensible default: console output filtered by
//! `RUST_LOG`, plus an optional non-blocking file writer.

use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard flushes and closes the log file writer.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initializes a global tracing subscriber.
///
/// Logs go to stdout; when `log_file` is given, they are additionally
/// appended to that file through a non-blocking writer. The filter defaults
/// to `info` and is overridable via `RUST_LOG`.
///
/// # Errors
///
/// Returns an error if the log file's directory cannot be created.
pub fn init_logging(log_file: Option<&Path>) -> Result<LoggingGuard, io::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let file_name = path.file_name().unwrap_or_else(|| "groundlink.log".as_ref());

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
