//! Logging initialisation for vfiovm.
//!
//! Every invocation writes structured logs to two places: stderr (filtered
//! by `RUST_LOG`, default `info`) and the append-only operational log file
//! under the configured log directory. The stderr stream is the system-log
//! path: run as a systemd unit or timer, it is captured by journald, so no
//! separate syslog writer is needed. The file is never rotated or truncated
//! by this component; external aggregators may tail it.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Operational log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "vfiovm.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process. If the log directory cannot be created
/// (e.g. read-only filesystem), falls back to stderr-only logging rather
/// than refusing to run.
pub fn init(log_dir: &Path) -> LogGuard {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(file_layer)
                .init();

            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();

            tracing::warn!(
                dir = %log_dir.display(),
                error = %e,
                "cannot create log directory, operational log disabled for this run"
            );
            None
        }
    };

    LogGuard { _file_guard: file_guard }
}
