//! Logging initialisation for ov-backup.
//!
//! Every run appends structured logs to a single file (default
//! `/var/log/ov-backup.log`, see `backup.log_file`). Warnings and errors are
//! mirrored to stderr so cron mail carries them, except events logged under
//! [`FILE_ONLY_TARGET`]. `RUST_LOG` overrides the default `info` filter.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing::{Level, Metadata, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Target for events that belong in the log file but not on stderr, such as
/// a failure `main` already reports there.
pub const FILE_ONLY_TARGET: &str = "ov_backup::file_only";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process. When the log file cannot be opened the
/// subscriber falls back to stderr only and says so.
pub fn init(log_file: &Path) -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = stderr_layer(std::io::stderr);

    match open_appender(log_file) {
        Ok(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();

            LogGuard {
                _file_guard: Some(guard),
            }
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            tracing::warn!(
                path = %log_file.display(),
                error = %e,
                "Cannot open log file; logging to stderr only"
            );

            LogGuard { _file_guard: None }
        }
    }
}

fn stderr_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_target(false)
        .with_filter(filter_fn(mirrored_to_stderr))
}

fn mirrored_to_stderr(meta: &Metadata<'_>) -> bool {
    *meta.level() <= Level::WARN && meta.target() != FILE_ONLY_TARGET
}

fn open_appender(
    log_file: &Path,
) -> std::io::Result<tracing_appender::rolling::RollingFileAppender> {
    let dir = match log_file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    let name = log_file
        .file_name()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "log file has no name")
        })?;
    std::fs::create_dir_all(&dir)?;
    // Probe writability; the appender itself panics on an unwritable path.
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(name))?;
    Ok(tracing_appender::rolling::never(dir, name))
}
