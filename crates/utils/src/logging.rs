//! provides logging helpers

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// An explicit level wins over `RUST_LOG`; otherwise `RUST_LOG` applies with an `info` default.
fn env_filter(level: Option<filter::LevelFilter>) -> filter::EnvFilter {
    match level {
        Some(level) => filter::EnvFilter::builder()
            .with_default_directive(level.into())
            .parse_lossy(""),
        None => filter::EnvFilter::builder()
            .with_default_directive(filter::LevelFilter::INFO.into())
            .from_env_lossy(),
    }
}

/// initiate the global tracing subscriber
///
/// Events go to stderr. With `log_file` set they are also written to a daily
/// rotated file; keep the returned guard alive until exit so it gets flushed.
pub fn init(
    level: Option<filter::LevelFilter>,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter(level));

    let (file_layer, guard) = match log_file {
        Some(log_file) => {
            let dir = log_file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let prefix = log_file
                .file_name()
                .and_then(|name| name.to_str())
                .context("log file name must be valid UTF-8")?;

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(3)
                .build(dir)
                .context("failed to create rolling file appender")?;
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(level));
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    registry()
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install global tracing subscriber")?;

    Ok(guard)
}
