use std::path::Path;

use anyhow::Result;
use command_plugin::message::LogLevel;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Target of the one-line-per-job report events that go to the JSON file.
pub const JOB_REPORT_TARGET: &str = "job_report";

/// Installs the global subscriber:
///
/// - stdout, filtered by `RUST_LOG` or `level`
/// - `<root>/logs/chainops.log`, the same events as plain text, rotated daily
/// - `<root>/logs/jobs.json`, newline-delimited JSON with only the
///   [`JOB_REPORT_TARGET`] events, rotated daily
pub fn init_tracing(root: &Path, level: LogLevel) -> Result<()> {
    let log_dir = root.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let stdout_layer = fmt::layer().with_thread_names(true).with_filter(filter());

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "chainops.log");
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(filter());

    let json_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "jobs.json");
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{JOB_REPORT_TARGET}=info")));

    Registry::default()
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()?;
    Ok(())
}
