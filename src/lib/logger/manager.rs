use std::path::Path;

use anyhow::{Context, Result};
use tracing::{metadata::LevelFilter, *};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    EnvFilter, Layer,
};

use crate::cli;

// Start logger, should be done inside main
pub fn init() -> Result<()> {
    // Redirect all logs from libs using "Log"
    LogTracer::init_with_filter(tracing::log::LevelFilter::Trace)
        .context("Failed to set logger")?;

    // Configure the console log
    let console_env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli::manager::is_verbose() {
            EnvFilter::new(LevelFilter::DEBUG.to_string())
        } else {
            EnvFilter::new(LevelFilter::INFO.to_string())
        }
    });

    // Stdout carries the JSON reports when requested
    let console_writer = if cli::manager::is_json() {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    let console_layer = fmt::Layer::new()
        .with_writer(console_writer)
        .with_ansi(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(fmt::format::FmtSpan::NONE)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_filter(console_env_filter);

    // Configure the file log
    let file_layer = match cli::manager::log_path() {
        Some(dir) => {
            let file_env_filter = if cli::manager::is_verbose() {
                EnvFilter::new(LevelFilter::TRACE.to_string())
            } else {
                EnvFilter::new(LevelFilter::DEBUG.to_string())
            };
            let layer = fmt::Layer::new()
                .with_writer(file_appender(dir)?)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(fmt::format::FmtSpan::NONE)
                .with_target(false)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_filter(file_env_filter);
            Some(layer)
        }
        None => None,
    };

    // Configure the default subscriber
    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("Unable to set a global subscriber")?;

    // Configure GSTreamer logs integration
    #[cfg(feature = "gst")]
    {
        gst::log::remove_default_log_function();
        redirect_gstreamer_logs_to_tracing();
    }

    info!(
        "{}, version: {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );
    info!(
        "Starting at {}",
        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
    );
    debug!("Command line call: {}", cli::manager::command_line_string());
    debug!(
        "Command line input struct call: {}",
        cli::manager::command_line()
    );

    Ok(())
}

/// Hourly rotated `pipeline-perf.<date-hour>.log` files inside `dir`.
pub fn file_appender(dir: &Path) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix("pipeline-perf")
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("Failed creating the log file appender at {dir:?}"))
}

#[cfg(feature = "gst")]
fn tracing_level(level: gst::DebugLevel) -> Level {
    match level {
        gst::DebugLevel::Error => Level::ERROR,
        gst::DebugLevel::Warning | gst::DebugLevel::Fixme => Level::WARN,
        gst::DebugLevel::Info => Level::INFO,
        gst::DebugLevel::Debug => Level::DEBUG,
        _ => Level::TRACE,
    }
}

// GStreamer debug messages are forwarded under the "gstreamer" target
#[cfg(feature = "gst")]
fn redirect_gstreamer_logs_to_tracing() {
    gst::log::add_log_function(|category, level, file, function, line, object, message| {
        let source = object.map(|o| format!(":<{o}>")).unwrap_or_default();
        let text = format!(
            "{} {file}:{line}:{function}{source} {}",
            category.name(),
            message.get().map(|m| m.to_string()).unwrap_or_default()
        );

        match tracing_level(level) {
            Level::ERROR => error!(target: "gstreamer", parent: None, "{text}"),
            Level::WARN => warn!(target: "gstreamer", parent: None, "{text}"),
            Level::INFO => info!(target: "gstreamer", parent: None, "{text}"),
            Level::DEBUG => debug!(target: "gstreamer", parent: None, "{text}"),
            _ => trace!(target: "gstreamer", parent: None, "{text}"),
        }
    });
}
