use crate::cli::Config;
use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// This formatter is designed to provide clean, user-facing output where the
/// entire log line is colored according to its severity level, without any
/// extra metadata like timestamps or log levels printed.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields to apply color to the entire line.
        // This is necessary because the format_fields method writes directly.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        // Apply color based on the event's log level.
        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        // Write the colored line to the actual output.
        writeln!(writer, "{}", colored_output)
    }
}

/// Installs the two-layer subscriber both binaries share: a detailed layer
/// (file, daily-rotated, or stderr when `--log-file stderr`) and, unless
/// `--quiet` was passed, a [`ColorizedFormatter`] stdout layer for
/// user-facing output. `-v`/`-vv` raise the detailed layer from info to
/// debug to trace.
pub fn init(config: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    let level = match config.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (detail_writer, guard) = match config.log_file.as_deref().and_then(|p| p.to_str()) {
        Some("stderr") | None => tracing_appender::non_blocking(std::io::stderr()),
        Some(path) => {
            let dir = std::path::Path::new(path).parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = std::path::Path::new(path)
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("app-control.log");
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name))
        }
    };
    let detail_layer = tracing_subscriber::fmt::layer().with_writer(detail_writer).with_ansi(false);
    let registry = tracing_subscriber::registry().with(filter).with(detail_layer);

    if config.quiet {
        registry.init();
    } else {
        let stdout_layer = tracing_subscriber::fmt::layer()
            .event_format(ColorizedFormatter)
            .with_writer(std::io::stdout);
        registry.with(stdout_layer).init();
    }

    guard
}