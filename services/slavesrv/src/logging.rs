//! Logging bootstrap for slavesrv
//!
//! Console output uses the bracketed VoltageEMS format
//! (`2025-12-02T00:50:44.809123Z [INFO] message`); JSON output is available
//! for log shippers. `RUST_LOG`, when set, replaces the configured filter.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::bootstrap::parse_log_level;
use crate::config::LoggingConfig;
use crate::Result;

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "\x1b[35m", // magenta
        Level::DEBUG => "\x1b[34m", // blue
        Level::INFO => "\x1b[32m",  // green
        Level::WARN => "\x1b[33m",  // yellow
        Level::ERROR => "\x1b[31m", // red
    }
}

/// `timestamp [LEVEL] message`
pub struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            write!(
                writer,
                "{}{}\x1b[0m ",
                level_color(&level),
                format_level(&level)
            )?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter directive used when `RUST_LOG` is not set
pub fn default_directive(level: &str) -> String {
    let level = parse_log_level(level).to_string().to_lowercase();
    format!("{},slavesrv={},voltage_slave={}", level, level, level)
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(env) if !env.trim().is_empty() => EnvFilter::new(env),
        _ => EnvFilter::new(default_directive(&config.level)),
    }
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config);

    let layer = if config.json {
        fmt::layer()
            .json()
            .with_level(true)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(config.ansi)
            .event_format(BracketedLevelFormat)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;

    Ok(())
}
