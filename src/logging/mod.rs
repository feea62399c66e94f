//! Logging setup for the evasion engine
//!
//! Installs a tracing subscriber with a compact event format on stdout and
//! an optional daily-rolling file appender. Selection and feedback paths log
//! at debug level under the `mimic` target so adaptation decisions can be
//! replayed from logs.

use std::path::Path;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const RESET: &str = "\x1b[0m";

fn level_color(level: Level) -> &'static str {
    match level {
        Level::TRACE => "\x1b[90m",
        Level::DEBUG => "\x1b[36m",
        Level::INFO => "\x1b[32m",
        Level::WARN => "\x1b[33m",
        Level::ERROR => "\x1b[31m",
    }
}

/// Initialize logging with the given configuration
pub fn init_logging(
    log_level: &str,
    log_to_file: bool,
    log_file_path: Option<&str>,
) -> anyhow::Result<()> {
    let level = parse_log_level(log_level)?;

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("mimic=debug".parse()?);

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .event_format(EngineFormatter { ansi: true });

    let file_layer = if log_to_file {
        let path = log_file_path.unwrap_or("logs/mimic.log");
        let (directory, file_name) = split_log_path(path);
        let appender = RollingFileAppender::new(Rotation::DAILY, directory, file_name);
        Some(
            fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .event_format(EngineFormatter { ansi: false }),
        )
    } else {
        None
    };

    let registry = tracing_subscriber::registry().with(filter);
    if let Some(file_layer) = file_layer {
        registry.with(console_layer).with(file_layer).init();
    } else {
        registry.with(console_layer).init();
    }

    Ok(())
}

fn split_log_path(path: &str) -> (String, String) {
    let path = Path::new(path);
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "logs".to_string());
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "mimic.log".to_string());
    (directory, file_name)
}

/// Compact single-line event format
struct EngineFormatter {
    ansi: bool,
}

impl<S, N> fmt::FormatEvent<S, N> for EngineFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        let now: chrono::DateTime<chrono::Utc> = std::time::SystemTime::now().into();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        if self.ansi {
            write!(writer, "{}{:<5}{} ", level_color(*metadata.level()), metadata.level(), RESET)?;
        } else {
            write!(writer, "{:<5} ", metadata.level())?;
        }

        write!(writer, "{}: ", metadata.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Parse a log level string to a tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", level)),
    }
}
