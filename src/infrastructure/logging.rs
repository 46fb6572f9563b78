use crate::domain::settings::LogSettings;
use anyhow::Context;
use std::str::FromStr;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, format, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{prelude::*, EnvFilter};

const FALLBACK_LEVEL: &str = "warn";

pub struct LoggingGuard {
    // Keep alive until exit or buffered file logs are lost
    _guards: Vec<WorkerGuard>,
}

/// Level implied by repeated `-v` flags, if any.
pub fn level_for_verbosity(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

/// Unknown names rotate daily.
pub fn parse_rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// `RUST_LOG` wins over the configured level.
fn level_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

pub fn file_appender(settings: &LogSettings) -> anyhow::Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(parse_rotation(&settings.rotation))
        .filename_prefix(settings.file_name_prefix.as_str())
        .build(&settings.log_dir)
        .with_context(|| format!("Cannot open log directory {}", settings.log_dir))
}

/// Formatting shared by the console and file layers.
fn styled<S, W>(
    settings: &LogSettings,
    writer: W,
) -> fmt::Layer<S, format::DefaultFields, format::Format, W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_file(settings.show_file_line)
        .with_line_number(settings.show_file_line)
        .with_thread_ids(settings.show_thread_ids)
        .with_target(settings.show_target)
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    // stdout belongs to the duel console
    let console_layer = settings
        .console_logging_enabled
        .then(|| styled(settings, std::io::stderr).with_ansi(settings.ansi_colors));

    let file_layer = if settings.file_logging_enabled {
        let (writer, guard) = tracing_appender::non_blocking(file_appender(settings)?);
        guards.push(guard);
        Some(styled(settings, writer).with_ansi(false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(level_filter(settings))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        configured_level = %settings.level,
        console = settings.console_logging_enabled,
        file = settings.file_logging_enabled,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_for_verbosity(0), None);
        assert_eq!(level_for_verbosity(1), Some("info"));
        assert_eq!(level_for_verbosity(2), Some("debug"));
        assert_eq!(level_for_verbosity(7), Some("trace"));
    }

    #[test]
    fn test_rotation_names() {
        assert_eq!(parse_rotation("Hourly"), Rotation::HOURLY);
        assert_eq!(parse_rotation("never"), Rotation::NEVER);
        assert_eq!(parse_rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn test_file_appender_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let settings = LogSettings {
            log_dir: log_dir.to_string_lossy().into_owned(),
            rotation: "never".to_string(),
            ..LogSettings::default()
        };

        assert!(file_appender(&settings).is_ok());
        assert!(log_dir.is_dir());
    }

    #[test]
    fn test_unusable_log_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("taken");
        std::fs::write(&blocker, "not a directory").unwrap();
        let settings = LogSettings {
            log_dir: blocker.join("logs").to_string_lossy().into_owned(),
            ..LogSettings::default()
        };

        assert!(file_appender(&settings).is_err());
    }
}
