//! Logging setup for both agents
//!
//! Console output uses a themed formatter; a daily rolling file can be added.
//! Relay logs mark direction with `[-->]` (towards the upstream) and `[<--]`
//! (towards the downstream caller).

use crate::config::LogConfig;
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "logs/deadbeef.log";

/// ANSI color codes for log levels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTheme {
    pub trace: String,
    pub debug: String,
    pub info: String,
    pub warn: String,
    pub error: String,
}

impl LogTheme {
    fn color(&self, level: Level) -> &str {
        match level {
            Level::TRACE => &self.trace,
            Level::DEBUG => &self.debug,
            Level::INFO => &self.info,
            Level::WARN => &self.warn,
            Level::ERROR => &self.error,
        }
    }
}

impl Default for LogTheme {
    fn default() -> Self {
        Self {
            trace: "\x1b[37m".to_string(), // White
            debug: "\x1b[36m".to_string(), // Cyan
            info: "\x1b[32m".to_string(),  // Green
            warn: "\x1b[33m".to_string(),  // Yellow
            error: "\x1b[31m".to_string(), // Red
        }
    }
}

/// Initialize logging from an agent's log settings
pub async fn init(config: &LogConfig) -> anyhow::Result<()> {
    init_logging(
        &config.log_level,
        &config.log_theme_path,
        config.log_to_file,
        config.log_file_path.as_deref(),
    )
    .await
}

/// Initialize logging with the given configuration
pub async fn init_logging(
    log_level: &str,
    theme_path: &str,
    log_to_file: bool,
    log_file_path: Option<&str>,
) -> anyhow::Result<()> {
    let theme = load_theme(theme_path).await?;
    let level = parse_log_level(log_level)?;

    // RUST_LOG may add directives; the configured level applies to this crate.
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
        .add_directive(format!("deadbeef={}", level).parse()?);

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .event_format(LogFormatter {
            theme: theme.clone(),
            colored: true,
        });

    let file_layer = if log_to_file {
        let (directory, file_name) = split_log_path(log_file_path.unwrap_or(DEFAULT_LOG_FILE));
        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, file_name);
        Some(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .event_format(LogFormatter {
                    theme,
                    colored: false,
                }),
        )
    } else {
        None
    };

    let registry = tracing_subscriber::registry().with(filter);

    if let Some(file_layer) = file_layer {
        registry.with(console_layer).with(file_layer).try_init()?;
    } else {
        registry.with(console_layer).try_init()?;
    }

    Ok(())
}

/// Split a log file path into the appender's directory and file name prefix.
fn split_log_path(path: &str) -> (String, String) {
    let path = Path::new(path);
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "deadbeef.log".to_string());
    (directory, file_name)
}

/// Custom log formatter with theme colors
struct LogFormatter {
    theme: LogTheme,
    colored: bool,
}

impl<S, N> fmt::FormatEvent<S, N> for LogFormatter
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

        let datetime = chrono::Utc::now();
        write!(writer, "[{}] ", datetime.format("%Y-%m-%d %H:%M:%S%.3f UTC"))?;

        let level = *metadata.level();
        if self.colored {
            write!(writer, "{}{:<5}\x1b[0m ", self.theme.color(level), level)?;
        } else {
            write!(writer, "{:<5} ", level)?;
        }

        // Connection spans carry the connection id.
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<fmt::FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
                write!(writer, " ")?;
            }
        }

        write!(writer, "{}: ", metadata.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Theme from a YAML file; a missing file falls back to the default colors.
async fn load_theme<P: AsRef<Path>>(path: P) -> anyhow::Result<LogTheme> {
    let path = path.as_ref();
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) => {
            // The subscriber is not installed yet, so this only shows up on
            // a second init.
            tracing::warn!(%err, "No log theme at {}, using defaults", path.display());
            return Ok(LogTheme::default());
        }
    };
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Invalid log theme {}", path.display()))
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| anyhow!("Invalid log level: {}", level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_theme_color_by_level() {
        let theme = LogTheme::default();
        assert_eq!(theme.color(Level::ERROR), "\x1b[31m");
        assert_eq!(theme.color(Level::INFO), "\x1b[32m");
    }

    #[tokio::test]
    async fn test_invalid_theme_is_an_error() {
        let path = std::env::temp_dir().join(format!("theme-{}.yml", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "trace: [unclosed").await.unwrap();
        let result = load_theme(&path).await;
        let _ = tokio::fs::remove_file(&path).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_split_log_path() {
        assert_eq!(
            split_log_path("logs/deadbeef.log"),
            ("logs".to_string(), "deadbeef.log".to_string())
        );
        assert_eq!(
            split_log_path("client.log"),
            (".".to_string(), "client.log".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_theme_uses_default() {
        let theme = load_theme("/nonexistent/theme.yml").await.unwrap();
        assert_eq!(theme, LogTheme::default());
    }

    #[tokio::test]
    async fn test_theme_from_yaml() {
        let path = std::env::temp_dir().join(format!("theme-{}.yml", uuid::Uuid::new_v4()));
        tokio::fs::write(
            &path,
            "trace: a\ndebug: b\ninfo: c\nwarn: d\nerror: e\n",
        )
        .await
        .unwrap();
        let theme = load_theme(&path).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;
        assert_eq!(theme.info, "c");
        assert_eq!(theme.error, "e");
    }
}
