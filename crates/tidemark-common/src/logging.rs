//! Logging setup shared by every job
//!
//! A job calls [`init_logging`] once before doing any work and holds on to the
//! returned guard until it exits. Lines go to stdout, to a daily rolling file
//! under [`LogConfig::log_dir`], or to both.
//!
//! ```no_run
//! use tidemark_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!(table = "etl.movies", rows = 42, "Batch staged");
//!     Ok(())
//! }
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    #[default]
    Stdout,
    File,
    Both,
}

impl FromStr for LogSink {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "stdout" | "console" => Self::Stdout,
            "file" => Self::File,
            "both" => Self::Both,
            other => bail!("unknown log sink '{}'", other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "text" => Self::Text,
            "json" => Self::Json,
            other => bail!("unknown log format '{}'", other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level directive, e.g. "info" or "debug"
    pub level: String,
    pub sink: LogSink,
    pub format: LogFormat,
    pub log_dir: PathBuf,
    /// Rolling files are named `{prefix}.{YYYY-MM-DD}`
    pub file_prefix: String,
    /// Comma-separated per-target directives appended after `level`
    pub directives: Vec<String>,
    pub with_source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            sink: LogSink::Stdout,
            format: LogFormat::Text,
            log_dir: PathBuf::from("logs"),
            file_prefix: "tidemark".to_string(),
            // sqlx logs every statement at info
            directives: vec!["sqlx=warn".to_string()],
            with_source_location: false,
        }
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    anyhow::Error: From<T::Err>,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|e| anyhow::Error::from(e).context(format!("invalid {}", name)))
}

impl LogConfig {
    /// Overlay `LOG_LEVEL`, `LOG_SINK`, `LOG_FORMAT`, `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_DIRECTIVES` and `LOG_SOURCE_LOCATION` on the
    /// defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(level) = env_value("LOG_LEVEL")? {
            config.level = level;
        }
        if let Some(sink) = env_value("LOG_SINK")? {
            config.sink = sink;
        }
        if let Some(format) = env_value("LOG_FORMAT")? {
            config.format = format;
        }
        if let Some(dir) = env_value::<PathBuf>("LOG_DIR")? {
            config.log_dir = dir;
        }
        if let Some(prefix) = env_value("LOG_FILE_PREFIX")? {
            config.file_prefix = prefix;
        }
        if let Some(directives) = env_value::<String>("LOG_DIRECTIVES")? {
            config.directives = directives
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(location) = env_value("LOG_SOURCE_LOCATION")? {
            config.with_source_location = location;
        }
        Ok(config)
    }

    pub fn log_to_files(
        mut self,
        log_dir: impl Into<PathBuf>,
        file_prefix: impl Into<String>,
    ) -> Self {
        self.sink = LogSink::File;
        self.log_dir = log_dir.into();
        self.file_prefix = file_prefix.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// `RUST_LOG` wins over `level`; `directives` are layered on top of both.
    fn build_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::builder()
            .with_default_directive(
                self.level
                    .parse::<Directive>()
                    .with_context(|| format!("invalid log level '{}'", self.level))?,
            )
            .from_env_lossy();
        for directive in &self.directives {
            filter = filter.add_directive(
                directive
                    .parse::<Directive>()
                    .with_context(|| format!("invalid log directive '{}'", directive))?,
            );
        }
        Ok(filter)
    }
}

/// Flushes the file writer when dropped
#[must_use = "file logging stops when the guard is dropped"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = config.build_filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    let mut file_guard = None;

    if matches!(config.sink, LogSink::Stdout | LogSink::Both) {
        layers.push(layer(config, std::io::stdout, true));
    }
    if matches!(config.sink, LogSink::File | LogSink::Both) {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory {}", config.log_dir.display())
        })?;
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
            &config.log_dir,
            &config.file_prefix,
        ));
        layers.push(layer(config, writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(LoggingGuard { _file: file_guard })
}

fn layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(config.with_source_location)
        .with_line_number(config.with_source_location)
        .with_span_events(FmtSpan::CLOSE);
    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_and_format_parse() {
        assert_eq!(" Console ".parse::<LogSink>().unwrap(), LogSink::Stdout);
        assert_eq!("both".parse::<LogSink>().unwrap(), LogSink::Both);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("syslog".parse::<LogSink>().is_err());
    }

    #[test]
    fn test_log_to_files_switches_sink() {
        let config = LogConfig::default()
            .log_to_files("/var/log/tidemark", "sheets")
            .with_directive("tidemark_ingest=debug");

        assert_eq!(config.sink, LogSink::File);
        assert_eq!(config.file_prefix, "sheets");
        assert_eq!(config.directives, vec!["sqlx=warn", "tidemark_ingest=debug"]);
        assert!(config.build_filter().is_ok());
    }

    #[test]
    fn test_bad_directive_is_rejected() {
        let config = LogConfig::default().with_directive("sqlx=notalevel");
        assert!(config.build_filter().is_err());

        let config = LogConfig {
            level: "loud".into(),
            ..LogConfig::default()
        };
        assert!(config.build_filter().is_err());
    }
}
