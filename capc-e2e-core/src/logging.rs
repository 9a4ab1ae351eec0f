//! Process logging setup for the runner.
//!
//! A human-readable console layer (stdout or stderr) plus an optional JSON
//! file layer written through a non-blocking appender. `RUST_LOG`, when set,
//! replaces the configured level.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Console output on stderr instead of stdout.
    pub stderr: bool,
    /// Additional JSON log file.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Defaults overridden by `CAPC_E2E_LOG_LEVEL`, `CAPC_E2E_LOG_FORMAT`
    /// and `CAPC_E2E_LOG_FILE`. Unparseable formats fall back to pretty.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("CAPC_E2E_LOG_LEVEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        let format = std::env::var("CAPC_E2E_LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let file = std::env::var_os("CAPC_E2E_LOG_FILE").map(PathBuf::from);
        Self {
            level,
            format,
            stderr: false,
            file,
        }
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        if let Ok(directives) = std::env::var("RUST_LOG")
            && !directives.trim().is_empty()
        {
            return EnvFilter::try_new(&directives).with_context(|| format!("Invalid RUST_LOG: {directives}"));
        }
        EnvFilter::try_new(&self.level).with_context(|| format!("Invalid log level: {}", self.level))
    }
}

/// Keeps background log writers alive; drop at process exit to flush.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn console_layer(config: &LogConfig) -> BoxedLayer {
    let base = tracing_subscriber::fmt::layer().with_target(true);
    match (config.format, config.stderr) {
        (LogFormat::Pretty, true) => base.with_writer(std::io::stderr).boxed(),
        (LogFormat::Pretty, false) => base.boxed(),
        (LogFormat::Compact, true) => base.compact().with_writer(std::io::stderr).boxed(),
        (LogFormat::Compact, false) => base.compact().boxed(),
        (LogFormat::Json, true) => base.json().with_writer(std::io::stderr).boxed(),
        (LogFormat::Json, false) => base.json().boxed(),
    }
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];
    let mut file_guard = None;

    if let Some(path) = &config.file {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        );
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.filter()?)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuards { _file: file_guard })
}
