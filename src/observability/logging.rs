//! `tracing` subscriber setup.
//!
//! `RUST_LOG` overrides the configured level when set.

use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Log format type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain text format (default)
    #[default]
    Text,
    /// JSON structured format
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Log configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Append to this file instead of stdout
    pub file_path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            file_path: None,
        }
    }
}

impl LogConfig {
    pub fn parse_level(s: &str) -> Option<Level> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Level::TRACE),
            "debug" => Some(Level::DEBUG),
            "info" => Some(Level::INFO),
            "warn" | "warning" => Some(Level::WARN),
            "error" => Some(Level::ERROR),
            _ => None,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy()
    }
}

/// Install the global subscriber. Fails when the log file cannot be opened
/// or a subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> std::io::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(config.filter());

    let installed = match (&config.file_path, config.format) {
        (None, LogFormat::Text) => builder.try_init(),
        (None, LogFormat::Json) => builder.json().try_init(),
        (Some(path), format) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            match format {
                LogFormat::Text => builder.try_init(),
                LogFormat::Json => builder.json().try_init(),
            }
        }
    };
    installed.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}
