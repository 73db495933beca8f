use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::env_or;
use crate::infrastructure::error::ConfigError;

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: String,
    /// Rolled files kept per log; older ones are removed by the cleanup task.
    pub max_files: usize,
    pub enable_console: bool,
    pub enable_file: bool,
    pub log_level: Level,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            max_files: 14,
            enable_console: true,
            enable_file: false,
            log_level: Level::INFO,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            log_dir: env_or("LOG_DIR", defaults.log_dir)?,
            max_files: env_or("LOG_MAX_FILES", defaults.max_files)?,
            enable_console: env_or("LOG_CONSOLE", defaults.enable_console)?,
            enable_file: env_or("LOG_FILE", defaults.enable_file)?,
            log_level: env_or("LOG_LEVEL", defaults.log_level)?,
        })
    }

    /// Used when `RUST_LOG` is not set.
    pub fn default_filter(&self) -> String {
        format!(
            "coalesce_relay={},sqlx=warn,rdkafka=warn",
            self.log_level.to_string().to_lowercase()
        )
    }
}

/// Installs the global subscriber. The returned guards flush the file
/// writers when dropped, so the caller keeps them until exit.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Vec<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();
    let mut guards = Vec::new();

    if config.enable_console {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true);
        layers.push(Box::new(console_layer));
    }

    if config.enable_file {
        fs::create_dir_all(&config.log_dir)?;

        let error_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "error.log");
        let (error_writer, error_guard) = tracing_appender::non_blocking(error_appender);
        guards.push(error_guard);
        let error_layer = fmt::layer()
            .with_writer(error_writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(tracing_subscriber::filter::LevelFilter::WARN);
        layers.push(Box::new(error_layer));

        let all_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "coalesce-relay.log");
        let (all_writer, all_guard) = tracing_appender::non_blocking(all_appender);
        guards.push(all_guard);
        let all_layer = fmt::layer()
            .with_writer(all_writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false);
        layers.push(Box::new(all_layer));
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    Ok(guards)
}

/// Removes the oldest `.log` files beyond `max_files`. Returns how many were
/// removed.
pub fn cleanup_old_logs(log_dir: &str, max_files: usize) -> std::io::Result<usize> {
    let log_path = Path::new(log_dir);
    if !log_path.exists() {
        return Ok(0);
    }

    let mut log_files: Vec<_> = fs::read_dir(log_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.contains(".log"))
                .unwrap_or(false)
        })
        .collect();

    // Oldest first.
    log_files.sort_by_key(|entry| {
        entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });

    let mut removed = 0;
    if log_files.len() > max_files {
        let excess = log_files.len() - max_files;
        for entry in log_files.iter().take(excess) {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => error!("Failed to remove old log file {:?}: {}", entry.path(), e),
            }
        }
    }
    Ok(removed)
}

/// Periodically trims the log directory until `shutdown` fires.
pub async fn run_log_cleanup(config: LoggingConfig, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match cleanup_old_logs(&config.log_dir, config.max_files) {
                    Ok(removed) if removed > 0 => debug!(removed, "Old log files removed"),
                    Ok(_) => {}
                    Err(e) => error!("Failed to cleanup old logs: {}", e),
                }
            }
        }
    }
}
