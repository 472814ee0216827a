use std::future::Future;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use channel_transport::LogLevel;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Target of the structured per-turn events written to the JSON log.
pub const EVENT_TARGET: &str = "event";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: LogLevel,
    /// Directory for the rolling text and event logs; `None` logs to stdout.
    pub log_dir: Option<PathBuf>,
    pub log_file: String,
    pub event_file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            log_file: "chatflow.log".to_string(),
            event_file: "chatflow-events.log".to_string(),
        }
    }
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level,
            log_dir,
            ..Self::default()
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
///
/// With a log directory, human-readable lines go to a daily rolling text file
/// and events with target `event` go to a daily rolling JSON file. Without
/// one, everything goes to stdout.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_directive()));

    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log dir {}", dir.display()))?;
            let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.log_file);
            let txt_layer = fmt::layer().with_writer(txt_appender).with_ansi(false);

            let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.event_file);
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_appender)
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{EVENT_TARGET}=info")));

            Registry::default()
                .with(env_filter)
                .with(txt_layer)
                .with(json_layer)
                .try_init()
                .context("tracing already initialised")?;
        }
        None => {
            Registry::default()
                .with(env_filter)
                .with(fmt::layer().with_target(false))
                .try_init()
                .context("tracing already initialised")?;
        }
    }
    Ok(())
}

/// Run `handler` and emit one `event` line with its outcome and latency.
pub async fn instrument_event<F, Fut, T, E>(name: &str, key: &str, handler: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let result = handler().await;
    let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;
    match &result {
        Ok(_) => info!(target: "event", event = name, key, latency_ms, success = true),
        Err(e) => error!(target: "event", event = name, key, latency_ms, success = false, error = %e),
    }
    result
}
