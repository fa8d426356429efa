//! Logging setup and the pipeline's run/stage log events.
//!
//! Logs go to stderr; the `daily_pipeline` binary keeps stdout for its run summary.

use std::env;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;
use crate::pipeline::PipelineStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from_lookup(|key| env::var(key).ok())
}

pub fn logging_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = lookup("EQL_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }
    if let Some(parsed) = lookup("EQL_LOG_FORMAT").as_deref().and_then(parse_log_format) {
        config.format = parsed;
    }
    if let Some(parsed) = lookup("EQL_LOG_TARGET").as_deref().and_then(parse_bool) {
        config.include_target = parsed;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_writer(std::io::stderr)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_run_start(config: &PipelineConfig, run_date: NaiveDate) {
    info!(
        component = "pipeline",
        event = "run.start",
        run_date = %run_date,
        source_start = %config.source_range.start,
        source_end = %config.source_range.end,
        dataset_start = %config.dataset_range.start,
        dataset_end = %config.dataset_range.end,
        bucket = %config.bucket,
        validation_mode = ?config.validation_mode
    );
}

pub fn log_stage_transition(from: PipelineStage, to: PipelineStage, rows: Option<usize>) {
    match rows {
        Some(rows) => info!(
            component = "pipeline",
            event = "stage.transition",
            from = %from,
            to = %to,
            rows
        ),
        None => info!(
            component = "pipeline",
            event = "stage.transition",
            from = %from,
            to = %to
        ),
    }
}

/// Logs the failing stage together with every error in the cause chain.
pub fn log_stage_failure(stage: PipelineStage, err: &(dyn std::error::Error + 'static)) {
    let mut chain = Vec::new();
    let mut cause = err.source();
    while let Some(inner) = cause {
        chain.push(inner.to_string());
        cause = inner.source();
    }
    error!(
        component = "pipeline",
        event = "stage.failed",
        stage = %stage,
        error = %err,
        causes = ?chain
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
