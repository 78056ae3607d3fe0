//! Logging setup for the pipeline binary and the lifecycle events it emits.

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{non_empty_var, EngineConfig, PipelinePaths};
use crate::finalize::FinalizeReport;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Log output settings. Unrecognized env values keep the default rather than
/// failing the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
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

/// Reads `EF_LOG_LEVEL`, `EF_LOG_FORMAT` and `EF_LOG_TARGET`.
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: non_empty_var("EF_LOG_LEVEL").unwrap_or(defaults.level),
        format: non_empty_var("EF_LOG_FORMAT")
            .and_then(|raw| LogFormat::parse(&raw))
            .unwrap_or(defaults.format),
        include_target: non_empty_var("EF_LOG_TARGET")
            .and_then(|raw| parse_flag(&raw))
            .unwrap_or(defaults.include_target),
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target)
        .with_ansi(config.format == LogFormat::Pretty);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }
    Ok(())
}

pub fn log_pipeline_start(logging: &LoggingConfig, engine: &EngineConfig) {
    info!(
        component = "feature_pipeline",
        event = "pipeline.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        lookback_weeks = engine.lookback_weeks,
        reporting_window_days = engine.reporting_window_days,
        shard_count = engine.shard_count,
        user_id_column = %engine.join_keys.user_id,
        value_prop_column = %engine.join_keys.value_prop
    );
}

pub fn log_inputs_selected(paths: &PipelinePaths) {
    info!(
        component = "feature_pipeline",
        event = "pipeline.inputs",
        impressions = %paths.impressions.display(),
        clicks = %paths.clicks.display(),
        payments = %paths.payments.display(),
        output = %paths.output.display(),
        format = paths.format.as_str()
    );
}

pub fn log_pipeline_finish(paths: &PipelinePaths, report: &FinalizeReport, output_rows: usize) {
    info!(
        component = "feature_pipeline",
        event = "pipeline.finish",
        output = %paths.output.display(),
        format = paths.format.as_str(),
        feature_rows = report.input_rows,
        output_rows,
        dropped_rows = report.dropped_rows
    );
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env_guard::with_env_vars;

    const LOG_VARS: [&str; 3] = ["EF_LOG_LEVEL", "EF_LOG_FORMAT", "EF_LOG_TARGET"];

    #[test]
    fn unset_or_blank_vars_keep_defaults() {
        let unset: Vec<(&str, Option<&str>)> = LOG_VARS.iter().map(|k| (*k, None)).collect();
        assert_eq!(
            with_env_vars(&unset, logging_config_from_env),
            LoggingConfig::default()
        );

        let blank: Vec<(&str, Option<&str>)> = LOG_VARS.iter().map(|k| (*k, Some("  "))).collect();
        assert_eq!(
            with_env_vars(&blank, logging_config_from_env),
            LoggingConfig::default()
        );
    }

    #[test]
    fn json_debug_without_target() {
        let cfg = with_env_vars(
            &[
                ("EF_LOG_LEVEL", Some("engagement_features=debug")),
                ("EF_LOG_FORMAT", Some(" JSON ")),
                ("EF_LOG_TARGET", Some("off")),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg.level, "engagement_features=debug");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn unknown_format_and_flag_fall_back_per_field() {
        let cfg = with_env_vars(
            &[
                ("EF_LOG_LEVEL", Some("warn")),
                ("EF_LOG_FORMAT", Some("yaml")),
                ("EF_LOG_TARGET", Some("sometimes")),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg.level, "warn");
        assert_eq!(cfg.format, LogFormat::Pretty);
        assert!(cfg.include_target);
    }
}
