//! Engine and pipeline configuration, with environment overrides.

use std::env;
use std::path::PathBuf;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EngineError;
use crate::export::ExportFormat;
use crate::table::{USER_ID_COLUMN, VALUE_PROP_COLUMN};

pub const DEFAULT_LOOKBACK_WEEKS: u32 = 3;
pub const DEFAULT_REPORTING_WINDOW_DAYS: u32 = 7;
pub const DEFAULT_SHARD_COUNT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinKeys {
    pub user_id: String,
    pub value_prop: String,
}

impl Default for JoinKeys {
    fn default() -> Self {
        Self {
            user_id: USER_ID_COLUMN.to_string(),
            value_prop: VALUE_PROP_COLUMN.to_string(),
        }
    }
}

impl JoinKeys {
    pub fn as_columns(&self) -> [&str; 2] {
        [&self.user_id, &self.value_prop]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub lookback_weeks: u32,
    pub reporting_window_days: u32,
    pub join_keys: JoinKeys,
    /// Upper bound on shards per stage; small inputs use fewer.
    pub shard_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookback_weeks: DEFAULT_LOOKBACK_WEEKS,
            reporting_window_days: DEFAULT_REPORTING_WINDOW_DAYS,
            join_keys: JoinKeys::default(),
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

impl EngineConfig {
    pub fn lookback(&self) -> ChronoDuration {
        ChronoDuration::weeks(i64::from(self.lookback_weeks))
    }

    pub fn reporting_window(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.reporting_window_days))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.lookback_weeks == 0 {
            return Err(EngineError::InvalidConfig(
                "lookback_weeks must be > 0".to_string(),
            ));
        }
        if self.reporting_window_days == 0 {
            return Err(EngineError::InvalidConfig(
                "reporting_window_days must be > 0".to_string(),
            ));
        }
        if self.shard_count == 0 {
            return Err(EngineError::InvalidConfig(
                "shard_count must be > 0".to_string(),
            ));
        }
        let [user_id, value_prop] = self.join_keys.as_columns();
        if user_id.trim().is_empty() || value_prop.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "join key column names must be non-empty".to_string(),
            ));
        }
        if user_id == value_prop {
            return Err(EngineError::InvalidConfig(
                "join key column names must be distinct".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePaths {
    pub impressions: PathBuf,
    pub clicks: PathBuf,
    pub payments: PathBuf,
    pub output: PathBuf,
    pub format: ExportFormat,
}

impl Default for PipelinePaths {
    fn default() -> Self {
        Self {
            impressions: PathBuf::from("data/prints.json"),
            clicks: PathBuf::from("data/taps.json"),
            payments: PathBuf::from("data/pays.csv"),
            output: PathBuf::from("data/output/features.csv"),
            format: ExportFormat::Csv,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} has unsupported value '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

pub fn engine_config_from_env() -> Result<EngineConfig, ConfigError> {
    let mut config = EngineConfig::default();

    if let Some(raw) = non_empty_var("EF_LOOKBACK_WEEKS") {
        config.lookback_weeks = parse_positive("EF_LOOKBACK_WEEKS", &raw)?;
    }
    if let Some(raw) = non_empty_var("EF_REPORTING_WINDOW_DAYS") {
        config.reporting_window_days = parse_positive("EF_REPORTING_WINDOW_DAYS", &raw)?;
    }
    if let Some(raw) = non_empty_var("EF_SHARD_COUNT") {
        config.shard_count = parse_positive::<usize>("EF_SHARD_COUNT", &raw)?;
    }
    if let Some(raw) = non_empty_var("EF_USER_ID_COLUMN") {
        config.join_keys.user_id = raw;
    }
    if let Some(raw) = non_empty_var("EF_VALUE_PROP_COLUMN") {
        config.join_keys.value_prop = raw;
    }

    Ok(config)
}

pub fn pipeline_paths_from_env() -> Result<PipelinePaths, ConfigError> {
    let mut paths = PipelinePaths::default();

    if let Some(raw) = non_empty_var("EF_PRINTS_PATH") {
        paths.impressions = PathBuf::from(raw);
    }
    if let Some(raw) = non_empty_var("EF_TAPS_PATH") {
        paths.clicks = PathBuf::from(raw);
    }
    if let Some(raw) = non_empty_var("EF_PAYS_PATH") {
        paths.payments = PathBuf::from(raw);
    }
    if let Some(raw) = non_empty_var("EF_OUTPUT_PATH") {
        paths.output = PathBuf::from(raw);
    }
    if let Some(raw) = non_empty_var("EF_EXPORT_FORMAT") {
        paths.format = ExportFormat::parse(&raw).ok_or(ConfigError::InvalidValue {
            var: "EF_EXPORT_FORMAT",
            value: raw.clone(),
        })?;
    }

    Ok(paths)
}

pub(crate) fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_positive<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match raw.parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::InvalidNumber {
            var,
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod env_guard {
    //! Process-wide serialization for tests that touch `EF_*` variables.

    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    /// Sets `vars` (None removes), runs `f`, then restores previous values.
    pub(crate) fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }
}
