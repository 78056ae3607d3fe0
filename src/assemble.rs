//! Left-join of the aggregator outputs onto the reference keys.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::config::EngineConfig;
use crate::table::{ReferenceKey, Timestamp, DAY_COLUMN};
use crate::window::ReferenceSet;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const CLICKED_COLUMN: &str = "clicked";
pub const VIEW_COUNT_COLUMN: &str = "view_count";
pub const CLICK_COUNT_COLUMN: &str = "click_count";
pub const CUMULATIVE_PAYMENT_COLUMN: &str = "cumulative_payment_amount";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    I64,
    U64,
    F64,
    Bool,
    Text,
    Timestamp,
}

impl FeatureDType {
    fn as_str(self) -> &'static str {
        match self {
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F64 => "f64",
            Self::Bool => "bool",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    #[serde(flatten)]
    pub key: ReferenceKey,
    pub clicked: bool,
    pub view_count: u64,
    pub click_count: u64,
    pub cumulative_payment_amount: f64,
}

impl FeatureRow {
    /// Row with every aggregate at its documented default.
    pub fn defaults(key: ReferenceKey) -> Self {
        Self {
            key,
            clicked: false,
            view_count: 0,
            click_count: 0,
            cumulative_payment_amount: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub rows: Vec<FeatureRow>,
}

#[derive(Debug, Error)]
pub enum SchemaCompatibilityError {
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

pub fn build_feature_schema(cfg: &EngineConfig) -> FeatureSchema {
    let [user_id_col, value_prop_col] = cfg.join_keys.as_columns();
    let columns = vec![
        column(user_id_col, FeatureDType::I64),
        column(value_prop_col, FeatureDType::Text),
        column(DAY_COLUMN, FeatureDType::Timestamp),
        column(CLICKED_COLUMN, FeatureDType::Bool),
        column(VIEW_COUNT_COLUMN, FeatureDType::U64),
        column(CLICK_COUNT_COLUMN, FeatureDType::U64),
        column(CUMULATIVE_PAYMENT_COLUMN, FeatureDType::F64),
    ];
    let fingerprint = schema_fingerprint(cfg, &columns);

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), SchemaCompatibilityError> {
    if expected_version != actual.version {
        return Err(SchemaCompatibilityError::VersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(SchemaCompatibilityError::FingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Produces exactly one row per reference key. Keys an aggregator did not emit
/// take that aggregator's default.
pub fn assemble(
    reference: &ReferenceSet,
    click_indicator: &HashMap<ReferenceKey, bool>,
    view_count: &HashMap<ReferenceKey, u64>,
    click_count: &HashMap<ReferenceKey, u64>,
    cumulative_payments: &HashMap<ReferenceKey, f64>,
    cfg: &EngineConfig,
) -> FeatureTable {
    let rows: Vec<FeatureRow> = reference
        .keys
        .iter()
        .map(|key| FeatureRow {
            clicked: click_indicator.get(key).copied().unwrap_or(false),
            view_count: view_count.get(key).copied().unwrap_or(0),
            click_count: click_count.get(key).copied().unwrap_or(0),
            cumulative_payment_amount: cumulative_payments.get(key).copied().unwrap_or(0.0),
            key: key.clone(),
        })
        .collect();

    let schema = build_feature_schema(cfg);
    info!(
        component = "assemble",
        event = "assemble.finish",
        rows = rows.len(),
        clicked_rows = rows.iter().filter(|r| r.clicked).count(),
        fingerprint = %schema.fingerprint
    );

    FeatureTable {
        schema,
        window_start: reference.window_start,
        window_end: reference.window_end,
        rows,
    }
}

fn column(name: &str, dtype: FeatureDType) -> FeatureColumn {
    FeatureColumn {
        name: name.to_string(),
        dtype,
    }
}

fn schema_fingerprint(cfg: &EngineConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update(format!("lookback_weeks:{};", cfg.lookback_weeks));
    hasher.update(format!(
        "reporting_window_days:{};",
        cfg.reporting_window_days
    ));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{};", column.dtype.as_str()));
    }
    hex::encode(hasher.finalize())
}
