//! Engagement feature engine.
//!
//! Computes per `(user_id, value_prop, day)` features for the impressions of
//! the latest reporting window:
//! - click indicator for the impression day
//! - prior view and click counts inside a trailing lookback
//! - cumulative payment amount inside the same lookback
//!
//! Stages: ingest, join, window, four parallel aggregators, assemble,
//! finalize, export.

mod aggregate;
mod assemble;
mod config;
mod engine;
mod error;
mod export;
mod finalize;
mod ingest;
mod join;
mod observability;
mod shard;
mod table;
mod window;

pub use aggregate::{click_count, click_indicator, cumulative_payments, view_count};
pub use assemble::{
    assemble, assert_schema_compatible, build_feature_schema, FeatureColumn, FeatureDType,
    FeatureRow, FeatureSchema, FeatureTable, SchemaCompatibilityError, CLICKED_COLUMN,
    CLICK_COUNT_COLUMN, CUMULATIVE_PAYMENT_COLUMN, FEATURE_SCHEMA_VERSION, VIEW_COUNT_COLUMN,
};
pub use config::{
    engine_config_from_env, pipeline_paths_from_env, ConfigError, EngineConfig, JoinKeys,
    PipelinePaths, DEFAULT_LOOKBACK_WEEKS, DEFAULT_REPORTING_WINDOW_DAYS, DEFAULT_SHARD_COUNT,
};
pub use engine::{compute_features, prepare, PreparedInputs};
pub use error::{AggregatorKind, EngineError};
pub use export::{export_table, ExportError, ExportFormat};
pub use finalize::{
    finalize, finalized_columns, Cell, ExportTable, FinalizeConfig, FinalizeReport,
    LAST_PAYMENT_COLUMN, TOTAL_PAYMENT_COLUMN,
};
pub use ingest::{
    load_clicks, load_impressions, load_payments, parse_timestamp, IngestError, IngestReport,
    InputFormat,
};
pub use join::join_streams;
pub use observability::{
    init_logging, log_inputs_selected, log_pipeline_finish, log_pipeline_start,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use table::{
    ClickRecord, ConsolidatedRecord, ConsolidatedTable, EventRecord, EventTable,
    ImpressionRecord, PaymentRecord, ReferenceKey, Timestamp, CLICK_DAY_COLUMN,
    CLICK_POSITION_COLUMN, DAY_COLUMN, PAY_DATE_COLUMN, POSITION_COLUMN, TOTAL_COLUMN,
    UNKNOWN_POSITION, USER_ID_COLUMN, VALUE_PROP_COLUMN,
};
pub use window::{select_window, ReferenceSet};
