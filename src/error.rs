//! Failure taxonomy shared by the join, window and aggregation stages.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of one of the four independent aggregators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregatorKind {
    ClickIndicator,
    ViewCount,
    ClickCount,
    CumulativePayments,
}

impl AggregatorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClickIndicator => "click_indicator",
            Self::ViewCount => "view_count",
            Self::ClickCount => "click_count",
            Self::CumulativePayments => "cumulative_payments",
        }
    }
}

impl fmt::Display for AggregatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("table '{table}' is missing required columns: {missing:?}")]
    Schema {
        table: &'static str,
        missing: Vec<String>,
    },
    #[error("table '{table}' is empty; the reporting window is undefined")]
    EmptyInput { table: &'static str },
    #[error("aggregator {aggregator} failed: {source}")]
    PartialAggregation {
        aggregator: AggregatorKind,
        #[source]
        source: Box<EngineError>,
    },
    #[error("aggregator task {aggregator} did not complete: {message}")]
    TaskPanicked {
        aggregator: AggregatorKind,
        message: String,
    },
    #[error("invalid engine config: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// The aggregator whose failure aborted the run, if any.
    pub fn failed_aggregator(&self) -> Option<AggregatorKind> {
        match self {
            Self::PartialAggregation { aggregator, .. } | Self::TaskPanicked { aggregator, .. } => {
                Some(*aggregator)
            }
            _ => None,
        }
    }
}
