//! Trailing reporting-window selection.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::shard::shard_len;
use crate::table::{EventTable, ImpressionRecord, ReferenceKey, Timestamp, DAY_COLUMN};

/// Distinct reference keys of the reporting window, sorted, plus the bounds
/// that produced them. `window_end` is the single global "now" of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSet {
    pub keys: Vec<ReferenceKey>,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
}

impl ReferenceSet {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub fn select_window(
    impressions: &EventTable<ImpressionRecord>,
    cfg: &EngineConfig,
) -> Result<ReferenceSet, EngineError> {
    let [user_id_col, value_prop_col] = cfg.join_keys.as_columns();
    impressions.require_columns(&[user_id_col, value_prop_col, DAY_COLUMN])?;

    let chunk = shard_len(impressions.len(), cfg.shard_count);
    let window_end = global_max_day(impressions.rows(), chunk).ok_or(EngineError::EmptyInput {
        table: impressions.table_name(),
    })?;
    let window_start = window_end - cfg.reporting_window();

    let shards: Vec<Vec<ReferenceKey>> = impressions
        .rows()
        .par_chunks(chunk)
        .map(|rows| {
            rows.iter()
                .filter(|row| row.day >= window_start)
                .map(|row| ReferenceKey::new(row.user_id, row.value_prop.clone(), row.day))
                .collect()
        })
        .collect();

    let mut keys: Vec<ReferenceKey> = shards.into_iter().flatten().collect();
    let windowed_impressions = keys.len();
    keys.sort();
    keys.dedup();

    info!(
        component = "window",
        event = "window.selected",
        window_start = %window_start,
        window_end = %window_end,
        windowed_impressions,
        reference_keys = keys.len()
    );

    Ok(ReferenceSet {
        keys,
        window_start,
        window_end,
    })
}

/// Local max per shard, then max over the shard maxima.
fn global_max_day(rows: &[ImpressionRecord], chunk: usize) -> Option<Timestamp> {
    let local_maxima: Vec<Option<Timestamp>> = rows
        .par_chunks(chunk)
        .map(|shard| shard.iter().map(|row| row.day).max())
        .collect();
    local_maxima.into_iter().flatten().max()
}
