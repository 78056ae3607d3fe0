//! Candidate join of impressions with clicks and payments.
//!
//! Both joins are on `(user_id, value_prop)` only. No temporal predicate is
//! applied here; every aggregator filters the fan-out with its own window.

use std::collections::HashMap;

use rayon::prelude::*;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::shard::shard_len;
use crate::table::{
    ClickRecord, ConsolidatedRecord, ConsolidatedTable, EventRecord, EventTable, ImpressionRecord,
    PaymentRecord, CLICK_DAY_COLUMN, CLICK_POSITION_COLUMN, DAY_COLUMN, PAY_DATE_COLUMN,
    POSITION_COLUMN, TOTAL_COLUMN,
};

type PairIndex<'a> = HashMap<(i64, &'a str), Vec<usize>>;

pub fn join_streams(
    impressions: &EventTable<ImpressionRecord>,
    clicks: &EventTable<ClickRecord>,
    payments: &EventTable<PaymentRecord>,
    cfg: &EngineConfig,
) -> Result<ConsolidatedTable, EngineError> {
    let [user_id_col, value_prop_col] = cfg.join_keys.as_columns();
    impressions.require_columns(&[user_id_col, value_prop_col, DAY_COLUMN])?;
    clicks.require_columns(&[user_id_col, value_prop_col, DAY_COLUMN])?;
    payments.require_columns(&[user_id_col, value_prop_col, PAY_DATE_COLUMN])?;

    let click_index = index_by_pair(clicks.rows());
    let payment_index = index_by_pair(payments.rows());

    let chunk = shard_len(impressions.len(), cfg.shard_count);
    let shards: Vec<Vec<ConsolidatedRecord>> = impressions
        .rows()
        .par_chunks(chunk)
        .enumerate()
        .map(|(shard, rows)| {
            let mut out = Vec::new();
            for (offset, impression) in rows.iter().enumerate() {
                expand_impression(
                    shard * chunk + offset,
                    impression,
                    clicks.rows(),
                    &click_index,
                    payments.rows(),
                    &payment_index,
                    &mut out,
                );
            }
            out
        })
        .collect();

    let rows: Vec<ConsolidatedRecord> = shards.into_iter().flatten().collect();
    let columns = vec![
        user_id_col.to_string(),
        value_prop_col.to_string(),
        DAY_COLUMN.to_string(),
        POSITION_COLUMN.to_string(),
        CLICK_DAY_COLUMN.to_string(),
        CLICK_POSITION_COLUMN.to_string(),
        PAY_DATE_COLUMN.to_string(),
        TOTAL_COLUMN.to_string(),
    ];

    info!(
        component = "join",
        event = "join.finish",
        impressions = impressions.len(),
        clicks = clicks.len(),
        payments = payments.len(),
        consolidated_rows = rows.len()
    );

    Ok(ConsolidatedTable::new(columns, rows))
}

fn index_by_pair<R: EventRecord>(rows: &[R]) -> PairIndex<'_> {
    let mut index: PairIndex<'_> = HashMap::new();
    for (id, row) in rows.iter().enumerate() {
        index
            .entry((row.user_id(), row.value_prop()))
            .or_default()
            .push(id);
    }
    index
}

/// Emits one row per (click, payment) pair matching the impression's key, or a
/// single row with empty click/payment sides when nothing matches.
fn expand_impression(
    impression_id: usize,
    impression: &ImpressionRecord,
    clicks: &[ClickRecord],
    click_index: &PairIndex<'_>,
    payments: &[PaymentRecord],
    payment_index: &PairIndex<'_>,
    out: &mut Vec<ConsolidatedRecord>,
) {
    let pair = (impression.user_id, impression.value_prop.as_str());
    let click_ids: &[usize] = click_index.get(&pair).map(Vec::as_slice).unwrap_or(&[]);
    let payment_ids: &[usize] = payment_index.get(&pair).map(Vec::as_slice).unwrap_or(&[]);

    let click_side: Vec<Option<usize>> = if click_ids.is_empty() {
        vec![None]
    } else {
        click_ids.iter().copied().map(Some).collect()
    };
    let payment_side: Vec<Option<usize>> = if payment_ids.is_empty() {
        vec![None]
    } else {
        payment_ids.iter().copied().map(Some).collect()
    };

    for click_id in &click_side {
        let click = click_id.map(|id| &clicks[id]);
        for payment_id in &payment_side {
            let payment = payment_id.map(|id| &payments[id]);
            out.push(ConsolidatedRecord {
                impression_id,
                user_id: impression.user_id,
                value_prop: impression.value_prop.clone(),
                day: impression.day,
                position: impression.position,
                click_id: *click_id,
                click_day: click.map(|c| c.day),
                click_position: click.map(|c| c.position),
                payment_id: *payment_id,
                pay_date: payment.map(|p| p.pay_date),
                total: payment.map(|p| p.total),
            });
        }
    }
}
