//! One-shot feature computation: join, window, four parallel aggregators,
//! assemble.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::{spawn_blocking, JoinError};
use tracing::{error, info};

use crate::aggregate::{click_count, click_indicator, cumulative_payments, view_count};
use crate::assemble::{assemble, FeatureTable};
use crate::config::EngineConfig;
use crate::error::{AggregatorKind, EngineError};
use crate::join::join_streams;
use crate::table::{
    ClickRecord, ConsolidatedTable, EventTable, ImpressionRecord, PaymentRecord, ReferenceKey,
};
use crate::window::{select_window, ReferenceSet};

/// Output of the sequential stages that every aggregator reads.
#[derive(Debug, Clone)]
pub struct PreparedInputs {
    pub consolidated: ConsolidatedTable,
    pub reference: ReferenceSet,
}

pub fn prepare(
    impressions: &EventTable<ImpressionRecord>,
    clicks: &EventTable<ClickRecord>,
    payments: &EventTable<PaymentRecord>,
    cfg: &EngineConfig,
) -> Result<PreparedInputs, EngineError> {
    cfg.validate()?;
    let consolidated = join_streams(impressions, clicks, payments, cfg)?;
    let reference = select_window(impressions, cfg)?;
    Ok(PreparedInputs {
        consolidated,
        reference,
    })
}

/// Runs the whole engine over an in-memory snapshot.
///
/// Aggregators run as independent blocking tasks over shared read-only inputs.
/// If any of them fails the run is aborted; a partial feature table is never
/// returned.
pub async fn compute_features(
    impressions: EventTable<ImpressionRecord>,
    clicks: EventTable<ClickRecord>,
    payments: EventTable<PaymentRecord>,
    cfg: &EngineConfig,
) -> Result<FeatureTable, EngineError> {
    let started = Instant::now();
    info!(
        component = "engine",
        event = "engine.start",
        impressions = impressions.len(),
        clicks = clicks.len(),
        payments = payments.len(),
        lookback_weeks = cfg.lookback_weeks,
        reporting_window_days = cfg.reporting_window_days,
        shard_count = cfg.shard_count
    );

    let prepared = prepare(&impressions, &clicks, &payments, cfg)?;
    drop(impressions);
    drop(clicks);

    let consolidated = Arc::new(prepared.consolidated);
    let reference = Arc::new(prepared.reference);
    let payments = Arc::new(payments);
    let cfg_shared = Arc::new(cfg.clone());

    let clicked_task = {
        let (consolidated, reference, cfg) = (
            Arc::clone(&consolidated),
            Arc::clone(&reference),
            Arc::clone(&cfg_shared),
        );
        spawn_blocking(move || click_indicator(&consolidated, &reference, &cfg))
    };
    let views_task = {
        let (consolidated, reference, cfg) = (
            Arc::clone(&consolidated),
            Arc::clone(&reference),
            Arc::clone(&cfg_shared),
        );
        spawn_blocking(move || view_count(&consolidated, &reference, &cfg))
    };
    let clicks_task = {
        let (consolidated, reference, cfg) = (
            Arc::clone(&consolidated),
            Arc::clone(&reference),
            Arc::clone(&cfg_shared),
        );
        spawn_blocking(move || click_count(&consolidated, &reference, &cfg))
    };
    let payments_task = {
        let (payments, reference, cfg) = (
            Arc::clone(&payments),
            Arc::clone(&reference),
            Arc::clone(&cfg_shared),
        );
        spawn_blocking(move || cumulative_payments(&payments, &reference, &cfg))
    };

    let (clicked, views, click_counts, payment_sums) =
        tokio::join!(clicked_task, views_task, clicks_task, payments_task);

    // Settle every task before propagating so each failure is logged.
    let clicked = settle(AggregatorKind::ClickIndicator, clicked);
    let views = settle(AggregatorKind::ViewCount, views);
    let click_counts = settle(AggregatorKind::ClickCount, click_counts);
    let payment_sums = settle(AggregatorKind::CumulativePayments, payment_sums);

    let table = assemble(
        &reference,
        &clicked?,
        &views?,
        &click_counts?,
        &payment_sums?,
        cfg,
    );

    info!(
        component = "engine",
        event = "engine.finish",
        feature_rows = table.rows.len(),
        window_start = %table.window_start,
        window_end = %table.window_end,
        elapsed_ms = started.elapsed().as_millis() as u64
    );

    Ok(table)
}

fn settle<V>(
    aggregator: AggregatorKind,
    joined: Result<Result<HashMap<ReferenceKey, V>, EngineError>, JoinError>,
) -> Result<HashMap<ReferenceKey, V>, EngineError> {
    let source = match joined {
        Ok(Ok(values)) => return Ok(values),
        Ok(Err(err)) => err,
        Err(join_err) => EngineError::TaskPanicked {
            aggregator,
            message: join_err.to_string(),
        },
    };

    error!(
        component = "engine",
        event = "engine.aggregator_failed",
        aggregator = aggregator.as_str(),
        error = %source
    );

    Err(EngineError::PartialAggregation {
        aggregator,
        source: Box::new(source),
    })
}
