//! The four per-reference-key aggregators.
//!
//! Each aggregator is a pure function of read-only inputs. Inside an
//! aggregator the source rows are split into shards; shard-local partials are
//! merged per key before anything is returned.

use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;

use chrono::Duration as ChronoDuration;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{AggregatorKind, EngineError};
use crate::shard::{merge_partials, shard_len};
use crate::table::{
    ConsolidatedRecord, ConsolidatedTable, EventTable, PaymentRecord, ReferenceKey, Timestamp,
    CLICK_DAY_COLUMN, DAY_COLUMN, PAY_DATE_COLUMN, TOTAL_COLUMN,
};
use crate::window::ReferenceSet;

type BorrowedKey<'a> = (i64, &'a str, Timestamp);

/// Reference days grouped by `(user_id, value_prop)`, ascending.
struct ReferenceIndex<'a> {
    days: HashMap<(i64, &'a str), Vec<Timestamp>>,
}

impl<'a> ReferenceIndex<'a> {
    fn build(reference: &'a ReferenceSet) -> Self {
        let mut days: HashMap<(i64, &'a str), Vec<Timestamp>> = HashMap::new();
        for key in &reference.keys {
            days.entry((key.user_id, key.value_prop.as_str()))
                .or_default()
                .push(key.day);
        }
        for group in days.values_mut() {
            group.sort();
        }
        Self { days }
    }

    fn contains_pair(&self, user_id: i64, value_prop: &str) -> bool {
        self.days.contains_key(&(user_id, value_prop))
    }

    /// Reference days `d` with `d - lookback <= at < d`.
    fn days_after<'b>(
        &'b self,
        user_id: i64,
        value_prop: &'b str,
        at: Timestamp,
        lookback: ChronoDuration,
    ) -> &'b [Timestamp] {
        let Some(days) = self.days.get(&(user_id, value_prop)) else {
            return &[];
        };
        let horizon = at + lookback;
        let lo = days.partition_point(|d| *d <= at);
        let hi = days.partition_point(|d| *d <= horizon);
        &days[lo..hi.max(lo)]
    }
}

/// One source event after candidate filtering.
#[derive(Debug, Clone, Copy)]
struct WindowedEvent<'a> {
    user_id: i64,
    value_prop: &'a str,
    at: Timestamp,
    amount: f64,
}

/// Whether any consolidated row for the exact `(user_id, value_prop, day)` of a
/// reference key carries a click. Emits every reference key.
pub fn click_indicator(
    consolidated: &ConsolidatedTable,
    reference: &ReferenceSet,
    cfg: &EngineConfig,
) -> Result<HashMap<ReferenceKey, bool>, EngineError> {
    let [user_id_col, value_prop_col] = cfg.join_keys.as_columns();
    consolidated.require_columns(&[user_id_col, value_prop_col, DAY_COLUMN, CLICK_DAY_COLUMN])?;

    let chunk = shard_len(consolidated.len(), cfg.shard_count);
    let partials: Vec<HashSet<BorrowedKey<'_>>> = consolidated
        .rows()
        .par_chunks(chunk)
        .map(|rows| {
            rows.iter()
                .filter(|row| row.has_click() && row.day >= reference.window_start)
                .map(|row| (row.user_id, row.value_prop.as_str(), row.day))
                .collect()
        })
        .collect();

    let mut clicked: HashSet<BorrowedKey<'_>> = HashSet::new();
    for partial in partials {
        clicked.extend(partial);
    }

    let out: HashMap<ReferenceKey, bool> = reference
        .keys
        .iter()
        .map(|key| {
            let hit = clicked.contains(&(key.user_id, key.value_prop.as_str(), key.day));
            (key.clone(), hit)
        })
        .collect();

    log_finish(AggregatorKind::ClickIndicator, out.len());
    Ok(out)
}

/// Distinct prior impressions of the same `(user_id, value_prop)` dated in
/// `[window_end - L, d)`. Keys without a match are omitted.
pub fn view_count(
    consolidated: &ConsolidatedTable,
    reference: &ReferenceSet,
    cfg: &EngineConfig,
) -> Result<HashMap<ReferenceKey, u64>, EngineError> {
    let [user_id_col, value_prop_col] = cfg.join_keys.as_columns();
    consolidated.require_columns(&[user_id_col, value_prop_col, DAY_COLUMN])?;

    let index = ReferenceIndex::build(reference);
    let (lower, upper) = trailing_bounds(reference, cfg);
    let events = distinct_events(consolidated.rows(), cfg.shard_count, |row| {
        (row.day >= lower && row.day <= upper && index.contains_pair(row.user_id, &row.value_prop))
            .then(|| {
                (
                    row.impression_id,
                    WindowedEvent {
                        user_id: row.user_id,
                        value_prop: row.value_prop.as_str(),
                        at: row.day,
                        amount: 0.0,
                    },
                )
            })
    });

    let out = windowed_tally(&events, &index, cfg, |_| 1u64);
    log_finish(AggregatorKind::ViewCount, out.len());
    Ok(out)
}

/// Distinct prior clicks of the same `(user_id, value_prop)` with click day in
/// `[window_end - L, d)`. Keys without a match are omitted.
pub fn click_count(
    consolidated: &ConsolidatedTable,
    reference: &ReferenceSet,
    cfg: &EngineConfig,
) -> Result<HashMap<ReferenceKey, u64>, EngineError> {
    let [user_id_col, value_prop_col] = cfg.join_keys.as_columns();
    consolidated.require_columns(&[user_id_col, value_prop_col, DAY_COLUMN, CLICK_DAY_COLUMN])?;

    let index = ReferenceIndex::build(reference);
    let (lower, upper) = trailing_bounds(reference, cfg);
    let events = distinct_events(consolidated.rows(), cfg.shard_count, |row| {
        let (click_id, click_day) = (row.click_id?, row.click_day?);
        (click_day >= lower
            && click_day <= upper
            && index.contains_pair(row.user_id, &row.value_prop))
        .then(|| {
            (
                click_id,
                WindowedEvent {
                    user_id: row.user_id,
                    value_prop: row.value_prop.as_str(),
                    at: click_day,
                    amount: 0.0,
                },
            )
        })
    });

    let out = windowed_tally(&events, &index, cfg, |_| 1u64);
    log_finish(AggregatorKind::ClickCount, out.len());
    Ok(out)
}

/// Sum of payment totals with `d - L <= pay_date < d`, read from the raw
/// payment stream. Keys without a qualifying payment are omitted.
pub fn cumulative_payments(
    payments: &EventTable<PaymentRecord>,
    reference: &ReferenceSet,
    cfg: &EngineConfig,
) -> Result<HashMap<ReferenceKey, f64>, EngineError> {
    let [user_id_col, value_prop_col] = cfg.join_keys.as_columns();
    payments.require_columns(&[user_id_col, value_prop_col, PAY_DATE_COLUMN, TOTAL_COLUMN])?;

    let index = ReferenceIndex::build(reference);
    let events: Vec<WindowedEvent<'_>> = payments
        .rows()
        .iter()
        .filter(|p| index.contains_pair(p.user_id, &p.value_prop))
        .map(|p| WindowedEvent {
            user_id: p.user_id,
            value_prop: p.value_prop.as_str(),
            at: p.pay_date,
            amount: p.total,
        })
        .collect();

    let out = windowed_tally(&events, &index, cfg, |event| event.amount);
    log_finish(AggregatorKind::CumulativePayments, out.len());
    Ok(out)
}

/// Global trailing range `[window_end - L, window_end]` for prior views and
/// clicks. Combined with the per-key test `e < d`, every key counts events in
/// `[window_end - L, d)`; payments skip this range and use `[d - L, d)`.
fn trailing_bounds(reference: &ReferenceSet, cfg: &EngineConfig) -> (Timestamp, Timestamp) {
    (reference.window_end - cfg.lookback(), reference.window_end)
}

/// Collapses join fan-out back to one entry per source event id.
fn distinct_events<'a, F>(
    rows: &'a [ConsolidatedRecord],
    shard_count: usize,
    select: F,
) -> Vec<WindowedEvent<'a>>
where
    F: Fn(&'a ConsolidatedRecord) -> Option<(usize, WindowedEvent<'a>)> + Sync,
{
    let chunk = shard_len(rows.len(), shard_count);
    let partials: Vec<HashMap<usize, WindowedEvent<'a>>> = rows
        .par_chunks(chunk)
        .map(|shard| shard.iter().filter_map(&select).collect())
        .collect();

    let mut by_id: HashMap<usize, WindowedEvent<'a>> = HashMap::new();
    for partial in partials {
        by_id.extend(partial);
    }

    let mut events: Vec<(usize, WindowedEvent<'a>)> = by_id.into_iter().collect();
    events.sort_by_key(|(id, _)| *id);
    debug!(
        component = "aggregate",
        event = "aggregate.distinct_events",
        source_rows = rows.len(),
        distinct_events = events.len()
    );
    events.into_iter().map(|(_, event)| event).collect()
}

/// Assigns every event to the reference keys whose lookback holds it and
/// reduces `weight` per key, shard by shard.
fn windowed_tally<V, W>(
    events: &[WindowedEvent<'_>],
    index: &ReferenceIndex<'_>,
    cfg: &EngineConfig,
    weight: W,
) -> HashMap<ReferenceKey, V>
where
    V: AddAssign + Default + Send,
    W: Fn(&WindowedEvent<'_>) -> V + Sync,
{
    let lookback = cfg.lookback();
    let chunk = shard_len(events.len(), cfg.shard_count);
    let partials: Vec<HashMap<BorrowedKey<'_>, V>> = events
        .par_chunks(chunk)
        .map(|shard| {
            let mut local: HashMap<BorrowedKey<'_>, V> = HashMap::new();
            for event in shard {
                for day in index.days_after(event.user_id, event.value_prop, event.at, lookback) {
                    *local
                        .entry((event.user_id, event.value_prop, *day))
                        .or_default() += weight(event);
                }
            }
            local
        })
        .collect();

    merge_partials(partials)
        .into_iter()
        .map(|((user_id, value_prop, day), value)| {
            (ReferenceKey::new(user_id, value_prop, day), value)
        })
        .collect()
}

fn log_finish(aggregator: AggregatorKind, keys: usize) {
    info!(
        component = "aggregate",
        event = "aggregate.finish",
        aggregator = aggregator.as_str(),
        keys
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::join_streams;
    use crate::table::{ClickRecord, ImpressionRecord};
    use crate::window::select_window;
    use chrono::NaiveDate;

    fn ts(month: u32, day: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2020, month, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid test date")
    }

    fn impression(user_id: i64, value_prop: &str, day: Timestamp) -> ImpressionRecord {
        ImpressionRecord {
            user_id,
            value_prop: value_prop.to_string(),
            day,
            position: 0,
        }
    }

    fn click(user_id: i64, value_prop: &str, day: Timestamp) -> ClickRecord {
        ClickRecord {
            user_id,
            value_prop: value_prop.to_string(),
            day,
            position: 0,
        }
    }

    fn payment(user_id: i64, value_prop: &str, pay_date: Timestamp, total: f64) -> PaymentRecord {
        PaymentRecord {
            user_id,
            value_prop: value_prop.to_string(),
            pay_date,
            total,
        }
    }

    struct Fixture {
        consolidated: ConsolidatedTable,
        payments: EventTable<PaymentRecord>,
        reference: ReferenceSet,
    }

    fn fixture(
        impressions: Vec<ImpressionRecord>,
        clicks: Vec<ClickRecord>,
        payments: Vec<PaymentRecord>,
        cfg: &EngineConfig,
    ) -> Fixture {
        let impressions = EventTable::new(impressions);
        let clicks = EventTable::new(clicks);
        let payments = EventTable::new(payments);
        let consolidated =
            join_streams(&impressions, &clicks, &payments, cfg).expect("join succeeds");
        let reference = select_window(&impressions, cfg).expect("window selected");
        Fixture {
            consolidated,
            payments,
            reference,
        }
    }

    #[test]
    fn click_indicator_matches_on_exact_impression_day() {
        let cfg = EngineConfig::default();
        let f = fixture(
            vec![impression(1, "a", ts(11, 30)), impression(2, "a", ts(11, 30))],
            vec![click(1, "a", ts(11, 30))],
            Vec::new(),
            &cfg,
        );

        let out = click_indicator(&f.consolidated, &f.reference, &cfg).expect("aggregates");
        assert_eq!(out.len(), f.reference.len());
        assert!(out[&ReferenceKey::new(1, "a", ts(11, 30))]);
        assert!(!out[&ReferenceKey::new(2, "a", ts(11, 30))]);
    }

    #[test]
    fn view_count_ignores_payment_fan_out() {
        let cfg = EngineConfig::default();
        let f = fixture(
            vec![
                impression(1, "a", ts(11, 20)),
                impression(1, "a", ts(11, 25)),
                impression(1, "a", ts(11, 30)),
            ],
            vec![click(1, "a", ts(11, 1)), click(1, "a", ts(11, 2))],
            vec![
                payment(1, "a", ts(11, 3), 1.0),
                payment(1, "a", ts(11, 4), 1.0),
                payment(1, "a", ts(11, 5), 1.0),
            ],
            &cfg,
        );
        assert_eq!(f.consolidated.len(), 18);

        let out = view_count(&f.consolidated, &f.reference, &cfg).expect("aggregates");
        assert_eq!(out[&ReferenceKey::new(1, "a", ts(11, 30))], 2);
        assert_eq!(out[&ReferenceKey::new(1, "a", ts(11, 25))], 1);
    }

    #[test]
    fn view_count_omits_keys_without_prior_impressions() {
        let cfg = EngineConfig::default();
        let f = fixture(vec![impression(1, "a", ts(11, 30))], Vec::new(), Vec::new(), &cfg);

        let out = view_count(&f.consolidated, &f.reference, &cfg).expect("aggregates");
        assert!(out.is_empty());
    }

    #[test]
    fn views_and_clicks_are_bounded_by_the_global_trailing_range() {
        let cfg = EngineConfig::default();
        // window_end is 11-30, so views and clicks before 11-09 never count,
        // even for the 11-23 key whose own lookback starts at 11-02.
        let f = fixture(
            vec![
                impression(1, "a", ts(11, 2)),
                impression(1, "a", ts(11, 10)),
                impression(1, "a", ts(11, 23)),
                impression(1, "a", ts(11, 30)),
            ],
            vec![click(1, "a", ts(11, 3)), click(1, "a", ts(11, 12))],
            vec![payment(1, "a", ts(11, 3), 4.0), payment(1, "a", ts(11, 12), 1.5)],
            &cfg,
        );
        let early = ReferenceKey::new(1, "a", ts(11, 23));
        let late = ReferenceKey::new(1, "a", ts(11, 30));

        let views = view_count(&f.consolidated, &f.reference, &cfg).expect("aggregates");
        assert_eq!(views[&early], 1);
        assert_eq!(views[&late], 2);

        let clicks = click_count(&f.consolidated, &f.reference, &cfg).expect("aggregates");
        assert_eq!(clicks[&early], 1);
        assert_eq!(clicks[&late], 1);

        let sums = cumulative_payments(&f.payments, &f.reference, &cfg).expect("aggregates");
        assert_eq!(sums[&early], 5.5);
        assert_eq!(sums[&late], 1.5);
    }

    #[test]
    fn early_reference_day_ignores_events_before_the_trailing_range() {
        let cfg = EngineConfig::default();
        let f = fixture(
            vec![
                impression(1, "a", ts(11, 2)),
                impression(1, "a", ts(11, 23)),
                impression(1, "a", ts(11, 30)),
            ],
            vec![click(1, "a", ts(11, 3))],
            Vec::new(),
            &cfg,
        );
        let early = ReferenceKey::new(1, "a", ts(11, 23));

        let views = view_count(&f.consolidated, &f.reference, &cfg).expect("aggregates");
        let clicks = click_count(&f.consolidated, &f.reference, &cfg).expect("aggregates");
        assert!(!views.contains_key(&early));
        assert!(!clicks.contains_key(&early));
        assert_eq!(views[&ReferenceKey::new(1, "a", ts(11, 30))], 1);
    }

    #[test]
    fn click_count_uses_click_day_with_strict_upper_bound() {
        let cfg = EngineConfig::default();
        let f = fixture(
            vec![impression(1, "a", ts(11, 30))],
            vec![
                click(1, "a", ts(11, 8)),
                click(1, "a", ts(11, 10)),
                click(1, "a", ts(11, 29)),
                click(1, "a", ts(11, 30)),
                click(2, "a", ts(11, 29)),
            ],
            Vec::new(),
            &cfg,
        );

        let out = click_count(&f.consolidated, &f.reference, &cfg).expect("aggregates");
        assert_eq!(out.len(), 1);
        assert_eq!(out[&ReferenceKey::new(1, "a", ts(11, 30))], 2);
    }

    #[test]
    fn cumulative_payments_sum_inside_lookback_only() {
        let cfg = EngineConfig::default();
        let f = fixture(
            vec![impression(1, "a", ts(11, 30))],
            Vec::new(),
            vec![
                payment(1, "a", ts(11, 8), 1000.0),
                payment(1, "a", ts(11, 9), 10.0),
                payment(1, "a", ts(11, 25), 2.5),
                payment(1, "a", ts(11, 30), 99.0),
                payment(1, "b", ts(11, 25), 7.0),
            ],
            &cfg,
        );

        let out = cumulative_payments(&f.payments, &f.reference, &cfg).expect("aggregates");
        assert_eq!(out.len(), 1);
        assert!((out[&ReferenceKey::new(1, "a", ts(11, 30))] - 12.5).abs() < 1e-9);
    }

    #[test]
    fn sharding_does_not_change_results() {
        let impressions: Vec<ImpressionRecord> = (1..=30)
            .flat_map(|d| [impression(1, "a", ts(11, d)), impression(2, "b", ts(11, d))])
            .collect();
        let clicks: Vec<ClickRecord> = (1..=30)
            .step_by(3)
            .map(|d| click(1, "a", ts(11, d)))
            .collect();
        let payments: Vec<PaymentRecord> = (1..=30)
            .step_by(2)
            .map(|d| payment(2, "b", ts(11, d), f64::from(d)))
            .collect();

        let single = EngineConfig {
            shard_count: 1,
            ..EngineConfig::default()
        };
        let many = EngineConfig {
            shard_count: 7,
            ..EngineConfig::default()
        };
        let a = fixture(impressions.clone(), clicks.clone(), payments.clone(), &single);
        let b = fixture(impressions, clicks, payments, &many);

        assert_eq!(
            view_count(&a.consolidated, &a.reference, &single).expect("aggregates"),
            view_count(&b.consolidated, &b.reference, &many).expect("aggregates")
        );
        assert_eq!(
            click_count(&a.consolidated, &a.reference, &single).expect("aggregates"),
            click_count(&b.consolidated, &b.reference, &many).expect("aggregates")
        );
        let sums_a = cumulative_payments(&a.payments, &a.reference, &single).expect("aggregates");
        let sums_b = cumulative_payments(&b.payments, &b.reference, &many).expect("aggregates");
        assert_eq!(sums_a.len(), sums_b.len());
        for (key, value) in &sums_a {
            assert!((value - sums_b[key]).abs() < 1e-9);
        }
    }

    #[test]
    fn payments_without_total_column_fail_validation() {
        let cfg = EngineConfig::default();
        let f = fixture(vec![impression(1, "a", ts(11, 30))], Vec::new(), Vec::new(), &cfg);
        let payments: EventTable<PaymentRecord> = EventTable::with_columns(
            vec![
                "user_id".to_string(),
                "value_prop".to_string(),
                "pay_date".to_string(),
            ],
            Vec::new(),
        );

        let err = cumulative_payments(&payments, &f.reference, &cfg).expect_err("must fail");
        assert!(matches!(err, EngineError::Schema { table: "payments", .. }));
    }
}
