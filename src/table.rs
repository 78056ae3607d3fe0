//! Immutable event tables and the record types flowing between stages.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub type Timestamp = NaiveDateTime;

pub const USER_ID_COLUMN: &str = "user_id";
pub const VALUE_PROP_COLUMN: &str = "value_prop";
pub const DAY_COLUMN: &str = "day";
pub const POSITION_COLUMN: &str = "position";
pub const CLICK_DAY_COLUMN: &str = "click_day";
pub const CLICK_POSITION_COLUMN: &str = "click_position";
pub const PAY_DATE_COLUMN: &str = "pay_date";
pub const TOTAL_COLUMN: &str = "total";

/// Sentinel used for a missing, non-critical `position`.
pub const UNKNOWN_POSITION: i64 = -1;

/// A single row of one raw stream.
pub trait EventRecord {
    /// Table name used in schema errors and logs.
    const TABLE: &'static str;
    /// Column holding the event timestamp.
    const TIME_COLUMN: &'static str;
    const COLUMNS: &'static [&'static str];

    fn user_id(&self) -> i64;
    fn value_prop(&self) -> &str;
    fn event_time(&self) -> Timestamp;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpressionRecord {
    pub user_id: i64,
    pub value_prop: String,
    pub day: Timestamp,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickRecord {
    pub user_id: i64,
    pub value_prop: String,
    pub day: Timestamp,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub user_id: i64,
    pub value_prop: String,
    pub pay_date: Timestamp,
    pub total: f64,
}

impl EventRecord for ImpressionRecord {
    const TABLE: &'static str = "impressions";
    const TIME_COLUMN: &'static str = DAY_COLUMN;
    const COLUMNS: &'static [&'static str] =
        &[USER_ID_COLUMN, VALUE_PROP_COLUMN, DAY_COLUMN, POSITION_COLUMN];

    fn user_id(&self) -> i64 {
        self.user_id
    }

    fn value_prop(&self) -> &str {
        &self.value_prop
    }

    fn event_time(&self) -> Timestamp {
        self.day
    }
}

impl EventRecord for ClickRecord {
    const TABLE: &'static str = "clicks";
    const TIME_COLUMN: &'static str = DAY_COLUMN;
    const COLUMNS: &'static [&'static str] =
        &[USER_ID_COLUMN, VALUE_PROP_COLUMN, DAY_COLUMN, POSITION_COLUMN];

    fn user_id(&self) -> i64 {
        self.user_id
    }

    fn value_prop(&self) -> &str {
        &self.value_prop
    }

    fn event_time(&self) -> Timestamp {
        self.day
    }
}

impl EventRecord for PaymentRecord {
    const TABLE: &'static str = "payments";
    const TIME_COLUMN: &'static str = PAY_DATE_COLUMN;
    const COLUMNS: &'static [&'static str] =
        &[USER_ID_COLUMN, VALUE_PROP_COLUMN, PAY_DATE_COLUMN, TOTAL_COLUMN];

    fn user_id(&self) -> i64 {
        self.user_id
    }

    fn value_prop(&self) -> &str {
        &self.value_prop
    }

    fn event_time(&self) -> Timestamp {
        self.pay_date
    }
}

/// Typed rows of one stream plus the column names the producer declared.
///
/// Rows are never mutated after construction; every stage builds a new table.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTable<R> {
    columns: Vec<String>,
    rows: Vec<R>,
}

impl<R: EventRecord> EventTable<R> {
    pub fn new(rows: Vec<R>) -> Self {
        Self {
            columns: R::COLUMNS.iter().map(|c| (*c).to_string()).collect(),
            rows,
        }
    }

    /// Builds a table whose producer exposes a different column set, e.g. after
    /// renaming the join keys upstream.
    pub fn with_columns(columns: Vec<String>, rows: Vec<R>) -> Self {
        Self { columns, rows }
    }

    pub fn table_name(&self) -> &'static str {
        R::TABLE
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn require_columns(&self, required: &[&str]) -> Result<(), EngineError> {
        require_columns(R::TABLE, &self.columns, required)
    }
}

/// One impression combined with at most one click and one payment of the same
/// `(user_id, value_prop)`. Source row ids let consumers count events rather
/// than fan-out rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRecord {
    pub impression_id: usize,
    pub user_id: i64,
    pub value_prop: String,
    pub day: Timestamp,
    pub position: i64,
    pub click_id: Option<usize>,
    pub click_day: Option<Timestamp>,
    pub click_position: Option<i64>,
    pub payment_id: Option<usize>,
    pub pay_date: Option<Timestamp>,
    pub total: Option<f64>,
}

impl ConsolidatedRecord {
    pub fn has_click(&self) -> bool {
        self.click_day.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedTable {
    columns: Vec<String>,
    rows: Vec<ConsolidatedRecord>,
}

impl ConsolidatedTable {
    pub const TABLE: &'static str = "consolidated";

    pub fn new(columns: Vec<String>, rows: Vec<ConsolidatedRecord>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[ConsolidatedRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn require_columns(&self, required: &[&str]) -> Result<(), EngineError> {
        require_columns(Self::TABLE, &self.columns, required)
    }
}

/// Grain of every output feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceKey {
    pub user_id: i64,
    pub value_prop: String,
    pub day: Timestamp,
}

impl ReferenceKey {
    pub fn new(user_id: i64, value_prop: impl Into<String>, day: Timestamp) -> Self {
        Self {
            user_id,
            value_prop: value_prop.into(),
            day,
        }
    }
}

pub(crate) fn require_columns(
    table: &'static str,
    columns: &[String],
    required: &[&str],
) -> Result<(), EngineError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|name| !columns.iter().any(|c| c == *name))
        .map(|name| (*name).to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Schema { table, missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(day: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2020, 11, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid test date")
    }

    #[test]
    fn default_columns_follow_record_schema() {
        let table = EventTable::new(vec![PaymentRecord {
            user_id: 1,
            value_prop: "prepaid".to_string(),
            pay_date: ts(1),
            total: 10.0,
        }]);

        assert_eq!(table.columns(), ["user_id", "value_prop", "pay_date", "total"]);
        assert!(table.require_columns(&["pay_date", "user_id"]).is_ok());
    }

    #[test]
    fn require_columns_names_every_missing_column() {
        let table: EventTable<ClickRecord> =
            EventTable::with_columns(vec!["uid".to_string(), "day".to_string()], Vec::new());

        let err = table
            .require_columns(&["user_id", "value_prop", "day"])
            .expect_err("columns are missing");
        match err {
            EngineError::Schema { table, missing } => {
                assert_eq!(table, "clicks");
                assert_eq!(missing, vec!["user_id", "value_prop"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reference_keys_order_by_user_then_value_prop_then_day() {
        let mut keys = [
            ReferenceKey::new(2, "a", ts(1)),
            ReferenceKey::new(1, "b", ts(1)),
            ReferenceKey::new(1, "a", ts(3)),
            ReferenceKey::new(1, "a", ts(2)),
        ];
        keys.sort();
        assert_eq!(keys[0], ReferenceKey::new(1, "a", ts(2)));
        assert_eq!(keys[1], ReferenceKey::new(1, "a", ts(3)));
        assert_eq!(keys[2], ReferenceKey::new(1, "b", ts(1)));
        assert_eq!(keys[3], ReferenceKey::new(2, "a", ts(1)));
    }
}
