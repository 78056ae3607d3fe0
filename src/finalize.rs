//! Output-facing cleanup of an assembled feature table.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::assemble::{
    FeatureTable, CLICKED_COLUMN, CLICK_COUNT_COLUMN, CUMULATIVE_PAYMENT_COLUMN,
    VIEW_COUNT_COLUMN,
};
use crate::table::{Timestamp, CLICK_DAY_COLUMN, DAY_COLUMN, TOTAL_COLUMN};

pub const LAST_PAYMENT_COLUMN: &str = "last_payment_amount";
pub const TOTAL_PAYMENT_COLUMN: &str = "total_payment_amount";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(Timestamp),
    Bool(bool),
    Missing,
}

impl Cell {
    fn is_zero(&self) -> bool {
        match self {
            Self::Int(v) => *v == 0,
            Self::Float(v) => *v == 0.0,
            Self::Bool(v) => !*v,
            Self::Missing => true,
            Self::Text(_) | Self::Timestamp(_) => false,
        }
    }
}

/// Column-named rows ready for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl ExportTable {
    pub fn from_features(table: &FeatureTable) -> Self {
        let columns = table
            .schema
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let rows = table
            .rows
            .iter()
            .map(|row| {
                vec![
                    Cell::Int(row.key.user_id),
                    Cell::Text(row.key.value_prop.clone()),
                    Cell::Timestamp(row.key.day),
                    Cell::Bool(row.clicked),
                    Cell::Int(row.view_count as i64),
                    Cell::Int(row.click_count as i64),
                    Cell::Float(row.cumulative_payment_amount),
                ]
            })
            .collect();
        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<&Cell>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    fn drop_column(&mut self, idx: usize) {
        self.columns.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeConfig {
    /// `(kept, candidate)` timestamp columns; the candidate is dropped when
    /// pointwise identical to the kept one.
    pub redundant_timestamps: Vec<(String, String)>,
    pub renames: Vec<(String, String)>,
    pub click_column: String,
    pub payment_column: String,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            redundant_timestamps: vec![(DAY_COLUMN.to_string(), CLICK_DAY_COLUMN.to_string())],
            renames: vec![
                (TOTAL_COLUMN.to_string(), LAST_PAYMENT_COLUMN.to_string()),
                (
                    CUMULATIVE_PAYMENT_COLUMN.to_string(),
                    TOTAL_PAYMENT_COLUMN.to_string(),
                ),
            ],
            click_column: CLICKED_COLUMN.to_string(),
            payment_column: TOTAL_PAYMENT_COLUMN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReport {
    pub input_rows: usize,
    pub dropped_rows: usize,
    pub collapsed_columns: Vec<String>,
    pub renamed_columns: Vec<(String, String)>,
}

/// Applies the output cleanup steps in order. Must only run on a fully
/// assembled table: the last step drops rows.
pub fn finalize(mut table: ExportTable, cfg: &FinalizeConfig) -> (ExportTable, FinalizeReport) {
    let mut report = FinalizeReport {
        input_rows: table.rows.len(),
        ..FinalizeReport::default()
    };

    report.renamed_columns = rename_columns(&mut table, &cfg.renames);
    report.collapsed_columns = collapse_redundant_timestamps(&mut table, &cfg.redundant_timestamps);
    encode_flag(&mut table, &cfg.click_column);
    fill_missing(&mut table);
    report.dropped_rows = drop_irrelevant_rows(&mut table, &cfg.payment_column, &cfg.click_column);

    info!(
        component = "finalize",
        event = "finalize.finish",
        input_rows = report.input_rows,
        output_rows = table.rows.len(),
        dropped_rows = report.dropped_rows,
        collapsed_columns = ?report.collapsed_columns,
        renamed_columns = report.renamed_columns.len()
    );

    (table, report)
}

fn rename_columns(table: &mut ExportTable, renames: &[(String, String)]) -> Vec<(String, String)> {
    let mut applied = Vec::new();
    for (from, to) in renames {
        if let Some(idx) = table.column_index(from) {
            table.columns[idx] = to.clone();
            applied.push((from.clone(), to.clone()));
        }
    }
    applied
}

fn collapse_redundant_timestamps(table: &mut ExportTable, pairs: &[(String, String)]) -> Vec<String> {
    let mut collapsed = Vec::new();
    for (kept, candidate) in pairs {
        let (Some(kept_idx), Some(candidate_idx)) =
            (table.column_index(kept), table.column_index(candidate))
        else {
            continue;
        };
        let identical = table
            .rows
            .iter()
            .all(|row| row[kept_idx] == row[candidate_idx]);
        if identical {
            table.drop_column(candidate_idx);
            collapsed.push(candidate.clone());
        }
    }
    collapsed
}

fn encode_flag(table: &mut ExportTable, column: &str) {
    let Some(idx) = table.column_index(column) else {
        warn!(
            component = "finalize",
            event = "finalize.column_missing",
            column
        );
        return;
    };
    for row in &mut table.rows {
        let encoded = match row[idx] {
            Cell::Bool(flag) => Cell::Int(i64::from(flag)),
            _ => continue,
        };
        row[idx] = encoded;
    }
}

fn fill_missing(table: &mut ExportTable) {
    for row in &mut table.rows {
        for cell in row.iter_mut() {
            if matches!(cell, Cell::Missing) {
                *cell = Cell::Int(0);
            }
        }
    }
}

/// Drops rows with neither a click nor a payment signal. Skipped with a
/// warning when either column is absent.
fn drop_irrelevant_rows(table: &mut ExportTable, payment_column: &str, click_column: &str) -> usize {
    let (Some(payment_idx), Some(click_idx)) = (
        table.column_index(payment_column),
        table.column_index(click_column),
    ) else {
        warn!(
            component = "finalize",
            event = "finalize.filter_skipped",
            payment_column,
            click_column
        );
        return 0;
    };

    let before = table.rows.len();
    table
        .rows
        .retain(|row| !(row[payment_idx].is_zero() && row[click_idx].is_zero()));
    before - table.rows.len()
}

/// Column names an export of a finalized default feature table carries.
pub fn finalized_columns(user_id_column: &str, value_prop_column: &str) -> Vec<String> {
    vec![
        user_id_column.to_string(),
        value_prop_column.to_string(),
        DAY_COLUMN.to_string(),
        CLICKED_COLUMN.to_string(),
        VIEW_COUNT_COLUMN.to_string(),
        CLICK_COUNT_COLUMN.to_string(),
        TOTAL_PAYMENT_COLUMN.to_string(),
    ]
}
