//! Loading of the raw impression, click and payment files.
//!
//! Impressions and clicks arrive as JSON lines shaped
//! `{"day": .., "user_id": .., "event_data": {"position": .., "value_prop": ..}}`
//! or as flat CSV. Payments arrive as CSV or JSON lines with
//! `pay_date,total,user_id,value_prop`. Rows missing a critical value are
//! dropped; a missing `position` is imputed.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::table::{
    ClickRecord, EventRecord, EventTable, ImpressionRecord, PaymentRecord, Timestamp,
    UNKNOWN_POSITION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputFormat {
    JsonLines,
    Csv,
}

impl InputFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" | "jsonl" => Some(Self::JsonLines),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub input_rows: u64,
    pub dropped_rows: u64,
    pub imputed_rows: u64,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported input format for {path}; expected .json, .jsonl or .csv")]
    UnsupportedFormat { path: PathBuf },
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed JSON in {path} at line {line}: {source}")]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct RawEventData {
    #[serde(default)]
    position: Option<i64>,
    #[serde(default)]
    value_prop: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInteraction {
    #[serde(default)]
    day: Option<String>,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    position: Option<i64>,
    #[serde(default)]
    value_prop: Option<String>,
    #[serde(default)]
    event_data: Option<RawEventData>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPayment {
    #[serde(default)]
    pay_date: Option<String>,
    #[serde(default)]
    total: Option<f64>,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    value_prop: Option<String>,
}

/// Critical fields of an impression or click after flattening `event_data`.
struct CleanInteraction {
    user_id: i64,
    value_prop: String,
    day: Timestamp,
    position: Option<i64>,
}

impl RawInteraction {
    fn clean(self) -> Option<CleanInteraction> {
        let (nested_position, nested_value_prop) = match self.event_data {
            Some(data) => (data.position, data.value_prop),
            None => (None, None),
        };
        let value_prop = nested_value_prop
            .or(self.value_prop)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;

        Some(CleanInteraction {
            user_id: self.user_id?,
            value_prop,
            day: parse_timestamp(self.day.as_deref()?)?,
            position: nested_position.or(self.position),
        })
    }
}

impl RawPayment {
    fn clean(self) -> Option<PaymentRecord> {
        let value_prop = self
            .value_prop
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;
        let total = self.total.filter(|t| t.is_finite())?;

        Some(PaymentRecord {
            user_id: self.user_id?,
            value_prop,
            pay_date: parse_timestamp(self.pay_date.as_deref()?)?,
            total,
        })
    }
}

pub fn load_impressions(
    path: &Path,
) -> Result<(EventTable<ImpressionRecord>, IngestReport), IngestError> {
    load_interactions(path, |clean, position| ImpressionRecord {
        user_id: clean.user_id,
        value_prop: clean.value_prop,
        day: clean.day,
        position,
    })
}

pub fn load_clicks(path: &Path) -> Result<(EventTable<ClickRecord>, IngestReport), IngestError> {
    load_interactions(path, |clean, position| ClickRecord {
        user_id: clean.user_id,
        value_prop: clean.value_prop,
        day: clean.day,
        position,
    })
}

pub fn load_payments(
    path: &Path,
) -> Result<(EventTable<PaymentRecord>, IngestReport), IngestError> {
    let mut report = IngestReport::default();
    let raw: Vec<RawPayment> = read_rows(path, &mut report)?;

    let mut rows = Vec::with_capacity(raw.len());
    for record in raw {
        match record.clean() {
            Some(row) => rows.push(row),
            None => report.dropped_rows += 1,
        }
    }

    log_loaded::<PaymentRecord>(path, &report);
    Ok((EventTable::new(rows), report))
}

fn load_interactions<R, F>(path: &Path, build: F) -> Result<(EventTable<R>, IngestReport), IngestError>
where
    R: EventRecord,
    F: Fn(CleanInteraction, i64) -> R,
{
    let mut report = IngestReport::default();
    let raw: Vec<RawInteraction> = read_rows(path, &mut report)?;

    let mut rows = Vec::with_capacity(raw.len());
    for record in raw {
        let Some(clean) = record.clean() else {
            report.dropped_rows += 1;
            continue;
        };
        let position = match clean.position {
            Some(position) => position,
            None => {
                report.imputed_rows += 1;
                UNKNOWN_POSITION
            }
        };
        rows.push(build(clean, position));
    }

    log_loaded::<R>(path, &report);
    Ok((EventTable::new(rows), report))
}

/// Reads every record of `path`. Records whose values do not fit the raw
/// shape count as dropped; malformed files are errors.
fn read_rows<T: DeserializeOwned>(
    path: &Path,
    report: &mut IngestReport,
) -> Result<Vec<T>, IngestError> {
    let format = InputFormat::from_path(path).ok_or_else(|| IngestError::UnsupportedFormat {
        path: path.to_path_buf(),
    })?;
    let file = File::open(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut out = Vec::new();
    match format {
        InputFormat::Csv => {
            let mut reader = csv::ReaderBuilder::new()
                .trim(csv::Trim::All)
                .from_reader(file);
            for record in reader.deserialize::<T>() {
                report.input_rows += 1;
                match record {
                    Ok(row) => out.push(row),
                    Err(err) if matches!(err.kind(), csv::ErrorKind::Deserialize { .. }) => {
                        report.dropped_rows += 1;
                    }
                    Err(source) => {
                        return Err(IngestError::Csv {
                            path: path.to_path_buf(),
                            source,
                        })
                    }
                }
            }
        }
        InputFormat::JsonLines => {
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|source| IngestError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                report.input_rows += 1;
                match serde_json::from_str::<T>(&line) {
                    Ok(row) => out.push(row),
                    Err(err) if err.is_data() => report.dropped_rows += 1,
                    Err(source) => {
                        return Err(IngestError::Json {
                            path: path.to_path_buf(),
                            line: idx + 1,
                            source,
                        })
                    }
                }
            }
        }
    }

    Ok(out)
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` and `YYYY-MM-DD HH:MM:SS`.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn log_loaded<R: EventRecord>(path: &Path, report: &IngestReport) {
    if report.dropped_rows > 0 {
        warn!(
            component = "ingest",
            event = "ingest.rows_dropped",
            table = R::TABLE,
            path = %path.display(),
            dropped_rows = report.dropped_rows
        );
    }
    info!(
        component = "ingest",
        event = "ingest.finish",
        table = R::TABLE,
        path = %path.display(),
        input_rows = report.input_rows,
        dropped_rows = report.dropped_rows,
        imputed_rows = report.imputed_rows
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).expect("file should be created");
        file.write_all(body.as_bytes()).expect("file should be written");
        path
    }

    #[test]
    fn parse_timestamp_accepts_dates_and_datetimes() {
        let midnight = parse_timestamp("2020-11-01").expect("date parses");
        assert_eq!(midnight.to_string(), "2020-11-01 00:00:00");
        assert!(parse_timestamp("2020-11-01T10:30:00").is_some());
        assert!(parse_timestamp(" 2020-11-01 10:30:00 ").is_some());
        assert!(parse_timestamp("01/11/2020").is_none());
    }

    #[test]
    fn nested_event_data_is_flattened_and_position_imputed() {
        let dir = tempdir().expect("temp dir");
        let path = write_file(
            dir.path(),
            "prints.json",
            concat!(
                r#"{"day":"2020-11-01","event_data":{"position":0,"value_prop":"cellphone_recharge"},"user_id":98702}"#,
                "\n",
                r#"{"day":"2020-11-02","event_data":{"value_prop":"prepaid"},"user_id":63252}"#,
                "\n\n",
                r#"{"day":"2020-11-03","event_data":{"position":2},"user_id":1}"#,
                "\n",
                r#"{"day":"not a date","event_data":{"position":2,"value_prop":"x"},"user_id":1}"#,
                "\n",
            ),
        );

        let (table, report) = load_impressions(&path).expect("impressions load");

        assert_eq!(report.input_rows, 4);
        assert_eq!(report.dropped_rows, 2);
        assert_eq!(report.imputed_rows, 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0].value_prop, "cellphone_recharge");
        assert_eq!(table.rows()[0].position, 0);
        assert_eq!(table.rows()[1].position, UNKNOWN_POSITION);
    }

    #[test]
    fn payments_csv_drops_rows_with_missing_critical_values() {
        let dir = tempdir().expect("temp dir");
        let path = write_file(
            dir.path(),
            "pays.csv",
            "pay_date,total,user_id,value_prop\n\
             2020-11-01,7.04,35387,link_cobro\n\
             2020-11-01,,35387,link_cobro\n\
             2020-11-02,37.36,abc,transport\n\
             2020-11-03,12.0,1,prepaid\n",
        );

        let (table, report) = load_payments(&path).expect("payments load");

        assert_eq!(report.input_rows, 4);
        assert_eq!(report.dropped_rows, 2);
        assert_eq!(table.len(), 2);
        assert!((table.rows()[0].total - 7.04).abs() < 1e-9);
        assert_eq!(table.rows()[1].user_id, 1);
    }

    #[test]
    fn flat_csv_clicks_are_supported() {
        let dir = tempdir().expect("temp dir");
        let path = write_file(
            dir.path(),
            "taps.csv",
            "day,user_id,position,value_prop\n2020-11-01,1,3,prepaid\n",
        );

        let (table, report) = load_clicks(&path).expect("clicks load");
        assert_eq!(report.dropped_rows, 0);
        assert_eq!(table.rows()[0].position, 3);
        assert_eq!(table.rows()[0].value_prop, "prepaid");
    }

    #[test]
    fn malformed_json_and_unknown_extensions_are_errors() {
        let dir = tempdir().expect("temp dir");
        let bad = write_file(dir.path(), "taps.json", "{\"day\": \n");
        assert!(matches!(
            load_clicks(&bad),
            Err(IngestError::Json { line: 1, .. })
        ));

        let unknown = write_file(dir.path(), "taps.parquet", "");
        assert!(matches!(
            load_clicks(&unknown),
            Err(IngestError::UnsupportedFormat { .. })
        ));
    }
}
