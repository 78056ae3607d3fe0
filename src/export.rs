//! Serialization of finalized tables to CSV or JSON lines.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::finalize::{Cell, ExportTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    Csv,
    JsonLines,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "json" | "jsonl" => Some(Self::JsonLines),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::JsonLines => "jsonl",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid output path: {0}")]
    InvalidPath(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("row {row} has {found} cells, expected {expected}")]
    RowWidth {
        row: usize,
        found: usize,
        expected: usize,
    },
}

/// Writes `table` to `path`, replacing any previous file only once the new
/// contents are fully written.
pub fn export_table(
    table: &ExportTable,
    path: &Path,
    format: ExportFormat,
) -> Result<(), ExportError> {
    for (row, cells) in table.rows.iter().enumerate() {
        if cells.len() != table.columns.len() {
            return Err(ExportError::RowWidth {
                row,
                found: cells.len(),
                expected: table.columns.len(),
            });
        }
    }

    let bytes = match format {
        ExportFormat::Csv => render_csv(table)?,
        ExportFormat::JsonLines => render_json_lines(table)?,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    write_atomic(path, &bytes)?;

    info!(
        component = "export",
        event = "export.finish",
        path = %path.display(),
        format = format.as_str(),
        rows = table.rows.len(),
        bytes = bytes.len()
    );
    Ok(())
}

fn render_csv(table: &ExportTable) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row.iter().map(cell_text))?;
    }
    writer
        .into_inner()
        .map_err(|err| ExportError::Io(err.into_error()))
}

fn render_json_lines(table: &ExportTable) -> Result<Vec<u8>, ExportError> {
    let mut out = Vec::new();
    for row in &table.rows {
        let object: Map<String, Value> = table
            .columns
            .iter()
            .cloned()
            .zip(row.iter().map(cell_json))
            .collect();
        serde_json::to_writer(&mut out, &object)?;
        out.push(b'\n');
    }
    Ok(out)
}

fn cell_text(cell: &Cell) -> String {
    match cell {
        Cell::Int(v) => v.to_string(),
        Cell::Float(v) => v.to_string(),
        Cell::Text(v) => v.clone(),
        Cell::Timestamp(v) => v.to_string(),
        Cell::Bool(v) => v.to_string(),
        Cell::Missing => String::new(),
    }
}

fn cell_json(cell: &Cell) -> Value {
    match cell {
        Cell::Int(v) => Value::from(*v),
        Cell::Float(v) => Value::from(*v),
        Cell::Text(v) => Value::from(v.clone()),
        Cell::Timestamp(v) => Value::from(v.to_string()),
        Cell::Bool(v) => Value::from(*v),
        Cell::Missing => Value::Null,
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ExportError::InvalidPath(path.to_path_buf()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
