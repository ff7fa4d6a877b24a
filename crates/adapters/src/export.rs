use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use sqlchat_core::results_table::ResultsTable;
use thiserror::Error;

pub const DEFAULT_CSV_FILE_NAME: &str = "query-results.csv";
pub const DEFAULT_JSON_FILE_NAME: &str = "query-results.json";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write export file at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize JSON export: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes the table as CSV and returns the number of data rows.
pub fn export_table_to_csv(path: &Path, table: &ResultsTable<'_>) -> Result<usize, ExportError> {
    write_file(path, table.to_csv())?;
    Ok(table.row_count())
}

/// Writes the rows as a pretty JSON array, one object per row keyed by the
/// table's columns. Cells a row lacks are written as `null`.
pub fn export_table_to_json(path: &Path, table: &ResultsTable<'_>) -> Result<usize, ExportError> {
    let records = table
        .rows()
        .iter()
        .map(|row| {
            let object = table
                .columns()
                .iter()
                .map(|column| (column.clone(), row.get(column).cloned().unwrap_or(Value::Null)))
                .collect::<Map<_, _>>();
            Value::Object(object)
        })
        .collect::<Vec<_>>();

    let payload = serde_json::to_string_pretty(&records)?;
    write_file(path, payload)?;
    Ok(records.len())
}

fn write_file(path: &Path, content: String) -> Result<(), ExportError> {
    fs::write(path, content).map_err(|source| ExportError::Write {
        path: path.display().to_string(),
        source,
    })
}
