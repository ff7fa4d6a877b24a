use serde_json::Value;

use crate::limits::TRUNCATION_LIMIT_OPTIONS;
use crate::message::Row;

pub const NO_RESULTS_TEXT: &str = "Success. No results found.";

/// Tabular view over a result set whose columns are only known at runtime.
///
/// Columns follow the key order of the first row; keys that only show up in
/// later rows are appended in the order they are first seen, so nothing a
/// row carries is hidden.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsTable<'a> {
    rows: &'a [Row],
    columns: Vec<String>,
    active_limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TablePage<'a> {
    pub index: usize,
    pub page_count: usize,
    pub first_row: usize,
    pub rows: Vec<&'a Row>,
}

impl<'a> ResultsTable<'a> {
    #[must_use]
    pub fn new(rows: &'a [Row], active_limit: Option<u32>) -> Self {
        Self {
            rows,
            columns: infer_columns(rows),
            active_limit,
        }
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &'a [Row] {
        self.rows
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn active_limit(&self) -> Option<u32> {
        self.active_limit
    }

    /// A non-empty result set whose size equals the limit it was fetched with.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        match self.active_limit {
            Some(limit) => !self.rows.is_empty() && self.rows.len() == limit as usize,
            None => false,
        }
    }

    #[must_use]
    pub fn truncation_options(&self) -> &'static [u32] {
        if self.is_truncated() {
            &TRUNCATION_LIMIT_OPTIONS
        } else {
            &[]
        }
    }

    #[must_use]
    pub fn row_count_label(&self) -> String {
        match self.rows.len() {
            1 => "1 row found".to_string(),
            count => format!("{count} rows found"),
        }
    }

    #[must_use]
    pub fn cell(&self, row: &Row, column: &str) -> String {
        cell_text(row.get(column))
    }

    #[must_use]
    pub fn row_cells(&self, row: &Row) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| self.cell(row, column))
            .collect()
    }

    #[must_use]
    pub fn page_count(&self, page_size: usize) -> usize {
        if self.rows.is_empty() {
            return 0;
        }
        self.rows.len().div_ceil(page_size.max(1))
    }

    /// Rows of page `index` (zero-based). Out-of-range indexes clamp to the last page.
    #[must_use]
    pub fn page(&self, index: usize, page_size: usize) -> TablePage<'a> {
        let page_size = page_size.max(1);
        let page_count = self.page_count(page_size);
        if page_count == 0 {
            return TablePage {
                index: 0,
                page_count: 0,
                first_row: 0,
                rows: Vec::new(),
            };
        }

        let index = index.min(page_count - 1);
        let start = index * page_size;
        let end = (start + page_size).min(self.rows.len());
        TablePage {
            index,
            page_count,
            first_row: start,
            rows: self.rows[start..end].iter().collect(),
        }
    }

    /// Header line plus one line per row, joined with `\n` and no trailing newline.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut lines = Vec::with_capacity(self.rows.len() + 1);
        lines.push(
            self.columns
                .iter()
                .map(|column| csv_escape(column))
                .collect::<Vec<_>>()
                .join(","),
        );
        for row in self.rows {
            lines.push(
                self.row_cells(row)
                    .iter()
                    .map(|value| csv_escape(value))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        lines.join("\n")
    }
}

#[must_use]
pub fn infer_columns(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|column| column == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// Display text of a cell. Missing cells are empty, strings are shown raw and
/// everything else uses its compact JSON form.
#[must_use]
pub fn cell_text(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[must_use]
pub fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
