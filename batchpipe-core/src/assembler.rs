//! Dataset assembly: merge a batch's chunks into one ordered table and
//! serialize it as CSV for the pipeline.

use crate::error::AssemblyError;
use crate::types::{Chunk, Row};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Column names produced by spreadsheet exports for unnamed columns.
static PLACEHOLDER_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^unnamed:").expect("valid placeholder pattern"));

/// Merged rows of a batch plus the inferred column set.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledDataset {
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// Merges chunks into an [`AssembledDataset`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DatasetAssembler;

impl DatasetAssembler {
    pub fn new() -> Self {
        Self
    }

    /// Order chunks by index, concatenate their rows and infer the columns.
    pub fn assemble<'a, I>(&self, chunks: I) -> Result<AssembledDataset, AssemblyError>
    where
        I: IntoIterator<Item = &'a Chunk>,
    {
        let mut ordered: Vec<&Chunk> = chunks.into_iter().collect();
        ordered.sort_by_key(|chunk| chunk.index);

        let rows: Vec<Row> = ordered
            .into_iter()
            .flat_map(|chunk| chunk.rows.iter().cloned())
            .collect();
        if rows.is_empty() {
            return Err(AssemblyError::EmptyDataset);
        }

        let columns = infer_columns(&rows);
        if columns.is_empty() {
            return Err(AssemblyError::NoColumns);
        }

        Ok(AssembledDataset { columns, rows })
    }
}

/// Ordered union of trimmed row keys, without blank or placeholder names.
fn infer_columns(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            let name = key.trim();
            if name.is_empty() || PLACEHOLDER_COLUMN.is_match(name) {
                continue;
            }
            if !columns.iter().any(|c| c == name) {
                columns.push(name.to_string());
            }
        }
    }
    columns
}

impl AssembledDataset {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Serialize as CSV: a header line, then one line per row.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let header: Vec<String> = self.columns.iter().map(|c| escape_csv(c)).collect();
        out.push_str(&header.join(","));
        out.push('\n');

        for row in &self.rows {
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|column| escape_csv(&cell_text(lookup(row, column))))
                .collect();
            out.push_str(&cells.join(","));
            out.push('\n');
        }
        out
    }
}

/// Find the value for a column, tolerating keys with surrounding whitespace.
fn lookup<'a>(row: &'a Row, column: &str) -> Option<&'a Value> {
    row.get(column).or_else(|| {
        row.iter()
            .find(|(key, _)| key.trim() == column)
            .map(|(_, value)| value)
    })
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Quote a field when it contains a delimiter, quote, or line break.
fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
