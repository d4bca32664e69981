//! Raw delimited files to typed, schema-consistent record sets.
//!
//! A file is read fully into memory, every column is scanned to infer the
//! narrowest type its values share, and each cell is then coerced to that
//! type. Empty cells become nulls.

mod inference;

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database::DatabaseValue;
use crate::schema::{ColumnDescriptor, ColumnType, Schema};
use inference::{coerce, fits, TypeCandidate};

/// Error type for normalization
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The file cannot be parsed into a consistent table. `row` is 1-based
    /// and counts the header as row 1.
    #[error("malformed input at row {row}: {reason}")]
    MalformedInput { row: usize, reason: String },

    /// A column's values cannot be reconciled to one type
    #[error("cannot infer a type for column '{column}': {reason}")]
    TypeInference { column: String, reason: String },

    /// The file could not be opened or read
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How the raw file is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatHint {
    /// Field delimiter, `,` by default
    pub delimiter: u8,
    /// Whether the first row holds column names
    pub has_header: bool,
}

impl Default for FormatHint {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub format: FormatHint,
    /// Drop exact duplicate rows after coercion, keeping the first
    pub deduplicate: bool,
    /// Fail instead of warning when stray values loosen a column to string
    pub strict_types: bool,
}

/// A column was loosened to string by values that do not fit the type the
/// rest of the column points to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeWarning {
    pub column: String,
    /// Type the majority of values fit
    pub suggested: ColumnType,
    /// First value that did not fit
    pub value: String,
    /// Row of that value, header counted as row 1
    pub row: usize,
}

impl fmt::Display for TypeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "column '{}' stored as string: values look {} but row {} has '{}'",
            self.column, self.suggested, self.row, self.value
        )
    }
}

/// Normalized rows of one file, positionally aligned with its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    schema: Schema,
    rows: Vec<Vec<DatabaseValue>>,
    warnings: Vec<TypeWarning>,
}

impl RecordSet {
    /// Build a record set from already typed rows.
    ///
    /// Every row must have one value per schema column, each null or of the
    /// column's type. Row numbers in errors are 1-based positions in `rows`.
    pub fn new(schema: Schema, rows: Vec<Vec<DatabaseValue>>) -> Result<Self, NormalizeError> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != schema.len() {
                return Err(NormalizeError::MalformedInput {
                    row: idx + 1,
                    reason: format!("expected {} values, found {}", schema.len(), row.len()),
                });
            }
            for (value, column) in row.iter().zip(schema.columns()) {
                match value.column_type() {
                    Some(t) if t != column.column_type => {
                        return Err(NormalizeError::TypeInference {
                            column: column.name.clone(),
                            reason: format!("row {} holds a {} value", idx + 1, t),
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(Self {
            schema,
            rows,
            warnings: Vec::new(),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<DatabaseValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn warnings(&self) -> &[TypeWarning] {
        &self.warnings
    }

    /// Value at `row` (0-based) in the column named `column`
    pub fn get(&self, row: usize, column: &str) -> Option<&DatabaseValue> {
        let idx = self.schema.index_of(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    #[cfg(test)]
    pub(crate) fn rows_mut(&mut self) -> &mut Vec<Vec<DatabaseValue>> {
        &mut self.rows
    }
}

/// Source row number plus its cells, `None` for empty cells
type RawRow = (usize, Vec<Option<String>>);

/// Normalize the file at `path`.
pub fn normalize_file(
    path: impl AsRef<Path>,
    options: &NormalizeOptions,
) -> Result<RecordSet, NormalizeError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "normalizing file");
    let file = File::open(path)?;
    normalize_reader(file, options)
}

/// Normalize delimited text from any reader.
pub fn normalize_reader<R: io::Read>(
    reader: R,
    options: &NormalizeOptions,
) -> Result<RecordSet, NormalizeError> {
    let (names, raw_rows) = read_table(reader, &options.format)?;

    let mut columns = Vec::with_capacity(names.len());
    let mut warnings = Vec::new();
    for (idx, name) in names.into_iter().enumerate() {
        let mut candidate = TypeCandidate::default();
        for (_, cells) in &raw_rows {
            if let Some(raw) = &cells[idx] {
                candidate.observe(raw);
            }
        }

        let column_type = candidate.resolve();
        if let Some(suggested) = candidate.loosened_from() {
            let warning = loosening_warning(&name, idx, suggested, &raw_rows);
            if options.strict_types {
                return Err(NormalizeError::TypeInference {
                    column: name,
                    reason: warning.to_string(),
                });
            }
            warn!(
                column = %warning.column,
                suggested = %warning.suggested,
                row = warning.row,
                "{}",
                warning
            );
            warnings.push(warning);
        }
        columns.push(ColumnDescriptor::new(name, column_type));
    }
    let schema = Schema::new(columns);

    let mut rows = Vec::with_capacity(raw_rows.len());
    for (row_number, cells) in raw_rows {
        let mut values = Vec::with_capacity(schema.len());
        for (cell, column) in cells.into_iter().zip(schema.columns()) {
            let value = match cell {
                None => DatabaseValue::Null,
                Some(raw) => coerce(column.column_type, &raw).ok_or_else(|| {
                    NormalizeError::TypeInference {
                        column: column.name.clone(),
                        reason: format!(
                            "row {} value '{}' is not {}",
                            row_number, raw, column.column_type
                        ),
                    }
                })?,
            };
            values.push(value);
        }
        rows.push(values);
    }

    if options.deduplicate {
        let before = rows.len();
        rows = deduplicate(rows);
        if rows.len() < before {
            info!(dropped = before - rows.len(), "removed duplicate rows");
        }
    }

    Ok(RecordSet {
        schema,
        rows,
        warnings,
    })
}

/// Parse raw rows, returning the column names and the data rows.
fn read_table<R: io::Read>(
    reader: R,
    format: &FormatHint,
) -> Result<(Vec<String>, Vec<RawRow>), NormalizeError> {
    // Headers are handled here so the header row gets the same width checks
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(format.delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut names: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    // Rows are numbered by physical line, so skipped blank lines still count
    let mut last_line = 0;

    for result in csv_reader.records() {
        let record = result.map_err(|e| csv_error(e, last_line + 1))?;
        let row_number = record
            .position()
            .map_or(last_line + 1, |pos| pos.line() as usize);
        last_line = row_number;

        let width = names.as_ref().map(Vec::len);

        // A whitespace-only line is a null row in a single-column table and
        // a blank line everywhere else
        if record.len() == 1 && record[0].trim().is_empty() && width != Some(1) {
            continue;
        }

        let Some(expected) = width else {
            if format.has_header {
                names = Some(header_names(&record, row_number)?);
            } else {
                names = Some((1..=record.len()).map(|i| format!("column_{}", i)).collect());
                rows.push(raw_row(row_number, &record));
            }
            continue;
        };

        if record.len() != expected {
            return Err(NormalizeError::MalformedInput {
                row: row_number,
                reason: format!("expected {} columns, found {}", expected, record.len()),
            });
        }
        rows.push(raw_row(row_number, &record));
    }

    let names = names.ok_or_else(|| NormalizeError::MalformedInput {
        row: 1,
        reason: "file is empty".to_string(),
    })?;
    Ok((names, rows))
}

fn header_names(
    record: &csv::StringRecord,
    row_number: usize,
) -> Result<Vec<String>, NormalizeError> {
    let mut seen = HashSet::new();
    let mut names = Vec::with_capacity(record.len());
    for (idx, cell) in record.iter().enumerate() {
        let trimmed = cell.trim();
        let name = if trimmed.is_empty() {
            format!("column_{}", idx + 1)
        } else {
            trimmed.to_string()
        };
        if !seen.insert(name.clone()) {
            return Err(NormalizeError::MalformedInput {
                row: row_number,
                reason: format!("duplicate column name '{}'", name),
            });
        }
        names.push(name);
    }
    Ok(names)
}

fn raw_row(row_number: usize, record: &csv::StringRecord) -> RawRow {
    let cells = record
        .iter()
        .map(|cell| {
            if cell.trim().is_empty() {
                None
            } else {
                Some(cell.to_string())
            }
        })
        .collect();
    (row_number, cells)
}

fn csv_error(error: csv::Error, fallback_row: usize) -> NormalizeError {
    let row_number = error
        .position()
        .map_or(fallback_row, |pos| pos.line() as usize);
    if let csv::ErrorKind::Utf8 { .. } = error.kind() {
        return NormalizeError::MalformedInput {
            row: row_number,
            reason: "row is not valid UTF-8".to_string(),
        };
    }
    let reason = error.to_string();
    match error.into_kind() {
        csv::ErrorKind::Io(e) => NormalizeError::Io(e),
        _ => NormalizeError::MalformedInput {
            row: row_number,
            reason,
        },
    }
}

fn loosening_warning(
    column: &str,
    idx: usize,
    suggested: ColumnType,
    rows: &[RawRow],
) -> TypeWarning {
    let (row, value) = rows
        .iter()
        .find_map(|(row_number, cells)| match &cells[idx] {
            Some(raw) if !fits(suggested, raw) => Some((*row_number, raw.clone())),
            _ => None,
        })
        .unwrap_or_default();

    TypeWarning {
        column: column.to_string(),
        suggested,
        value,
        row,
    }
}

#[derive(PartialEq, Eq, Hash)]
enum CellKey<'a> {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(u64),
    Text(&'a str),
}

impl<'a> From<&'a DatabaseValue> for CellKey<'a> {
    fn from(value: &'a DatabaseValue) -> Self {
        match value {
            DatabaseValue::Null => CellKey::Null,
            DatabaseValue::Boolean(b) => CellKey::Boolean(*b),
            DatabaseValue::Integer(i) => CellKey::Integer(*i),
            DatabaseValue::Float(f) => CellKey::Float(f.to_bits()),
            DatabaseValue::Text(s) => CellKey::Text(s),
        }
    }
}

fn deduplicate(rows: Vec<Vec<DatabaseValue>>) -> Vec<Vec<DatabaseValue>> {
    let mut keep = Vec::with_capacity(rows.len());
    {
        let mut seen = HashSet::new();
        for row in &rows {
            let key: Vec<CellKey<'_>> = row.iter().map(CellKey::from).collect();
            keep.push(seen.insert(key));
        }
    }
    rows.into_iter()
        .zip(keep)
        .filter_map(|(row, first)| first.then_some(row))
        .collect()
}

#[cfg(test)]
mod tests;
