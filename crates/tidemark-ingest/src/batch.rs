//! Row batches: the in-memory table an extractor hands to the pipeline
//!
//! A [`RowBatch`] is rectangular and immutable once built. Every column
//! declares one [`ColumnType`] and only holds values of that type or
//! [`Value::Null`].

use crate::error::BatchError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Text,
    Date,
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// The type of a non-null value
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Date(_) => Some(ColumnType::Date),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Parse a text cell as `ty`; empty cells are null
    pub fn parse_as(ty: ColumnType, cell: &str) -> Option<Value> {
        if cell.is_empty() {
            return Some(Value::Null);
        }

        match ty {
            ColumnType::Boolean => match cell.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Boolean(true)),
                "false" => Some(Value::Boolean(false)),
                _ => None,
            },
            ColumnType::Integer => cell.parse().ok().map(Value::Integer),
            ColumnType::Float => cell.parse().ok().map(Value::Float),
            ColumnType::Text => Some(Value::Text(cell.to_string())),
            ColumnType::Date => NaiveDate::parse_from_str(cell, "%Y-%m-%d").ok().map(Value::Date),
            ColumnType::Timestamp => parse_timestamp(cell).map(Value::Timestamp),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

fn parse_timestamp(cell: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(cell) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(cell, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Most specific type every non-empty cell parses as
fn infer_type<'a>(cells: impl Iterator<Item = &'a str> + Clone) -> ColumnType {
    const CANDIDATES: [ColumnType; 5] = [
        ColumnType::Integer,
        ColumnType::Float,
        ColumnType::Boolean,
        ColumnType::Date,
        ColumnType::Timestamp,
    ];

    let mut non_empty = cells.filter(|c| !c.is_empty()).peekable();
    if non_empty.peek().is_none() {
        return ColumnType::Text;
    }

    CANDIDATES
        .into_iter()
        .find(|ty| {
            let numeric = matches!(ty, ColumnType::Integer | ColumnType::Float);
            non_empty.clone().all(|cell| {
                (!numeric || is_plain_number(cell)) && Value::parse_as(*ty, cell).is_some()
            })
        })
        .unwrap_or(ColumnType::Text)
}

/// Digits as a number would print them: zero-padded codes ("007"), a
/// leading `+` and spellings like "inf" are not numbers here.
fn is_plain_number(cell: &str) -> bool {
    let unsigned = cell.strip_prefix('-').unwrap_or(cell);
    let zero_padded =
        unsigned.starts_with('0') && unsigned.as_bytes().get(1).is_some_and(u8::is_ascii_digit);

    unsigned.starts_with(|c: char| c.is_ascii_digit())
        && !zero_padded
        && unsigned
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    column_type: ColumnType,
    values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            column_type,
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn check_types(&self) -> Result<(), BatchError> {
        for (row, value) in self.values.iter().enumerate() {
            if let Some(actual) = value.column_type() {
                if actual != self.column_type {
                    return Err(BatchError::TypeMismatch {
                        column: self.name.clone(),
                        row,
                        expected: self.column_type.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Immutable rectangular table of named, typed columns
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    columns: Vec<Column>,
    num_rows: usize,
}

impl RowBatch {
    /// Validates that there is at least one column, names are unique, all
    /// columns have the same length and values agree with declared types.
    pub fn new(columns: Vec<Column>) -> Result<Self, BatchError> {
        let first = columns.first().ok_or(BatchError::NoColumns)?;
        let num_rows = first.len();

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(BatchError::DuplicateColumn(column.name.clone()));
            }
            if column.len() != num_rows {
                return Err(BatchError::LengthMismatch {
                    column: column.name.clone(),
                    expected: num_rows,
                    actual: column.len(),
                });
            }
            column.check_types()?;
        }

        Ok(Self { columns, num_rows })
    }

    /// All-text batch from spreadsheet-style rows
    ///
    /// Rows shorter than the header are padded with nulls (sheet APIs trim
    /// trailing empty cells); longer rows are rejected.
    pub fn from_text_rows(header: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, BatchError> {
        let width = header.len();
        let mut values: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); width];

        for (index, row) in rows.into_iter().enumerate() {
            if row.len() > width {
                return Err(BatchError::WidthMismatch {
                    row: index,
                    expected: width,
                    actual: row.len(),
                });
            }
            let padding = width - row.len();
            for (slot, cell) in values.iter_mut().zip(
                row.into_iter()
                    .map(Value::Text)
                    .chain(std::iter::repeat(Value::Null).take(padding)),
            ) {
                slot.push(cell);
            }
        }

        let columns = header
            .into_iter()
            .zip(values)
            .map(|(name, values)| Column::new(name, ColumnType::Text, values))
            .collect();
        Self::new(columns)
    }

    /// Read a delimited file with a header row, inferring column types
    pub fn from_csv_path(path: impl AsRef<Path>, delimiter: u8) -> Result<Self, BatchError> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file, delimiter)
    }

    pub fn from_csv_reader<R: Read>(reader: R, delimiter: u8) -> Result<Self, BatchError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(reader);

        let header: Vec<String> = csv_reader.headers()?.iter().map(str::to_string).collect();
        let mut records = Vec::new();
        for record in csv_reader.records() {
            records.push(record?);
        }

        let columns = header
            .into_iter()
            .enumerate()
            .map(|(index, name)| {
                let cells = records.iter().map(move |r| r.get(index).unwrap_or(""));
                let column_type = infer_type(cells.clone());
                let values = cells
                    .map(|cell| Value::parse_as(column_type, cell).unwrap_or(Value::Null))
                    .collect();
                Column::new(name, column_type, values)
            })
            .collect();

        Self::new(columns)
    }

    /// Batch from JSON objects such as API result pages
    ///
    /// Columns are the union of keys in first-seen order. Arrays of scalars
    /// are joined with `,`; other nested values are kept as JSON text.
    pub fn from_json_records(
        records: &[serde_json::Map<String, serde_json::Value>],
    ) -> Result<Self, BatchError> {
        let mut names: Vec<&str> = Vec::new();
        let mut seen = HashSet::new();
        for record in records {
            for key in record.keys() {
                if seen.insert(key.as_str()) {
                    names.push(key.as_str());
                }
            }
        }

        let columns = names
            .into_iter()
            .map(|name| {
                let cells: Vec<&serde_json::Value> = records
                    .iter()
                    .map(|r| r.get(name).unwrap_or(&serde_json::Value::Null))
                    .collect();
                json_column(name, &cells)
            })
            .collect();

        Self::new(columns)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Values of one row, in column order
    pub fn row(&self, index: usize) -> Option<Vec<&Value>> {
        (index < self.num_rows).then(|| self.columns.iter().map(|c| &c.values[index]).collect())
    }

    /// New batch with `column` appended
    pub fn with_column(self, column: Column) -> Result<Self, BatchError> {
        let mut columns = self.columns;
        columns.push(column);
        Self::new(columns)
    }

    /// New batch with every column renamed by `rename`
    pub fn rename_columns(self, rename: impl Fn(&str) -> String) -> Result<Self, BatchError> {
        let columns = self
            .columns
            .into_iter()
            .map(|c| Column {
                name: rename(&c.name),
                ..c
            })
            .collect();
        Self::new(columns)
    }

    /// Replace one column's values, e.g. to cast text cells
    pub fn map_column(
        self,
        name: &str,
        column_type: ColumnType,
        map: impl Fn(&Value) -> Value,
    ) -> Result<Self, BatchError> {
        if self.column(name).is_none() {
            return Err(BatchError::UnknownColumn(name.to_string()));
        }

        let columns = self
            .columns
            .into_iter()
            .map(|c| {
                if c.name == name {
                    let values = c.values.iter().map(&map).collect();
                    Column::new(c.name, column_type, values)
                } else {
                    c
                }
            })
            .collect();
        Self::new(columns)
    }
}

fn json_cell_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) if items.iter().all(|i| !i.is_array() && !i.is_object()) => {
            Some(
                items
                    .iter()
                    .map(|i| match i {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(","),
            )
        },
        other => Some(other.to_string()),
    }
}

fn json_column(name: &str, cells: &[&serde_json::Value]) -> Column {
    let non_null: Vec<&serde_json::Value> = cells.iter().copied().filter(|v| !v.is_null()).collect();

    let column_type = if non_null.is_empty() {
        ColumnType::Text
    } else if non_null.iter().all(|v| v.is_boolean()) {
        ColumnType::Boolean
    } else if non_null.iter().all(|v| v.is_i64()) {
        ColumnType::Integer
    } else if non_null.iter().all(|v| v.is_number()) {
        ColumnType::Float
    } else if non_null.iter().all(|v| v.is_string()) {
        // Only temporal types are inferred from strings; "007" stays text
        let strings = non_null.iter().filter_map(|v| v.as_str());
        match infer_type(strings) {
            ty @ (ColumnType::Date | ColumnType::Timestamp) => ty,
            _ => ColumnType::Text,
        }
    } else {
        ColumnType::Text
    };

    let values = cells
        .iter()
        .map(|cell| match (column_type, cell) {
            (_, serde_json::Value::Null) => Value::Null,
            (ColumnType::Boolean, v) => v.as_bool().map(Value::Boolean).unwrap_or(Value::Null),
            (ColumnType::Integer, v) => v.as_i64().map(Value::Integer).unwrap_or(Value::Null),
            (ColumnType::Float, v) => v.as_f64().map(Value::Float).unwrap_or(Value::Null),
            (ty @ (ColumnType::Date | ColumnType::Timestamp), v) => v
                .as_str()
                .and_then(|s| Value::parse_as(ty, s))
                .unwrap_or(Value::Null),
            (ColumnType::Text, v) => json_cell_text(v).map(Value::Text).unwrap_or(Value::Null),
        })
        .collect();

    Column::new(name, column_type, values)
}
