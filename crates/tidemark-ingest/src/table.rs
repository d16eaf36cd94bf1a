//! Destination identity and SQL identifier quoting

use crate::error::{IngestError, IngestResult};
use std::fmt;

/// Suffix appended to a destination table's name to form its scratch table
pub const SCRATCH_SUFFIX: &str = "_temp";

/// `schema.table` or bare `table`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    pub fn new(schema: Option<impl Into<String>>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.map(Into::into),
            name: name.into(),
        }
    }

    /// Parse a dotted name; at most two non-empty parts are accepted
    pub fn parse(qualified: &str) -> IngestResult<Self> {
        let parts: Vec<&str> = qualified.split('.').collect();
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(IngestError::invalid_input(format!(
                "table name '{}' has an empty part",
                qualified
            )));
        }

        match parts.as_slice() {
            [name] => Ok(Self::new(None::<String>, *name)),
            [schema, name] => Ok(Self::new(Some(*schema), *name)),
            _ => Err(IngestError::invalid_input(format!(
                "table name '{}' must be 'table' or 'schema.table'",
                qualified
            ))),
        }
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scratch table for this destination: `{schema}.{table}_temp`, or in
    /// `temp_schema` when one is given.
    pub fn scratch(&self, temp_schema: Option<&str>) -> Self {
        Self {
            schema: temp_schema.map(str::to_string).or_else(|| self.schema.clone()),
            name: format!("{}{}", self.name, SCRATCH_SUFFIX),
        }
    }

    /// Fully quoted form for use in SQL text
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote each identifier and join with `, `
pub fn quote_list<S: AsRef<str>>(idents: &[S]) -> String {
    idents
        .iter()
        .map(|i| quote_ident(i.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Single-quoted SQL string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
