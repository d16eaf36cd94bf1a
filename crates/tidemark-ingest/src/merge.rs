//! Merge Engine: reconciles a scratch table into its destination
//!
//! One transaction does create-if-missing, delete-by-key,
//! deduplicate-and-insert and the scratch drop. Readers see the destination
//! either entirely before or entirely after the merge. Only one merge per
//! destination may be in flight, since the scratch name is derived from the
//! destination name.

use crate::engine::{Engine, EngineKind};
use crate::error::{IngestError, IngestResult, MergePhase};
use crate::staging::LOAD_TIMESTAMP_COLUMN;
use crate::table::{quote_ident, quote_list, TableName};
use std::collections::HashSet;
use tracing::{info, instrument};

/// Alias of the `ROW_NUMBER` value; staged columns may not use it
pub(crate) const RANK_COLUMN: &str = "__merge_rank";

/// Columns whose combined values identify one logical row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeKey {
    columns: Vec<String>,
}

impl MergeKey {
    /// Fails on an empty or repeating column list
    pub fn new<I, S>(columns: I) -> IngestResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(IngestError::invalid_input("merge key must name at least one column"));
        }

        let mut seen = HashSet::new();
        if let Some(repeated) = columns.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(IngestError::invalid_input(format!(
                "merge key repeats column '{}'",
                repeated
            )));
        }

        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Concatenated text of the key: `'-'`-joined, nulls as empty strings
    fn concat_expr(&self, kind: EngineKind) -> String {
        self.columns
            .iter()
            .map(|c| kind.key_text(c))
            .collect::<Vec<_>>()
            .join(" || '-' || ")
    }
}

/// Counts from a committed merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeReport {
    pub created_destination: bool,
    pub deleted: u64,
    pub inserted: u64,
}

/// SQL for one merge, built from introspected column lists
#[derive(Debug)]
pub(crate) struct MergePlan<'a> {
    pub kind: EngineKind,
    pub destination: &'a TableName,
    pub scratch: &'a TableName,
    pub key: &'a MergeKey,
    pub range_column: &'a str,
    /// Scratch table columns in creation order
    pub columns: &'a [String],
}

impl MergePlan<'_> {
    pub fn create_destination_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} AS SELECT * FROM {} WHERE 1=0",
            self.destination.quoted(),
            self.scratch.quoted()
        )
    }

    pub fn delete_sql(&self) -> String {
        let key = self.key.concat_expr(self.kind);
        format!(
            "DELETE FROM {} WHERE {} IN (SELECT DISTINCT {} FROM {})",
            self.destination.quoted(),
            key,
            key,
            self.scratch.quoted()
        )
    }

    /// One row per key: highest range value wins, then the remaining
    /// columns compared as text, so ties resolve the same way every run.
    pub fn insert_sql(&self) -> String {
        let columns = quote_list(self.columns);
        let mut ordering = vec![format!("{} DESC NULLS LAST", quote_ident(self.range_column))];
        ordering.extend(
            self.columns
                .iter()
                .filter(|c| {
                    c.as_str() != self.range_column
                        && c.as_str() != LOAD_TIMESTAMP_COLUMN
                        && !self.key.columns.contains(c)
                })
                .map(|c| format!("{} DESC NULLS LAST", self.kind.ordering_text(c))),
        );

        format!(
            "INSERT INTO {dest} ({columns}) \
             SELECT {columns} FROM (\
             SELECT {columns}, ROW_NUMBER() OVER (PARTITION BY {keys} ORDER BY {ordering}) AS {rank} \
             FROM {scratch}\
             ) AS ranked WHERE {rank} = 1",
            dest = self.destination.quoted(),
            columns = columns,
            keys = quote_list(&self.key.columns),
            ordering = ordering.join(", "),
            rank = quote_ident(RANK_COLUMN),
            scratch = self.scratch.quoted(),
        )
    }

    pub fn drop_scratch_sql(&self) -> String {
        format!("DROP TABLE {}", self.scratch.quoted())
    }
}

pub struct MergeEngine<'a> {
    engine: &'a dyn Engine,
}

impl<'a> MergeEngine<'a> {
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self { engine }
    }

    /// Overwrite-by-key merge of `scratch` into `destination`
    ///
    /// Any error before commit leaves the destination as it was; the scratch
    /// table may survive a failed merge.
    #[instrument(skip(self, key), fields(destination = %destination, scratch = %scratch))]
    pub async fn merge(
        &self,
        destination: &TableName,
        scratch: &TableName,
        key: &MergeKey,
        range_column: &str,
    ) -> IngestResult<MergeReport> {
        let introspect = |e| IngestError::merge(destination, MergePhase::Introspect, e);

        let columns = self.engine.column_names(scratch).await.map_err(introspect)?;
        let existing = self.engine.column_names(destination).await.map_err(introspect)?;
        check_columns(destination, scratch, key, range_column, &columns, &existing)?;

        let plan = MergePlan {
            kind: self.engine.kind(),
            destination,
            scratch,
            key,
            range_column,
            columns: &columns,
        };

        let mut tx = self
            .engine
            .begin()
            .await
            .map_err(|e| IngestError::merge(destination, MergePhase::Begin, e))?;

        let steps = [
            (MergePhase::CreateDestination, plan.create_destination_sql()),
            (MergePhase::Delete, plan.delete_sql()),
            (MergePhase::Insert, plan.insert_sql()),
            (MergePhase::DropScratch, plan.drop_scratch_sql()),
        ];

        let mut report = MergeReport {
            created_destination: existing.is_empty(),
            ..MergeReport::default()
        };
        for (phase, sql) in steps {
            let affected = tx
                .execute(&sql)
                .await
                .map_err(|e| IngestError::merge(destination, phase, e))?;
            match phase {
                MergePhase::Delete => report.deleted = affected,
                MergePhase::Insert => report.inserted = affected,
                _ => {},
            }
        }

        tx.commit()
            .await
            .map_err(|e| IngestError::merge(destination, MergePhase::Commit, e))?;

        info!(
            deleted = report.deleted,
            inserted = report.inserted,
            created = report.created_destination,
            "Merge committed"
        );
        Ok(report)
    }
}

/// Preconditions checked before the transaction opens
fn check_columns(
    destination: &TableName,
    scratch: &TableName,
    key: &MergeKey,
    range_column: &str,
    staged: &[String],
    existing: &[String],
) -> IngestResult<()> {
    if staged.is_empty() {
        return Err(IngestError::schema_mismatch(
            destination,
            format!("scratch table {} does not exist", scratch),
        ));
    }

    if let Some(reserved) = staged.iter().find(|c| c.eq_ignore_ascii_case(RANK_COLUMN)) {
        return Err(IngestError::schema_mismatch(
            destination,
            format!("staged column '{}' clashes with the merge ranking", reserved),
        ));
    }

    let missing_key: Vec<&str> = key
        .columns()
        .iter()
        .filter(|c| !staged.contains(c))
        .map(String::as_str)
        .collect();
    if !missing_key.is_empty() {
        return Err(IngestError::schema_mismatch(
            destination,
            format!("merge key columns {:?} are not staged", missing_key),
        ));
    }

    if !staged.iter().any(|c| c == range_column) {
        return Err(IngestError::schema_mismatch(
            destination,
            format!("range column '{}' is not staged", range_column),
        ));
    }

    if existing.is_empty() {
        return Ok(());
    }

    let unexpected: Vec<&str> = staged
        .iter()
        .filter(|c| !existing.contains(c))
        .map(String::as_str)
        .collect();
    if !unexpected.is_empty() {
        return Err(IngestError::schema_mismatch(
            destination,
            format!("staged columns {:?} do not exist in the destination", unexpected),
        ));
    }

    Ok(())
}
