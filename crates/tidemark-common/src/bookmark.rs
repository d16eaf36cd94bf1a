//! Bookmarks (watermarks) for incremental extraction
//!
//! A bookmark records "data through this point has been durably ingested".
//! Jobs read it before extracting and write it only after a successful
//! merge. Stores are injected into jobs so no bookmark state is global.

use crate::error::{Result, TidemarkError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Key holding the bookmark inside a JSON job file
pub const BOOKMARK_KEY: &str = "bookmark";

/// An instant or a monotonic counter
///
/// Serialized as an ISO-8601 string or as a JSON integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bookmark {
    Sequence(i64),
    Timestamp(DateTime<Utc>),
}

impl Bookmark {
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Bookmark::Timestamp(ts) => Some(*ts),
            Bookmark::Sequence(_) => None,
        }
    }

    pub fn as_sequence(&self) -> Option<i64> {
        match self {
            Bookmark::Sequence(n) => Some(*n),
            Bookmark::Timestamp(_) => None,
        }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bookmark::Sequence(n) => write!(f, "{}", n),
            Bookmark::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl From<DateTime<Utc>> for Bookmark {
    fn from(ts: DateTime<Utc>) -> Self {
        Bookmark::Timestamp(ts)
    }
}

impl From<i64> for Bookmark {
    fn from(n: i64) -> Self {
        Bookmark::Sequence(n)
    }
}

/// Persisted bookmark capability
pub trait BookmarkStore: Send + Sync {
    /// Current bookmark, `None` if nothing was ever ingested
    fn read(&self) -> Result<Option<Bookmark>>;

    fn write(&self, bookmark: &Bookmark) -> Result<()>;
}

/// Bookmark kept under the `bookmark` key of a JSON object file
///
/// Other keys in the file are preserved on write.
#[derive(Debug, Clone)]
pub struct JsonFileBookmarkStore {
    path: PathBuf,
}

impl JsonFileBookmarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        if !self.path.exists() {
            return Ok(serde_json::Map::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        match serde_json::from_str(&content)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(TidemarkError::invalid_bookmark(format!(
                "{} must contain a JSON object, found {}",
                self.path.display(),
                other
            ))),
        }
    }
}

impl BookmarkStore for JsonFileBookmarkStore {
    fn read(&self) -> Result<Option<Bookmark>> {
        let document = self.read_document()?;

        match document.get(BOOKMARK_KEY) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                TidemarkError::invalid_bookmark(format!(
                    "{} in {}: {}",
                    value,
                    self.path.display(),
                    e
                ))
            }),
        }
    }

    fn write(&self, bookmark: &Bookmark) -> Result<()> {
        let mut document = self.read_document()?;
        document.insert(BOOKMARK_KEY.to_string(), serde_json::to_value(bookmark)?);

        // Write to a sibling file and rename so readers never see a torn file
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, serde_json::to_string_pretty(&document)?)?;
        std::fs::rename(&temp_path, &self.path)?;

        info!(path = %self.path.display(), bookmark = %bookmark, "Bookmark updated");
        Ok(())
    }
}

/// Process-local store, for tests and dry runs
#[derive(Debug, Default)]
pub struct InMemoryBookmarkStore {
    bookmark: Mutex<Option<Bookmark>>,
}

impl InMemoryBookmarkStore {
    pub fn new(initial: Option<Bookmark>) -> Self {
        Self {
            bookmark: Mutex::new(initial),
        }
    }
}

impl BookmarkStore for InMemoryBookmarkStore {
    fn read(&self) -> Result<Option<Bookmark>> {
        Ok(*self.bookmark.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn write(&self, bookmark: &Bookmark) -> Result<()> {
        *self.bookmark.lock().unwrap_or_else(|e| e.into_inner()) = Some(*bookmark);
        info!(bookmark = %bookmark, "Bookmark updated");
        Ok(())
    }
}

/// Store for full-refresh jobs that never track progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBookmarkStore;

impl BookmarkStore for NoopBookmarkStore {
    fn read(&self) -> Result<Option<Bookmark>> {
        Ok(None)
    }

    fn write(&self, _bookmark: &Bookmark) -> Result<()> {
        Ok(())
    }
}
