//! Tidemark Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared pieces used by every Tidemark job:
//!
//! - **Error Handling**: [`TidemarkError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Bookmarks**: the watermark capability jobs advance after a merge
//!
//! # Example
//!
//! ```no_run
//! use tidemark_common::bookmark::{Bookmark, BookmarkStore, JsonFileBookmarkStore};
//!
//! fn advance(path: &str) -> tidemark_common::Result<()> {
//!     let store = JsonFileBookmarkStore::new(path);
//!     let previous = store.read()?;
//!     println!("previous bookmark: {:?}", previous);
//!     store.write(&Bookmark::Sequence(42))?;
//!     Ok(())
//! }
//! ```

pub mod bookmark;
pub mod error;
pub mod logging;

pub use bookmark::{
    Bookmark, BookmarkStore, InMemoryBookmarkStore, JsonFileBookmarkStore, NoopBookmarkStore,
};
pub use error::{Result, TidemarkError};
