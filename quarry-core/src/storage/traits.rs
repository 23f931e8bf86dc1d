// src/storage/traits.rs
//! Storage abstraction
//!
//! ```text
//! Storage trait (ordered document set)
//!   ├── MemoryStorage (in-memory Vec, nothing persisted)
//!   └── FileStorage   (in-memory Vec + append-only checksummed journal)
//! ```

use crate::document::Document;
use crate::error::Result;

/// Ordered document set owned by a collection
///
/// Documents are kept in collection order: insertion order, with replacements keeping
/// their position. Positions passed to [`replace`](Storage::replace) and
/// [`remove`](Storage::remove) index into [`documents`](Storage::documents).
///
/// Implementations do not check `_id` uniqueness; the collection does.
pub trait Storage: Send + Sync {
    /// All documents in collection order
    fn documents(&self) -> &[Document];

    /// Append a document
    fn insert(&mut self, doc: Document) -> Result<()>;

    /// Replace the document at `position`
    fn replace(&mut self, position: usize, doc: Document) -> Result<()>;

    /// Remove and return the document at `position`
    fn remove(&mut self, position: usize) -> Result<Document>;

    /// Persist pending writes
    ///
    /// A no-op for storage that has nothing to persist.
    fn flush(&mut self) -> Result<()>;

    fn len(&self) -> usize {
        self.documents().len()
    }

    fn is_empty(&self) -> bool {
        self.documents().is_empty()
    }
}
