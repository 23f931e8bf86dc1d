// storage/memory_storage.rs
//! Pure in-memory storage
//!
//! Keeps documents in a `Vec` and persists nothing. The default backend for collections
//! that live only as long as the process.

use crate::document::Document;
use crate::error::{QuarryError, Result};
use crate::storage::Storage;

/// In-memory storage backend
///
/// ```
/// use quarry_core::storage::{MemoryStorage, Storage};
///
/// let storage = MemoryStorage::new();
/// assert!(storage.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    documents: Vec<Document>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Storage preloaded with documents, in order
    pub fn with_documents(documents: Vec<Document>) -> Self {
        MemoryStorage { documents }
    }
}

pub(crate) fn missing_position(position: usize, len: usize) -> QuarryError {
    QuarryError::Corruption(format!(
        "no document at position {} (collection holds {})",
        position, len
    ))
}

impl Storage for MemoryStorage {
    fn documents(&self) -> &[Document] {
        &self.documents
    }

    fn insert(&mut self, doc: Document) -> Result<()> {
        self.documents.push(doc);
        Ok(())
    }

    fn replace(&mut self, position: usize, doc: Document) -> Result<()> {
        let len = self.documents.len();
        let slot = self
            .documents
            .get_mut(position)
            .ok_or_else(|| missing_position(position, len))?;
        *slot = doc;
        Ok(())
    }

    fn remove(&mut self, position: usize) -> Result<Document> {
        if position >= self.documents.len() {
            return Err(missing_position(position, self.documents.len()));
        }
        Ok(self.documents.remove(position))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;
    use crate::value::{Map, Value};

    fn doc(id: i64, sku: &str) -> Document {
        let mut fields = Map::new();
        fields.insert("sku".to_string(), Value::from(sku));
        Document::new(DocumentId::Int(id), fields)
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut storage = MemoryStorage::new();
        storage.insert(doc(1, "P001")).unwrap();
        storage.insert(doc(2, "P002")).unwrap();
        let ids: Vec<&DocumentId> = storage.documents().iter().map(|d| &d.id).collect();
        assert_eq!(ids, vec![&DocumentId::Int(1), &DocumentId::Int(2)]);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut storage = MemoryStorage::with_documents(vec![doc(1, "P001"), doc(2, "P002")]);
        storage.replace(0, doc(1, "P001-B")).unwrap();
        assert_eq!(storage.documents()[0].get("sku"), Some(&Value::from("P001-B")));
        assert_eq!(storage.documents()[1].id, DocumentId::Int(2));
    }

    #[test]
    fn test_remove() {
        let mut storage = MemoryStorage::with_documents(vec![doc(1, "P001"), doc(2, "P002")]);
        let removed = storage.remove(0).unwrap();
        assert_eq!(removed.id, DocumentId::Int(1));
        assert_eq!(storage.len(), 1);
        assert!(matches!(storage.remove(5), Err(QuarryError::Corruption(_))));
    }

    #[test]
    fn test_flush_is_noop() {
        let mut storage = MemoryStorage::with_documents(vec![doc(1, "P001")]);
        storage.flush().unwrap();
        assert_eq!(storage.len(), 1);
    }
}
