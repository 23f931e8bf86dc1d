// storage/file_storage.rs
//! File-backed storage
//!
//! Documents live in memory; every mutation is appended to a journal file that is
//! replayed on open.
//!
//! # Journal format
//!
//! One record per line: `<crc32 as 8 hex digits> <json record>`. The checksum covers the
//! JSON text. A line whose checksum does not match, or that does not parse, fails the open
//! with `Corruption`.
//!
//! ```text
//! 3f1c2a9e {"op":"insert","doc":{"_id":1,"sku":"P001"}}
//! 0b77d210 {"op":"replace","id":1,"doc":{"_id":1,"sku":"P001","stock":39}}
//! 91e0c4f1 {"op":"remove","id":1}
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::memory_storage::missing_position;
use crate::document::{Document, DocumentId};
use crate::durability::DurabilityMode;
use crate::error::{QuarryError, Result};
use crate::storage::Storage;
use crate::{log_debug, log_trace};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum JournalRecord {
    Insert { doc: Document },
    Replace { id: DocumentId, doc: Document },
    Remove { id: DocumentId },
}

/// Compaction statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub size_before: u64,
    pub size_after: u64,
    pub records_before: usize,
    pub records_after: usize,
}

impl CompactionStats {
    pub fn space_saved(&self) -> u64 {
        self.size_before.saturating_sub(self.size_after)
    }
}

fn encode_line(record: &JournalRecord) -> Result<String> {
    let json = serde_json::to_string(record)?;
    let checksum = crc32fast::hash(json.as_bytes());
    Ok(format!("{:08x} {}\n", checksum, json))
}

fn decode_line(line: &str, line_no: usize) -> Result<JournalRecord> {
    let corrupt = |reason: &str| {
        QuarryError::Corruption(format!("journal line {}: {}", line_no, reason))
    };
    let (checksum, json) = line
        .split_once(' ')
        .ok_or_else(|| corrupt("missing checksum separator"))?;
    let expected = u32::from_str_radix(checksum, 16).map_err(|_| corrupt("malformed checksum"))?;
    if crc32fast::hash(json.as_bytes()) != expected {
        return Err(corrupt("checksum mismatch"));
    }
    serde_json::from_str(json).map_err(|e| corrupt(&format!("unreadable record: {}", e)))
}

/// Replay a journal into the document list it describes
fn replay(path: &Path) -> Result<(Vec<Document>, usize)> {
    let mut documents: Vec<Document> = Vec::new();
    let mut records = 0;
    let reader = BufReader::new(File::open(path)?);

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        records += 1;
        match decode_line(&line, index + 1)? {
            JournalRecord::Insert { doc } => documents.push(doc),
            JournalRecord::Replace { id, doc } => {
                let slot = documents.iter_mut().find(|d| d.id == id).ok_or_else(|| {
                    QuarryError::Corruption(format!(
                        "journal line {}: replace of unknown _id {}",
                        index + 1,
                        id
                    ))
                })?;
                *slot = doc;
            }
            JournalRecord::Remove { id } => {
                let position = documents.iter().position(|d| d.id == id).ok_or_else(|| {
                    QuarryError::Corruption(format!(
                        "journal line {}: remove of unknown _id {}",
                        index + 1,
                        id
                    ))
                })?;
                documents.remove(position);
            }
        }
    }
    Ok((documents, records))
}

/// File-backed storage with an append-only journal
///
/// ```no_run
/// use quarry_core::storage::FileStorage;
/// use quarry_core::DurabilityMode;
///
/// let storage = FileStorage::open_with_durability(
///     "productos.journal",
///     DurabilityMode::Batch { batch_size: 64 },
/// )?;
/// # Ok::<(), quarry_core::QuarryError>(())
/// ```
pub struct FileStorage {
    path: PathBuf,
    writer: BufWriter<File>,
    documents: Vec<Document>,
    durability: DurabilityMode,
    /// Mutations written since the last sync
    pending: usize,
    /// Records currently in the journal
    records: usize,
}

impl FileStorage {
    /// Open or create a journal with `Safe` durability
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_durability(path, DurabilityMode::default())
    }

    pub fn open_with_durability<P: AsRef<Path>>(path: P, durability: DurabilityMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let (documents, records) = replay(&path)?;
        log_debug!(
            "opened journal {:?}: {} records, {} documents",
            path,
            records,
            documents.len()
        );

        Ok(FileStorage {
            path,
            writer: BufWriter::new(file),
            documents,
            durability,
            pending: 0,
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    /// Journal records not yet synced to disk
    pub fn pending_writes(&self) -> usize {
        self.pending
    }

    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let line = encode_line(record)?;
        self.writer.write_all(line.as_bytes())?;
        self.records += 1;
        self.pending += 1;
        if self.durability.should_sync(self.pending) {
            self.sync()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        log_trace!("synced {} journal records to {:?}", self.pending, self.path);
        self.pending = 0;
        Ok(())
    }

    /// Rewrite the journal as one insert per live document
    pub fn compact(&mut self) -> Result<CompactionStats> {
        self.sync()?;
        let mut stats = CompactionStats {
            size_before: fs::metadata(&self.path)?.len(),
            records_before: self.records,
            ..CompactionStats::default()
        };

        let temp_path = PathBuf::from(format!("{}.compact", self.path.display()));
        {
            let mut temp = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&temp_path)?,
            );
            for doc in &self.documents {
                let line = encode_line(&JournalRecord::Insert { doc: doc.clone() })?;
                temp.write_all(line.as_bytes())?;
            }
            temp.flush()?;
            temp.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.records = self.documents.len();

        stats.size_after = fs::metadata(&self.path)?.len();
        stats.records_after = self.records;
        log_debug!(
            "compacted {:?}: {} -> {} records, {} bytes saved",
            self.path,
            stats.records_before,
            stats.records_after,
            stats.space_saved()
        );
        Ok(stats)
    }
}

impl Storage for FileStorage {
    fn documents(&self) -> &[Document] {
        &self.documents
    }

    fn insert(&mut self, doc: Document) -> Result<()> {
        self.append(&JournalRecord::Insert { doc: doc.clone() })?;
        self.documents.push(doc);
        Ok(())
    }

    fn replace(&mut self, position: usize, doc: Document) -> Result<()> {
        let id = self
            .documents
            .get(position)
            .map(|d| d.id.clone())
            .ok_or_else(|| missing_position(position, self.documents.len()))?;
        self.append(&JournalRecord::Replace {
            id,
            doc: doc.clone(),
        })?;
        self.documents[position] = doc;
        Ok(())
    }

    fn remove(&mut self, position: usize) -> Result<Document> {
        let id = self
            .documents
            .get(position)
            .map(|d| d.id.clone())
            .ok_or_else(|| missing_position(position, self.documents.len()))?;
        self.append(&JournalRecord::Remove { id })?;
        Ok(self.documents.remove(position))
    }

    fn flush(&mut self) -> Result<()> {
        self.sync()
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if self.pending > 0 && self.durability.is_auto_commit() {
            let _ = self.sync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Map, Value};
    use tempfile::TempDir;

    fn doc(id: i64, stock: i64) -> Document {
        let mut fields = Map::new();
        fields.insert("sku".to_string(), Value::from(format!("P{:03}", id)));
        fields.insert("stock".to_string(), Value::Int(stock));
        Document::new(DocumentId::Int(id), fields)
    }

    #[test]
    fn test_reopen_replays_journal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("productos.journal");
        {
            let mut storage = FileStorage::open(&path).unwrap();
            storage.insert(doc(1, 40)).unwrap();
            storage.insert(doc(2, 12)).unwrap();
            storage.insert(doc(3, 8)).unwrap();
            storage.replace(0, doc(1, 39)).unwrap();
            storage.remove(1).unwrap();
        }
        let storage = FileStorage::open(&path).unwrap();
        let docs = storage.documents();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0], doc(1, 39));
        assert_eq!(docs[1], doc(3, 8));
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("productos.journal");
        {
            let mut storage = FileStorage::open(&path).unwrap();
            storage.insert(doc(1, 40)).unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        fs::write(&path, contents.replace("40", "41")).unwrap();

        match FileStorage::open(&path) {
            Err(QuarryError::Corruption(msg)) => assert!(msg.contains("checksum")),
            Err(other) => panic!("expected corruption, got {}", other),
            Ok(_) => panic!("expected corruption"),
        }
    }

    #[test]
    fn test_garbage_line_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("productos.journal");
        fs::write(&path, "not a journal line\n").unwrap();
        assert!(matches!(FileStorage::open(&path), Err(QuarryError::Corruption(_))));
    }

    #[test]
    fn test_compact_rewrites_live_documents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("productos.journal");
        let mut storage = FileStorage::open(&path).unwrap();
        for id in 1..=5 {
            storage.insert(doc(id, 10)).unwrap();
        }
        for _ in 0..3 {
            storage.remove(0).unwrap();
        }
        storage.replace(0, doc(4, 0)).unwrap();

        let stats = storage.compact().unwrap();
        assert_eq!(stats.records_before, 9);
        assert_eq!(stats.records_after, 2);
        assert!(stats.space_saved() > 0);

        storage.insert(doc(6, 1)).unwrap();
        drop(storage);

        let reopened = FileStorage::open(&path).unwrap();
        let ids: Vec<&DocumentId> = reopened.documents().iter().map(|d| &d.id).collect();
        assert_eq!(ids, vec![&DocumentId::Int(4), &DocumentId::Int(5), &DocumentId::Int(6)]);
        assert_eq!(reopened.documents()[0], doc(4, 0));
    }

    #[test]
    fn test_batch_durability_syncs_every_n() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("productos.journal");
        let mut storage =
            FileStorage::open_with_durability(&path, DurabilityMode::Batch { batch_size: 3 }).unwrap();
        storage.insert(doc(1, 1)).unwrap();
        storage.insert(doc(2, 1)).unwrap();
        assert_eq!(storage.pending_writes(), 2);
        storage.insert(doc(3, 1)).unwrap();
        assert_eq!(storage.pending_writes(), 0);
    }

    #[test]
    fn test_manual_durability_waits_for_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("productos.journal");
        let mut storage = FileStorage::open_with_durability(&path, DurabilityMode::Manual).unwrap();
        storage.insert(doc(1, 1)).unwrap();
        assert_eq!(storage.pending_writes(), 1);
        storage.flush().unwrap();
        assert_eq!(storage.pending_writes(), 0);

        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.documents().len(), 1);
    }
}
