// quarry-core/src/collection_core/mod.rs
// Collection store: CRUD and aggregation over a storage backend
//
// Every operation takes the collection-wide lock once: reads share it, writes hold it for the
// whole read-then-write sequence, so a writer never observes a half-applied batch.

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use crate::aggregation::{AggregateOutput, Pipeline};
use crate::document::{Document, DocumentId, IdGenerator, ObjectIdGenerator};
use crate::error::{QuarryError, Result};
use crate::find_options::{apply_limit_skip, apply_sort, FindOptions};
use crate::options::{AggregateOptions, CollectionOptions, InsertPolicy, ValidationAction, ValidationLevel};
use crate::query::Filter;
use crate::storage::{CompactionStats, FileStorage, MemoryStorage, Storage};
use crate::value::Value;
use crate::{log_debug, log_trace, log_warn};

mod schema;
mod update;

pub use self::schema::{FieldSchema, Schema};
pub use self::update::{UpdateEffect, UpdateOp, UpdateSpec};

/// Result of insert_many operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<DocumentId>,
    pub inserted_count: usize,
}

/// Result of update_one / update_many
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    /// Identifier of the document created by an upsert
    pub upserted_id: Option<DocumentId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted_count: u64,
}

struct State<S> {
    storage: S,
    ids: HashSet<DocumentId>,
}

/// Named, ordered set of documents with an optional schema
///
/// Generic over the storage backend:
/// - `Collection<MemoryStorage>` - process-lifetime collections (default)
/// - `Collection<FileStorage>` - journaled collections that survive restarts
pub struct Collection<S: Storage = MemoryStorage> {
    name: String,
    state: RwLock<State<S>>,
    schema: Option<Schema>,
    options: CollectionOptions,
    id_gen: Box<dyn IdGenerator>,
}

impl Collection<MemoryStorage> {
    /// Empty in-memory collection
    ///
    /// ```
    /// use quarry_core::Collection;
    /// use serde_json::json;
    ///
    /// let productos = Collection::in_memory("productos");
    /// productos.insert_one(json!({"_id": 1, "sku": "P001"})).unwrap();
    /// assert_eq!(productos.count_documents(&json!({})).unwrap(), 1);
    /// ```
    pub fn in_memory(name: impl Into<String>) -> Self {
        Collection {
            name: name.into(),
            state: RwLock::new(State {
                storage: MemoryStorage::new(),
                ids: HashSet::new(),
            }),
            schema: None,
            options: CollectionOptions::default(),
            id_gen: Box::new(ObjectIdGenerator),
        }
    }
}

impl<S: Storage> Collection<S> {
    // ========== CONSTRUCTOR ==========

    /// Collection over an existing backend; documents already stored are kept in order
    pub fn new(name: impl Into<String>, storage: S) -> Result<Self> {
        let name = name.into();
        let mut ids = HashSet::with_capacity(storage.len());
        for doc in storage.documents() {
            if !ids.insert(doc.id.clone()) {
                return Err(QuarryError::Corruption(format!(
                    "collection '{}' holds _id {} more than once",
                    name, doc.id
                )));
            }
        }
        log_debug!("collection '{}' opened with {} documents", name, ids.len());
        Ok(Collection {
            name,
            state: RwLock::new(State { storage, ids }),
            schema: None,
            options: CollectionOptions::default(),
            id_gen: Box::new(ObjectIdGenerator),
        })
    }

    /// Bind a schema; documents already stored are not revalidated
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_options(mut self, options: CollectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_id_generator(mut self, id_gen: impl IdGenerator + 'static) -> Self {
        self.id_gen = Box::new(id_gen);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn options(&self) -> CollectionOptions {
        self.options
    }

    pub fn len(&self) -> usize {
        self.state.read().storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========== INSERT ==========

    pub fn insert_one(&self, doc: JsonValue) -> Result<DocumentId> {
        let mut state = self.state.write();
        let doc = self.prepare_insert(doc, &state.ids)?;
        let id = doc.id.clone();
        state.storage.insert(doc)?;
        state.ids.insert(id.clone());
        log_debug!("insert_one into '{}': _id {}", self.name, id);
        Ok(id)
    }

    /// Insert a batch under the collection's insert policy
    ///
    /// Failures are reported as `BatchInsert` with the ids committed before the failing index
    /// (always empty under the atomic policy).
    pub fn insert_many(&self, docs: Vec<JsonValue>) -> Result<InsertManyResult> {
        let mut state = self.state.write();
        let total = docs.len();
        let mut inserted_ids = Vec::with_capacity(total);

        match self.options.insert_policy {
            InsertPolicy::Ordered => {
                for (index, raw) in docs.into_iter().enumerate() {
                    let committed = self.prepare_insert(raw, &state.ids).and_then(|doc| {
                        let id = doc.id.clone();
                        state.storage.insert(doc)?;
                        Ok(id)
                    });
                    match committed {
                        Ok(id) => {
                            state.ids.insert(id.clone());
                            inserted_ids.push(id);
                        }
                        Err(source) => {
                            log_debug!(
                                "insert_many into '{}' stopped at {} after {} inserts",
                                self.name,
                                index,
                                inserted_ids.len()
                            );
                            return Err(batch_error(inserted_ids, index, source));
                        }
                    }
                }
            }
            InsertPolicy::Atomic => {
                let mut staged = Vec::with_capacity(total);
                let mut seen = state.ids.clone();
                for (index, raw) in docs.into_iter().enumerate() {
                    let doc = self
                        .prepare_insert(raw, &seen)
                        .map_err(|source| batch_error(Vec::new(), index, source))?;
                    seen.insert(doc.id.clone());
                    staged.push(doc);
                }
                for (index, doc) in staged.into_iter().enumerate() {
                    let id = doc.id.clone();
                    state
                        .storage
                        .insert(doc)
                        .map_err(|source| batch_error(inserted_ids.clone(), index, source))?;
                    state.ids.insert(id.clone());
                    inserted_ids.push(id);
                }
            }
        }

        log_debug!("insert_many into '{}': {} documents", self.name, inserted_ids.len());
        Ok(InsertManyResult {
            inserted_count: inserted_ids.len(),
            inserted_ids,
        })
    }

    // ========== QUERY ==========

    /// Matching documents after sort, skip, limit and projection
    pub fn find(&self, filter: &JsonValue, options: FindOptions) -> Result<Vec<Value>> {
        let filter = Filter::from_json(filter)?;
        let sort = options.sort_keys()?;
        let projection = options.parsed_projection()?;
        if let Some(hint) = &options.hint {
            log_debug!("find on '{}': hint '{}' is advisory, scanning", self.name, hint);
        }
        let deadline = options.max_time().map(|limit| Instant::now() + limit);

        let mut matched = Vec::new();
        {
            let state = self.state.read();
            for doc in state.storage.documents() {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    log_debug!("find on '{}' timed out after {} matches", self.name, matched.len());
                    return Err(QuarryError::Timeout);
                }
                if filter.matches_fields(&doc.fields) {
                    matched.push(doc.to_value());
                }
            }
        }
        log_trace!("find on '{}': {} matches", self.name, matched.len());

        apply_sort(&mut matched, &sort);
        let page = apply_limit_skip(matched, options.limit, options.skip);
        Ok(match projection {
            Some(projection) => page.iter().map(|doc| projection.apply(doc)).collect(),
            None => page,
        })
    }

    /// First match in collection order
    pub fn find_one(&self, filter: &JsonValue) -> Result<Option<Document>> {
        let filter = Filter::from_json(filter)?;
        let state = self.state.read();
        Ok(state
            .storage
            .documents()
            .iter()
            .find(|doc| filter.matches_fields(&doc.fields))
            .cloned())
    }

    pub fn count_documents(&self, filter: &JsonValue) -> Result<u64> {
        let filter = Filter::from_json(filter)?;
        let state = self.state.read();
        Ok(state
            .storage
            .documents()
            .iter()
            .filter(|doc| filter.matches_fields(&doc.fields))
            .count() as u64)
    }

    // ========== UPDATE ==========

    /// Update the first matching document, or insert one when `upsert` is set and none match
    pub fn update_one(&self, filter: &JsonValue, update: &JsonValue, upsert: bool) -> Result<UpdateOutcome> {
        let filter = Filter::from_json(filter)?;
        let spec = UpdateSpec::from_json(update)?;
        let mut state = self.state.write();

        let position = state
            .storage
            .documents()
            .iter()
            .position(|doc| filter.matches_fields(&doc.fields));

        let Some(position) = position else {
            if !upsert {
                return Ok(UpdateOutcome::default());
            }
            let fields = spec.build_upsert(&filter)?;
            let doc = Document::from_value(Value::Object(fields), self.id_gen.as_ref())?;
            if state.ids.contains(&doc.id) {
                return Err(QuarryError::DuplicateKey(doc.id));
            }
            // upserts are new documents: always fully validated
            self.check(&doc, None)?;
            let id = doc.id.clone();
            state.storage.insert(doc)?;
            state.ids.insert(id.clone());
            log_debug!("update_one on '{}': upserted _id {}", self.name, id);
            return Ok(UpdateOutcome {
                matched_count: 0,
                modified_count: 0,
                upserted_id: Some(id),
            });
        };

        let current = &state.storage.documents()[position];
        let Some(updated) = self.stage_update(current, &spec)? else {
            log_trace!("update_one on '{}': _id {} unchanged", self.name, current.id);
            return Ok(UpdateOutcome {
                matched_count: 1,
                ..UpdateOutcome::default()
            });
        };
        log_debug!("update_one on '{}': _id {}", self.name, updated.id);
        state.storage.replace(position, updated)?;
        Ok(UpdateOutcome {
            matched_count: 1,
            modified_count: 1,
            upserted_id: None,
        })
    }

    /// Update every matching document
    ///
    /// All-or-nothing: every new version is computed and validated before the first write.
    pub fn update_many(&self, filter: &JsonValue, update: &JsonValue) -> Result<UpdateOutcome> {
        let filter = Filter::from_json(filter)?;
        let spec = UpdateSpec::from_json(update)?;
        let mut state = self.state.write();

        let mut matched = 0u64;
        let mut staged = Vec::new();
        for (position, doc) in state.storage.documents().iter().enumerate() {
            if !filter.matches_fields(&doc.fields) {
                continue;
            }
            matched += 1;
            if let Some(updated) = self.stage_update(doc, &spec)? {
                staged.push((position, updated));
            }
        }

        let modified = staged.len() as u64;
        for (position, doc) in staged {
            state.storage.replace(position, doc)?;
        }
        log_debug!(
            "update_many on '{}': matched {}, modified {}",
            self.name,
            matched,
            modified
        );
        Ok(UpdateOutcome {
            matched_count: matched,
            modified_count: modified,
            upserted_id: None,
        })
    }

    // ========== DELETE ==========

    pub fn delete_one(&self, filter: &JsonValue) -> Result<DeleteOutcome> {
        let filter = Filter::from_json(filter)?;
        let mut state = self.state.write();
        let position = state
            .storage
            .documents()
            .iter()
            .position(|doc| filter.matches_fields(&doc.fields));
        let Some(position) = position else {
            return Ok(DeleteOutcome::default());
        };
        let removed = state.storage.remove(position)?;
        state.ids.remove(&removed.id);
        log_debug!("delete_one on '{}': _id {}", self.name, removed.id);
        Ok(DeleteOutcome { deleted_count: 1 })
    }

    pub fn delete_many(&self, filter: &JsonValue) -> Result<DeleteOutcome> {
        let filter = Filter::from_json(filter)?;
        let mut state = self.state.write();
        let positions: Vec<usize> = state
            .storage
            .documents()
            .iter()
            .enumerate()
            .filter(|(_, doc)| filter.matches_fields(&doc.fields))
            .map(|(position, _)| position)
            .collect();

        // back to front so earlier positions stay valid
        for &position in positions.iter().rev() {
            let removed = state.storage.remove(position)?;
            state.ids.remove(&removed.id);
        }
        log_debug!("delete_many on '{}': {} documents", self.name, positions.len());
        Ok(DeleteOutcome {
            deleted_count: positions.len() as u64,
        })
    }

    // ========== AGGREGATION ==========

    pub fn aggregate(&self, pipeline: &JsonValue) -> Result<AggregateOutput> {
        self.aggregate_with_options(pipeline, AggregateOptions::default())
    }

    /// Run a pipeline over a snapshot of the collection
    ///
    /// The read lock is released before the first stage runs.
    pub fn aggregate_with_options(
        &self,
        pipeline: &JsonValue,
        options: AggregateOptions,
    ) -> Result<AggregateOutput> {
        let pipeline = Pipeline::from_json(pipeline)?;
        let docs: Vec<Value> = {
            let state = self.state.read();
            state.storage.documents().iter().map(Document::to_value).collect()
        };
        log_debug!(
            "aggregate on '{}': {} stages over {} documents",
            self.name,
            pipeline.stages().len(),
            docs.len()
        );
        let output = pipeline.execute_with_options(docs, options)?;
        if !output.is_clean() {
            log_debug!(
                "aggregate on '{}': {} documents dropped by stage failures",
                self.name,
                output.failures.len()
            );
        }
        Ok(output)
    }

    /// Push pending writes to the backend
    pub fn flush(&self) -> Result<()> {
        self.state.write().storage.flush()
    }

    // ========== PRIVATE HELPERS ==========

    fn prepare_insert(&self, raw: JsonValue, taken: &HashSet<DocumentId>) -> Result<Document> {
        let doc = Document::from_value(Value::from_json(raw), self.id_gen.as_ref())?;
        if taken.contains(&doc.id) {
            return Err(QuarryError::DuplicateKey(doc.id));
        }
        self.check(&doc, None)?;
        Ok(doc)
    }

    /// New version of `doc`, or `None` when the update leaves it unchanged
    fn stage_update(&self, doc: &Document, spec: &UpdateSpec) -> Result<Option<Document>> {
        let mut fields = doc.fields.clone();
        let effect = spec.apply(&mut fields)?;
        if !effect.modified {
            return Ok(None);
        }
        let updated = Document::new(doc.id.clone(), fields);
        self.check(&updated, Some(effect.touched.as_slice()))?;
        Ok(Some(updated))
    }

    /// Validate against the bound schema; `touched` limits relaxed-level checks
    fn check(&self, doc: &Document, touched: Option<&[String]>) -> Result<()> {
        let Some(schema) = &self.schema else {
            return Ok(());
        };
        let value = doc.to_value();
        let verdict = match (touched, self.options.validation_level) {
            (Some(fields), ValidationLevel::Relaxed) => schema.validate_fields(&value, fields),
            _ => schema.validate(&value),
        };
        match verdict {
            Ok(()) => Ok(()),
            Err(err) if self.options.validation_action == ValidationAction::Warn => {
                log_warn!(
                    "collection '{}': _id {} fails validation, committed anyway: {}",
                    self.name,
                    doc.id,
                    err
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Collection<FileStorage> {
    /// Rewrite the journal as a snapshot of the live documents
    pub fn compact(&self) -> Result<CompactionStats> {
        let stats = self.state.write().storage.compact()?;
        log_debug!(
            "compacted '{}': {} -> {} bytes",
            self.name,
            stats.size_before,
            stats.size_after
        );
        Ok(stats)
    }
}

fn batch_error(inserted_ids: Vec<DocumentId>, failed_index: usize, source: QuarryError) -> QuarryError {
    QuarryError::BatchInsert {
        inserted_ids,
        failed_index,
        source: Box::new(source),
    }
}
