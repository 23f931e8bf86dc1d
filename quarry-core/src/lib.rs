// quarry-core/src/lib.rs
// Embedded document store: filters, updates, schemas and aggregation pipelines

pub mod aggregation;
pub mod collection_core;
pub mod document;
pub mod durability;
pub mod error;
pub mod find_options;
pub mod logging;
pub mod options;
pub mod query;
pub mod storage;
pub mod value;
pub mod value_utils;

// Public exports
pub use aggregation::{AggregateOutput, Pipeline, StageFailure};
pub use collection_core::{
    Collection, DeleteOutcome, FieldSchema, InsertManyResult, Schema, UpdateOutcome, UpdateSpec,
};
pub use document::{Document, DocumentId, IdGenerator, ObjectIdGenerator, SequentialIdGenerator};
pub use durability::DurabilityMode;
pub use error::{QuarryError, Result, ValidationError};
pub use find_options::{FindOptions, Projection, SortDirection};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use options::{
    AggregateOptions, CollectionOptions, InsertPolicy, ValidationAction, ValidationLevel,
};
pub use query::Filter;
pub use storage::{CompactionStats, FileStorage, MemoryStorage, Storage};
pub use value::{Map, Value, ValueType};
