// src/storage/mod.rs
//! Document storage backends
//!
//! A collection keeps its documents in a [`Storage`] implementation, which owns the
//! ordered document set and decides how mutations are persisted.

mod file_storage;
mod memory_storage;
mod traits;

pub use file_storage::{CompactionStats, FileStorage};
pub use memory_storage::MemoryStorage;
pub use traits::Storage;
