//! Durability modes for the file-backed journal
//!
//! Controls when journal writes are flushed and synced to disk.

use serde::{Deserialize, Serialize};

/// Durability mode determines when [`FileStorage`](crate::storage::FileStorage) syncs
///
/// - **Safe**: every mutation is flushed and fsynced before the call returns
/// - **Batch**: fsync after every `batch_size` mutations; at most that many are lost on crash
/// - **Manual**: writes are buffered until the caller invokes `flush()`
///
/// ```rust
/// use quarry_core::DurabilityMode;
///
/// let mode = DurabilityMode::Batch { batch_size: 100 };
/// assert_eq!(mode.batch_size(), Some(100));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DurabilityMode {
    #[default]
    Safe,

    Batch {
        /// Mutations between syncs
        batch_size: usize,
    },

    Manual,
}

impl DurabilityMode {
    /// Whether the storage syncs on its own
    pub fn is_auto_commit(&self) -> bool {
        !matches!(self, DurabilityMode::Manual)
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, DurabilityMode::Safe)
    }

    pub fn batch_size(&self) -> Option<usize> {
        match self {
            DurabilityMode::Batch { batch_size } => Some(*batch_size),
            _ => None,
        }
    }

    /// Whether a sync is due after `pending` unsynced mutations
    pub fn should_sync(&self, pending: usize) -> bool {
        match self {
            DurabilityMode::Safe => pending > 0,
            DurabilityMode::Batch { batch_size } => pending >= (*batch_size).max(1),
            DurabilityMode::Manual => false,
        }
    }
}
