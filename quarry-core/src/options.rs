// quarry-core/src/options.rs
// Collection and aggregation configuration

use serde::{Deserialize, Serialize};

/// How much of a document is revalidated after an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Revalidate the whole document after every write
    #[default]
    Strict,
    /// Inserts are validated fully; updates only check the top-level fields they touch
    Relaxed,
}

/// What happens when a write fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidationAction {
    /// Reject the write
    #[default]
    Error,
    /// Log a warning and commit anyway
    Warn,
}

/// Failure policy for `insert_many`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InsertPolicy {
    /// Commit documents up to the first failure
    #[default]
    Ordered,
    /// Validate the whole batch first; commit nothing on failure
    Atomic,
}

/// Options bound to a collection at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CollectionOptions {
    pub validation_level: ValidationLevel,
    pub validation_action: ValidationAction,
    pub insert_policy: InsertPolicy,
}

impl CollectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validation_level(mut self, level: ValidationLevel) -> Self {
        self.validation_level = level;
        self
    }

    pub fn with_validation_action(mut self, action: ValidationAction) -> Self {
        self.validation_action = action;
        self
    }

    pub fn with_insert_policy(mut self, policy: InsertPolicy) -> Self {
        self.insert_policy = policy;
        self
    }
}

/// Options for a single aggregate call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateOptions {
    /// Run `$facet` sub-pipelines on scoped threads
    pub parallel_facets: bool,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        AggregateOptions {
            parallel_facets: true,
        }
    }
}

impl AggregateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallel_facets(mut self, parallel: bool) -> Self {
        self.parallel_facets = parallel;
        self
    }
}
