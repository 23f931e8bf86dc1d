// quarry-core/src/error.rs
// Error taxonomy shared by every engine component

use thiserror::Error;

use crate::document::DocumentId;

/// Schema violation found while validating a document
///
/// Field names are dotted paths when the violation sits inside a nested object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingRequiredField(String),

    #[error("field '{field}' expected type {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("field '{field}' violates constraint: {reason}")]
    ConstraintViolation { field: String, reason: String },

    #[error("unknown field '{0}' is not allowed by the schema")]
    UnknownField(String),
}

impl ValidationError {
    /// Name of the offending field (dotted path)
    pub fn field(&self) -> &str {
        match self {
            ValidationError::MissingRequiredField(field)
            | ValidationError::UnknownField(field)
            | ValidationError::TypeMismatch { field, .. }
            | ValidationError::ConstraintViolation { field, .. } => field,
        }
    }

    /// Re-root the error under a parent field, used when recursing into nested schemas
    pub(crate) fn nested_under(self, parent: &str) -> Self {
        let prefix = |field: String| format!("{}.{}", parent, field);
        match self {
            ValidationError::MissingRequiredField(field) => {
                ValidationError::MissingRequiredField(prefix(field))
            }
            ValidationError::UnknownField(field) => ValidationError::UnknownField(prefix(field)),
            ValidationError::TypeMismatch {
                field,
                expected,
                found,
            } => ValidationError::TypeMismatch {
                field: prefix(field),
                expected,
                found,
            },
            ValidationError::ConstraintViolation { field, reason } => {
                ValidationError::ConstraintViolation {
                    field: prefix(field),
                    reason,
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum QuarryError {
    #[error("document failed validation: {0}")]
    Validation(#[from] ValidationError),

    #[error("type error: {0}")]
    TypeError(String),

    #[error("arithmetic error: {0}")]
    ArithmeticError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("duplicate _id {0}")]
    DuplicateKey(DocumentId),

    #[error("batch insert stopped at document {failed_index} after {} inserts: {source}", .inserted_ids.len())]
    BatchInsert {
        inserted_ids: Vec<DocumentId>,
        failed_index: usize,
        #[source]
        source: Box<QuarryError>,
    },

    #[error("operation exceeded its time limit")]
    Timeout,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage corruption: {0}")]
    Corruption(String),
}

impl From<serde_json::Error> for QuarryError {
    fn from(err: serde_json::Error) -> Self {
        QuarryError::Serialization(err.to_string())
    }
}

impl QuarryError {
    /// Errors that only invalidate a single document's computation inside a stage
    pub fn is_document_local(&self) -> bool {
        matches!(
            self,
            QuarryError::TypeError(_) | QuarryError::ArithmeticError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QuarryError>;
