// src/document.rs
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuarryError, Result};
use crate::value::{Map, Value};

/// Document identifier
///
/// Untagged so it serializes as a plain value: `{"_id": 2}`, `{"_id": "P001"}`.
/// ObjectIds are UUID v4 strings. Equality and hashing follow the stored `_id` value, so an
/// ObjectId and a `String` id with the same text are the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentId {
    Int(i64),
    String(String),
    ObjectId(String),
}

impl DocumentId {
    /// New ObjectId (UUID v4)
    pub fn new_object_id() -> Self {
        DocumentId::ObjectId(Uuid::new_v4().to_string())
    }

    fn text(&self) -> Option<&str> {
        match self {
            DocumentId::Int(_) => None,
            DocumentId::String(s) | DocumentId::ObjectId(s) => Some(s.as_str()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DocumentId::Int(n) => Value::Int(*n),
            DocumentId::String(s) | DocumentId::ObjectId(s) => Value::String(s.clone()),
        }
    }

    /// Identifier from a caller-supplied `_id` value
    ///
    /// Integral floats are accepted as `Int`; every other type is rejected.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(n) => Ok(DocumentId::Int(*n)),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(DocumentId::Int(*f as i64)),
            Value::String(s) => Ok(DocumentId::String(s.clone())),
            other => Err(QuarryError::TypeError(format!(
                "_id must be an int or string, found {}",
                other.value_type()
            ))),
        }
    }
}

impl PartialEq for DocumentId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DocumentId::Int(a), DocumentId::Int(b)) => a == b,
            _ => self.text().is_some() && self.text() == other.text(),
        }
    }
}

impl Eq for DocumentId {}

impl Hash for DocumentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            DocumentId::Int(n) => {
                0u8.hash(state);
                n.hash(state);
            }
            DocumentId::String(s) | DocumentId::ObjectId(s) => {
                1u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentId::Int(n) => write!(f, "{}", n),
            DocumentId::String(s) => write!(f, "\"{}\"", s),
            DocumentId::ObjectId(s) => write!(f, "ObjectId(\"{}\")", s),
        }
    }
}

/// Source of fresh identifiers for documents inserted without `_id`
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> DocumentId;
}

/// Random UUID v4 identifiers (default)
#[derive(Debug, Default)]
pub struct ObjectIdGenerator;

impl IdGenerator for ObjectIdGenerator {
    fn next_id(&self) -> DocumentId {
        DocumentId::new_object_id()
    }
}

/// Monotonic integer identifiers starting after `start`
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    last: AtomicI64,
}

impl SequentialIdGenerator {
    pub fn new(start: i64) -> Self {
        SequentialIdGenerator {
            last: AtomicI64::new(start),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> DocumentId {
        DocumentId::Int(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Stored document
///
/// `fields` always carries `_id` as its first entry, mirroring `id`, so the matcher and
/// the pipeline see the identifier like any other field.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub fields: Map,
}

impl Document {
    pub fn new(id: DocumentId, mut fields: Map) -> Self {
        fields.shift_remove("_id");
        let mut ordered = Map::with_capacity(fields.len() + 1);
        ordered.insert("_id".to_string(), id.to_value());
        ordered.extend(fields);
        Document { id, fields: ordered }
    }

    /// Build a document from an object value, taking `_id` from it or from `ids`
    pub fn from_value(value: Value, ids: &dyn IdGenerator) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(QuarryError::TypeError(format!(
                "document must be an object, found {}",
                value.value_type()
            )));
        };
        let id = match fields.shift_remove("_id") {
            Some(raw) => DocumentId::from_value(&raw)?,
            None => ids.next_id(),
        };
        Ok(Document::new(id, fields))
    }

    /// Document as an object value (`_id` first)
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Field lookup with dot notation
    pub fn get(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return None;
        }
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

impl Serialize for Document {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut fields = Map::deserialize(deserializer)?;
        let raw = fields
            .shift_remove("_id")
            .ok_or_else(|| serde::de::Error::missing_field("_id"))?;
        let id = DocumentId::from_value(&raw).map_err(serde::de::Error::custom)?;
        Ok(Document::new(id, fields))
    }
}
