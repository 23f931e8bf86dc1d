// src/query.rs
//! Query filters
//!
//! A [`Filter`] is parsed once from its JSON form into a closed tree of combinators and
//! field conditions, then evaluated against any number of documents:
//!
//! ```
//! use quarry_core::{Filter, Value};
//! use serde_json::json;
//!
//! let filter = Filter::from_json(&json!({"categoria": "Pinturas", "precio": {"$lt": 5000}})).unwrap();
//! let doc = Value::from_json(json!({"categoria": "Pinturas", "precio": 4200}));
//! assert!(filter.matches(&doc));
//! ```
//!
//! Multiple top-level keys, and multiple operators on one field, combine with AND.
//! Malformed filters fail at construction with `InvalidQuery`; evaluation never fails.

pub mod operators;

use serde_json::Value as JsonValue;

use crate::error::{QuarryError, Result};
use crate::value::{map_path_terminals, Map, Value};

pub use operators::{Condition, Pattern};

#[derive(Debug, Clone)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Field { path: String, condition: Condition },
}

impl Default for Filter {
    /// The empty filter, matching every document
    fn default() -> Self {
        Filter::And(Vec::new())
    }
}

impl Filter {
    /// Filter matching every document
    pub fn all() -> Self {
        Filter::default()
    }

    pub fn from_json(json: &JsonValue) -> Result<Self> {
        let obj = json.as_object().ok_or_else(|| {
            QuarryError::InvalidQuery(format!("filter must be an object, got {}", json))
        })?;

        let mut clauses = Vec::with_capacity(obj.len());
        for (key, operand) in obj {
            match key.as_str() {
                "$and" => clauses.push(Filter::And(parse_clause_list(key, operand)?)),
                "$or" => clauses.push(Filter::Or(parse_clause_list(key, operand)?)),
                "$nor" => clauses.push(Filter::Nor(parse_clause_list(key, operand)?)),
                op if op.starts_with('$') => {
                    return Err(QuarryError::InvalidQuery(format!(
                        "unknown top-level operator '{}'",
                        op
                    )))
                }
                path => parse_field(path, operand, &mut clauses)?,
            }
        }

        if clauses.len() == 1 {
            return Ok(clauses.remove(0));
        }
        Ok(Filter::And(clauses))
    }

    /// Evaluate against a document value; non-objects only match the empty filter
    pub fn matches(&self, doc: &Value) -> bool {
        match doc {
            Value::Object(fields) => self.matches_fields(fields),
            _ => matches!(self, Filter::And(clauses) if clauses.is_empty()),
        }
    }

    /// Evaluate against a document's field map
    pub fn matches_fields(&self, fields: &Map) -> bool {
        match self {
            Filter::And(clauses) => clauses.iter().all(|c| c.matches_fields(fields)),
            Filter::Or(clauses) => clauses.iter().any(|c| c.matches_fields(fields)),
            Filter::Nor(clauses) => !clauses.iter().any(|c| c.matches_fields(fields)),
            Filter::Field { path, condition } => {
                condition.matches(&map_path_terminals(fields, path))
            }
        }
    }

    /// Top-level equality leaves, used to seed an upserted document
    ///
    /// Walks nested `$and` clauses but never `$or`/`$nor`.
    pub fn equality_seeds(&self) -> Vec<(&str, &Value)> {
        let mut seeds = Vec::new();
        self.collect_seeds(&mut seeds);
        seeds
    }

    fn collect_seeds<'a>(&'a self, seeds: &mut Vec<(&'a str, &'a Value)>) {
        match self {
            Filter::And(clauses) => clauses.iter().for_each(|c| c.collect_seeds(seeds)),
            Filter::Field {
                path,
                condition: Condition::Eq(value),
            } => seeds.push((path.as_str(), value)),
            _ => {}
        }
    }
}

fn parse_clause_list(op: &str, operand: &JsonValue) -> Result<Vec<Filter>> {
    let items = operand.as_array().ok_or_else(|| {
        QuarryError::InvalidQuery(format!("{} requires an array of filters", op))
    })?;
    if items.is_empty() {
        return Err(QuarryError::InvalidQuery(format!(
            "{} requires a non-empty array",
            op
        )));
    }
    items.iter().map(Filter::from_json).collect()
}

/// An object operand is an operator map when its keys start with `$`
///
/// `{"$date": ...}` is a literal date, not an operator.
fn is_operator_map(obj: &serde_json::Map<String, JsonValue>) -> bool {
    !obj.is_empty()
        && obj.keys().any(|k| k.starts_with('$'))
        && !(obj.len() == 1 && obj.contains_key("$date"))
}

fn parse_field(path: &str, operand: &JsonValue, clauses: &mut Vec<Filter>) -> Result<()> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(QuarryError::InvalidQuery(format!(
            "invalid field path '{}'",
            path
        )));
    }

    match operand {
        JsonValue::Object(ops) if is_operator_map(ops) => {
            if let Some(key) = ops.keys().find(|k| !k.starts_with('$')) {
                return Err(QuarryError::InvalidQuery(format!(
                    "field '{}' mixes operators with literal key '{}'",
                    path, key
                )));
            }
            for condition in Condition::parse_operators(path, ops)? {
                clauses.push(Filter::Field {
                    path: path.to_string(),
                    condition,
                });
            }
        }
        literal => clauses.push(Filter::Field {
            path: path.to_string(),
            condition: Condition::Eq(Value::from_json(literal.clone())),
        }),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(json: JsonValue) -> Value {
        Value::from_json(json)
    }

    fn taladro() -> Value {
        doc(json!({
            "_id": 4,
            "sku": "P004",
            "nombre": "Taladro Inalámbrico 18V",
            "categoria": "Eléctricas",
            "precio": 45000,
            "stock": 8,
            "tags": ["electrica", "bateria"],
            "proveedor": {"nombre": "VoltCR", "email": "ventas@voltcr.com"},
            "creadoEn": {"$date": "2025-03-04T12:00:00Z"}
        }))
    }

    fn check(filter: JsonValue) -> bool {
        Filter::from_json(&filter).unwrap().matches(&taladro())
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(check(json!({})));
        assert!(Filter::all().matches(&Value::Int(1)));
    }

    #[test]
    fn test_implicit_and() {
        assert!(check(json!({"categoria": "Eléctricas", "stock": {"$lt": 10}})));
        assert!(!check(json!({"categoria": "Eléctricas", "stock": {"$gt": 10}})));
        assert!(check(json!({"precio": {"$gte": 40000, "$lte": 50000}})));
        assert!(!check(json!({"precio": {"$gte": 40000, "$lte": 41000}})));
    }

    #[test]
    fn test_or_and_nor() {
        assert!(check(json!({"$or": [{"stock": {"$lt": 5}}, {"categoria": "Eléctricas"}]})));
        assert!(!check(json!({"$nor": [{"stock": {"$lt": 10}}]})));
        assert!(check(json!({"$and": [{"sku": {"$regex": "^p", "$options": "i"}}, {"tags": "bateria"}]})));
    }

    #[test]
    fn test_nested_path() {
        assert!(check(json!({"proveedor.nombre": "VoltCR"})));
        assert!(!check(json!({"proveedor.telefono": {"$exists": true}})));
        assert!(check(json!({"proveedor.telefono": {"$exists": false}})));
    }

    #[test]
    fn test_date_range() {
        assert!(check(json!({"creadoEn": {
            "$gte": {"$date": "2025-03-04T00:00:00Z"},
            "$lt": {"$date": "2025-03-05T00:00:00Z"}
        }})));
        assert!(check(json!({"creadoEn": {"$date": "2025-03-04T12:00:00Z"}})));
    }

    #[test]
    fn test_tags_not_empty() {
        assert!(check(json!({"tags": {"$exists": true, "$ne": []}})));
    }

    #[test]
    fn test_literal_object_equality() {
        assert!(check(json!({"proveedor": {"email": "ventas@voltcr.com", "nombre": "VoltCR"}})));
        assert!(!check(json!({"proveedor": {"nombre": "VoltCR"}})));
    }

    #[test]
    fn test_construction_errors() {
        for bad in [
            json!([1]),
            json!({"$where": "1"}),
            json!({"$or": {}}),
            json!({"$or": []}),
            json!({"precio": {"$gt": 1, "moneda": "CRC"}}),
            json!({"precio": {"$between": [1, 2]}}),
            json!({"a..b": 1}),
        ] {
            let err = Filter::from_json(&bad).unwrap_err();
            assert!(matches!(err, QuarryError::InvalidQuery(_)), "{} -> {}", bad, err);
        }
    }

    #[test]
    fn test_equality_seeds() {
        let filter = Filter::from_json(&json!({
            "sku": "P999",
            "stock": {"$eq": 0},
            "precio": {"$gt": 5},
            "$and": [{"marca": "Acme"}],
            "$or": [{"categoria": "Pinturas"}]
        }))
        .unwrap();
        let seeds: Vec<(&str, String)> = filter
            .equality_seeds()
            .into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();
        assert_eq!(
            seeds,
            vec![
                ("sku", "\"P999\"".to_string()),
                ("stock", "0".to_string()),
                ("marca", "\"Acme\"".to_string())
            ]
        );
    }
}
