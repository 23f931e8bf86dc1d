use serde_json::Value as JsonValue;

use crate::error::{QuarryError, Result};
use crate::query::Filter;
use crate::value::{Map, Value};
use crate::value_utils::{remove_path, set_path};

/// One field-level update operation
#[derive(Debug, Clone)]
pub enum UpdateOp {
    Set { path: String, value: Value },
    Inc { path: String, delta: Value },
    Unset { path: String },
    Push { path: String, items: Vec<Value> },
}

impl UpdateOp {
    pub fn path(&self) -> &str {
        match self {
            UpdateOp::Set { path, .. }
            | UpdateOp::Inc { path, .. }
            | UpdateOp::Unset { path }
            | UpdateOp::Push { path, .. } => path,
        }
    }
}

/// Parsed update document, e.g. `{"$set": {"precio": 7900}, "$inc": {"stock": 5}}`
#[derive(Debug, Clone)]
pub struct UpdateSpec {
    ops: Vec<UpdateOp>,
}

/// What applying an update did to a document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateEffect {
    pub modified: bool,
    /// Top-level fields named by the update, in first-seen order
    pub touched: Vec<String>,
}

impl UpdateSpec {
    pub fn from_json(update: &JsonValue) -> Result<Self> {
        let obj = update.as_object().ok_or_else(|| {
            QuarryError::InvalidQuery("update must be an object of operators".to_string())
        })?;
        if obj.is_empty() {
            return Err(QuarryError::InvalidQuery(
                "update must contain at least one operator".to_string(),
            ));
        }

        let mut ops = Vec::new();
        for (op, fields) in obj {
            let fields = fields.as_object().ok_or_else(|| {
                QuarryError::InvalidQuery(format!("{} requires an object of fields", op))
            })?;
            for (path, raw) in fields {
                check_path(op, path)?;
                let parsed = match op.as_str() {
                    "$set" => UpdateOp::Set {
                        path: path.clone(),
                        value: Value::from_json(raw.clone()),
                    },
                    "$inc" => {
                        let delta = Value::from_json(raw.clone());
                        if !delta.is_number() {
                            return Err(QuarryError::TypeError(format!(
                                "$inc on '{}' requires a numeric delta, got {}",
                                path,
                                delta.value_type()
                            )));
                        }
                        UpdateOp::Inc {
                            path: path.clone(),
                            delta,
                        }
                    }
                    "$unset" => UpdateOp::Unset { path: path.clone() },
                    "$push" => UpdateOp::Push {
                        path: path.clone(),
                        items: push_items(raw),
                    },
                    other if other.starts_with('$') => {
                        return Err(QuarryError::InvalidQuery(format!(
                            "unknown update operator '{}'",
                            other
                        )))
                    }
                    other => {
                        return Err(QuarryError::InvalidQuery(format!(
                            "update key '{}' is not an operator; replacement documents are not supported",
                            other
                        )))
                    }
                };
                if ops.iter().any(|existing: &UpdateOp| existing.path() == path) {
                    return Err(QuarryError::InvalidQuery(format!(
                        "conflicting update operators on '{}'",
                        path
                    )));
                }
                ops.push(parsed);
            }
        }
        Ok(UpdateSpec { ops })
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    /// Apply every operation to `fields` in declaration order
    ///
    /// On error the map may be partially updated; callers apply to a copy.
    pub fn apply(&self, fields: &mut Map) -> Result<UpdateEffect> {
        let mut effect = UpdateEffect::default();
        for op in &self.ops {
            let top = op.path().split('.').next().unwrap_or_default();
            if !effect.touched.iter().any(|t| t == top) {
                effect.touched.push(top.to_string());
            }
            if apply_op(fields, op)? {
                effect.modified = true;
            }
        }
        Ok(effect)
    }

    /// Document created by an upsert that matched nothing
    ///
    /// Seeded from the filter's top-level equality leaves, then updated.
    pub fn build_upsert(&self, filter: &Filter) -> Result<Map> {
        let mut fields = Map::new();
        for (path, value) in filter.equality_seeds() {
            set_path(&mut fields, path, value.clone())?;
        }
        self.apply(&mut fields)?;
        Ok(fields)
    }
}

fn check_path(op: &str, path: &str) -> Result<()> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(QuarryError::InvalidQuery(format!(
            "{}: invalid field path '{}'",
            op, path
        )));
    }
    if path == "_id" || path.starts_with("_id.") {
        return Err(QuarryError::InvalidQuery(format!(
            "{}: the _id field is immutable",
            op
        )));
    }
    Ok(())
}

fn push_items(raw: &JsonValue) -> Vec<Value> {
    if let Some(each) = raw
        .as_object()
        .filter(|obj| obj.len() == 1)
        .and_then(|obj| obj.get("$each"))
        .and_then(JsonValue::as_array)
    {
        return each.iter().cloned().map(Value::from_json).collect();
    }
    vec![Value::from_json(raw.clone())]
}

fn lookup<'a>(fields: &'a Map, path: &str) -> Option<&'a Value> {
    match path.split_once('.') {
        None => fields.get(path),
        Some((head, rest)) => fields.get(head)?.get_path(rest),
    }
}

fn lookup_mut<'a>(fields: &'a mut Map, path: &str) -> Option<&'a mut Value> {
    let mut parts = path.split('.');
    let mut current = fields.get_mut(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get_mut(part)?,
            Value::Array(items) => items.get_mut(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn identical(a: &Value, b: &Value) -> bool {
    a.value_type() == b.value_type() && a == b
}

/// Returns whether the document changed
fn apply_op(fields: &mut Map, op: &UpdateOp) -> Result<bool> {
    match op {
        UpdateOp::Set { path, value } => {
            if lookup(fields, path).is_some_and(|current| identical(current, value)) {
                return Ok(false);
            }
            set_path(fields, path, value.clone())?;
            Ok(true)
        }
        UpdateOp::Inc { path, delta } => {
            let next = match lookup(fields, path) {
                None => delta.clone(),
                Some(current) => add_numbers(path, current, delta)?,
            };
            if lookup(fields, path).is_some_and(|current| identical(current, &next)) {
                return Ok(false);
            }
            set_path(fields, path, next)?;
            Ok(true)
        }
        UpdateOp::Unset { path } => Ok(remove_path(fields, path).is_some()),
        UpdateOp::Push { path, items } => match lookup_mut(fields, path) {
            Some(Value::Array(existing)) => {
                existing.extend(items.iter().cloned());
                Ok(!items.is_empty())
            }
            Some(other) => Err(QuarryError::TypeError(format!(
                "$push on '{}' requires an array, found {}",
                path,
                other.value_type()
            ))),
            None => {
                set_path(fields, path, Value::Array(items.clone()))?;
                Ok(true)
            }
        },
    }
}

fn add_numbers(path: &str, current: &Value, delta: &Value) -> Result<Value> {
    match (current, delta) {
        (Value::Int(a), Value::Int(b)) => Ok(a
            .checked_add(*b)
            .map(Value::Int)
            .unwrap_or(Value::Float(*a as f64 + *b as f64))),
        (a, b) if a.is_number() => {
            let sum = a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default();
            if !sum.is_finite() {
                return Err(QuarryError::ArithmeticError(format!(
                    "$inc on '{}' overflows to a non-finite value",
                    path
                )));
            }
            Ok(Value::Float(sum))
        }
        (other, _) => Err(QuarryError::TypeError(format!(
            "$inc on '{}' requires a numeric field, found {}",
            path,
            other.value_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(json: JsonValue) -> Map {
        Value::from_json(json).as_object().unwrap().clone()
    }

    fn spec(json: JsonValue) -> UpdateSpec {
        UpdateSpec::from_json(&json).unwrap()
    }

    #[test]
    fn test_set_and_inc() {
        let mut doc = fields(json!({"_id": 1, "precio": 7500, "stock": 20}));
        let effect = spec(json!({"$set": {"precio": 7900}, "$inc": {"stock": 5}}))
            .apply(&mut doc)
            .unwrap();
        assert!(effect.modified);
        assert_eq!(effect.touched, vec!["precio", "stock"]);
        assert_eq!(doc["precio"], Value::Int(7900));
        assert_eq!(doc["stock"], Value::Int(25));
        assert!(matches!(doc["stock"], Value::Int(_)));
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut doc = fields(json!({"_id": 1}));
        spec(json!({"$set": {"proveedor.contacto.email": "x@y.cr"}}))
            .apply(&mut doc)
            .unwrap();
        assert_eq!(
            Value::Object(doc).get_path("proveedor.contacto.email"),
            Some(&Value::from("x@y.cr"))
        );
    }

    #[test]
    fn test_repeated_set_is_noop() {
        let mut doc = fields(json!({"_id": 1, "marca": "Acme"}));
        let update = spec(json!({"$set": {"marca": "Truper"}}));
        assert!(update.apply(&mut doc).unwrap().modified);
        assert!(!update.apply(&mut doc).unwrap().modified);
    }

    #[test]
    fn test_inc_is_not_idempotent() {
        let mut doc = fields(json!({"_id": 1, "stock": 10}));
        let update = spec(json!({"$inc": {"stock": 3}}));
        update.apply(&mut doc).unwrap();
        update.apply(&mut doc).unwrap();
        assert_eq!(doc["stock"], Value::Int(16));
    }

    #[test]
    fn test_inc_creates_missing_and_promotes() {
        let mut doc = fields(json!({"_id": 1, "precio": 100}));
        spec(json!({"$inc": {"vendidos": 2, "precio": 0.5}}))
            .apply(&mut doc)
            .unwrap();
        assert_eq!(doc["vendidos"], Value::Int(2));
        assert_eq!(doc["precio"], Value::Float(100.5));

        let mut doc = fields(json!({"_id": 1, "n": i64::MAX}));
        spec(json!({"$inc": {"n": 1}})).apply(&mut doc).unwrap();
        assert!(matches!(doc["n"], Value::Float(_)));
    }

    #[test]
    fn test_inc_rejects_non_finite_result() {
        let mut doc = fields(json!({"_id": 1, "precio": f64::MAX}));
        let err = spec(json!({"$inc": {"precio": f64::MAX}})).apply(&mut doc).unwrap_err();
        assert!(matches!(err, QuarryError::ArithmeticError(_)));
        assert_eq!(doc["precio"], Value::Float(f64::MAX));
    }

    #[test]
    fn test_inc_type_errors() {
        let mut doc = fields(json!({"_id": 1, "nombre": "Casco"}));
        let err = spec(json!({"$inc": {"nombre": 1}})).apply(&mut doc).unwrap_err();
        assert!(matches!(err, QuarryError::TypeError(_)));

        let err = UpdateSpec::from_json(&json!({"$inc": {"stock": "1"}})).unwrap_err();
        assert!(matches!(err, QuarryError::TypeError(_)));
    }

    #[test]
    fn test_unset_and_push() {
        let mut doc = fields(json!({"_id": 1, "marca": "Acme", "tags": ["a"]}));
        let effect = spec(json!({"$unset": {"marca": ""}, "$push": {"tags": "b"}}))
            .apply(&mut doc)
            .unwrap();
        assert!(effect.modified);
        assert!(!doc.contains_key("marca"));
        assert_eq!(Value::Array(vec!["a".into(), "b".into()]), doc["tags"]);

        spec(json!({"$push": {"tags": {"$each": ["c", "d"]}}}))
            .apply(&mut doc)
            .unwrap();
        assert_eq!(doc["tags"].as_array().unwrap().len(), 4);

        spec(json!({"$push": {"colores": "rojo"}})).apply(&mut doc).unwrap();
        assert_eq!(doc["colores"], Value::Array(vec!["rojo".into()]));

        let mut scalar = fields(json!({"_id": 1, "nombre": "x"}));
        assert!(matches!(
            spec(json!({"$push": {"nombre": 1}})).apply(&mut scalar).unwrap_err(),
            QuarryError::TypeError(_)
        ));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            json!({}),
            json!({"precio": 1}),
            json!({"$rename": {"a": "b"}}),
            json!({"$set": {"_id": 5}}),
            json!({"$set": 5}),
            json!({"$set": {"a": 1}, "$inc": {"a": 1}}),
        ] {
            assert!(UpdateSpec::from_json(&bad).is_err(), "{} should fail", bad);
        }
    }

    #[test]
    fn test_build_upsert_seeds_from_filter() {
        let filter = Filter::from_json(&json!({
            "sku": "P999",
            "$and": [{"categoria": "Herramientas"}],
            "precio": {"$gt": 0}
        }))
        .unwrap();
        let doc = spec(json!({"$set": {"nombre": "Nivel"}, "$inc": {"stock": 10}}))
            .build_upsert(&filter)
            .unwrap();
        assert_eq!(doc["sku"], Value::from("P999"));
        assert_eq!(doc["categoria"], Value::from("Herramientas"));
        assert_eq!(doc["stock"], Value::Int(10));
        assert!(!doc.contains_key("precio"));
    }
}
