// quarry-core/src/find_options.rs
// Find query options: projection, sort, skip, limit, hint, time limit

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{QuarryError, Result};
use crate::value::{Map, Value};
use crate::value_utils::{compare_optional, remove_path};

/// Options for find queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FindOptions {
    /// Projection: field → 1 (include) or 0 (exclude)
    pub projection: Option<JsonValue>,

    /// Sort: [(field, direction)], direction: 1 (asc) or -1 (desc)
    pub sort: Option<Vec<(String, i32)>>,

    /// Number of documents to skip (applied after sort)
    pub skip: Option<usize>,

    /// Maximum number of documents to return
    pub limit: Option<usize>,

    /// Index name hint; advisory only, reads are full scans
    pub hint: Option<String>,

    /// Scan deadline in milliseconds, checked between documents
    pub max_time_ms: Option<u64>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projection(mut self, projection: JsonValue) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Vec<(String, i32)>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time_ms = Some(max_time.as_millis() as u64);
        self
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_ms.map(Duration::from_millis)
    }

    /// Parsed sort keys; directions other than 1 / -1 are rejected
    pub fn sort_keys(&self) -> Result<Vec<(String, SortDirection)>> {
        let Some(sort) = &self.sort else {
            return Ok(Vec::new());
        };
        sort.iter()
            .map(|(field, dir)| {
                SortDirection::from_i64(*dir as i64)
                    .map(|d| (field.clone(), d))
                    .ok_or_else(|| {
                        QuarryError::InvalidQuery(format!(
                            "sort direction for '{}' must be 1 or -1, got {}",
                            field, dir
                        ))
                    })
            })
            .collect()
    }

    pub fn parsed_projection(&self) -> Result<Option<Projection>> {
        self.projection.as_ref().map(Projection::from_json).transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn from_i64(n: i64) -> Option<Self> {
        match n {
            1 => Some(SortDirection::Ascending),
            -1 => Some(SortDirection::Descending),
            _ => None,
        }
    }
}

/// Inclusion or exclusion projection
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Include { paths: Vec<String>, include_id: bool },
    Exclude { paths: Vec<String> },
}

impl Projection {
    /// Parse `{field: 1|0|true|false}`
    ///
    /// Inclusion and exclusion cannot be mixed, except `_id: 0` next to inclusions.
    pub fn from_json(spec: &JsonValue) -> Result<Self> {
        let obj = spec.as_object().ok_or_else(|| {
            QuarryError::InvalidQuery("projection must be an object".to_string())
        })?;

        let mut include = Vec::new();
        let mut exclude = Vec::new();
        let mut id_flag = None;
        for (path, flag) in obj {
            let on = projection_flag(flag).ok_or_else(|| {
                QuarryError::InvalidQuery(format!(
                    "projection value for '{}' must be 0, 1, true or false",
                    path
                ))
            })?;
            if path == "_id" {
                id_flag = Some(on);
            } else if on {
                include.push(path.clone());
            } else {
                exclude.push(path.clone());
            }
        }

        if !include.is_empty() && !exclude.is_empty() {
            return Err(QuarryError::InvalidQuery(
                "projection cannot mix inclusion and exclusion".to_string(),
            ));
        }

        if !include.is_empty() || (id_flag == Some(true) && exclude.is_empty()) {
            return Ok(Projection::Include {
                paths: include,
                include_id: id_flag != Some(false),
            });
        }
        if id_flag == Some(false) {
            exclude.insert(0, "_id".to_string());
        }
        Ok(Projection::Exclude { paths: exclude })
    }

    pub fn apply(&self, doc: &Value) -> Value {
        let Value::Object(fields) = doc else {
            return doc.clone();
        };
        match self {
            Projection::Include { paths, include_id } => {
                let mut out = Map::new();
                if *include_id {
                    if let Some(id) = fields.get("_id") {
                        out.insert("_id".to_string(), id.clone());
                    }
                }
                for path in paths {
                    if let Some(value) = project_path(doc, path) {
                        merge_projected(&mut out, path, value);
                    }
                }
                Value::Object(out)
            }
            Projection::Exclude { paths } => {
                let mut out = fields.clone();
                for path in paths {
                    remove_path(&mut out, path);
                }
                Value::Object(out)
            }
        }
    }
}

pub(crate) fn projection_flag(flag: &JsonValue) -> Option<bool> {
    match flag {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => match n.as_f64() {
            Some(f) if f == 0.0 => Some(false),
            Some(f) if f == 1.0 => Some(true),
            _ => None,
        },
        _ => None,
    }
}

/// Sub-value of `doc` holding only `path`, nested the way the path is
///
/// Arrays along the path keep the projected part of each object element.
/// Returns the value stored under the path's first segment.
pub(crate) fn project_path(doc: &Value, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let head = doc.get(parts[0])?;
    project_parts(head, &parts[1..])
}

fn project_parts(value: &Value, parts: &[&str]) -> Option<Value> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => {
            let inner = project_parts(map.get(*head)?, rest)?;
            let mut out = Map::new();
            out.insert(head.to_string(), inner);
            Some(Value::Object(out))
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(_) | Value::Array(_) => project_parts(item, parts),
                    _ => None,
                })
                .collect(),
        )),
        _ => None,
    }
}

/// Insert a projected value under the path's first segment, merging nested objects
pub(crate) fn merge_projected(out: &mut Map, path: &str, value: Value) {
    let head = path.split('.').next().unwrap_or(path);
    match (out.get_mut(head), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => merge_objects(existing, incoming),
        (_, value) => {
            out.insert(head.to_string(), value);
        }
    }
}

fn merge_objects(target: &mut Map, incoming: Map) {
    for (key, value) in incoming {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(inner)) => merge_objects(existing, inner),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Stable multi-key sort; missing fields sort as null
pub fn apply_sort(docs: &mut Vec<Value>, sort: &[(String, SortDirection)]) {
    if sort.is_empty() || docs.len() < 2 {
        return;
    }

    let mut keyed: Vec<(Vec<Option<Value>>, Value)> = docs
        .drain(..)
        .map(|doc| {
            let keys = sort.iter().map(|(path, _)| doc.resolve_path(path)).collect();
            (keys, doc)
        })
        .collect();

    keyed.sort_by(|(a, _), (b, _)| compare_sort_keys(a, b, sort));
    docs.extend(keyed.into_iter().map(|(_, doc)| doc));
}

pub(crate) fn compare_sort_keys(
    a: &[Option<Value>],
    b: &[Option<Value>],
    sort: &[(String, SortDirection)],
) -> Ordering {
    for ((left, right), (_, direction)) in a.iter().zip(b.iter()).zip(sort.iter()) {
        let cmp = compare_optional(left.as_ref(), right.as_ref());
        if cmp != Ordering::Equal {
            return match direction {
                SortDirection::Ascending => cmp,
                SortDirection::Descending => cmp.reverse(),
            };
        }
    }
    Ordering::Equal
}

/// Apply skip then limit
pub fn apply_limit_skip(docs: Vec<Value>, limit: Option<usize>, skip: Option<usize>) -> Vec<Value> {
    docs.into_iter()
        .skip(skip.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}
