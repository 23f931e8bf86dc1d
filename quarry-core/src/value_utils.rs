//! Value utility functions shared across modules
//!
//! Ordering, canonical keys, truthiness and dot-path mutation for [`Value`].

use std::cmp::Ordering;

use crate::error::{QuarryError, Result};
use crate::value::{Map, Value};

/// Rank of a value's type in the cross-type sort order
///
/// Null < Numbers < String < Object < Array < Bool < Date
pub fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Int(_) | Value::Float(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
        Value::Date(_) => 6,
    }
}

/// Total order over values, used by sorting and expression comparisons
///
/// Values of different types order by [`type_rank`]. NaN sorts below every other number.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (x, y) if x.is_number() => compare_floats(x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN)),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_floats(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Compare two optional values, treating a missing value as null
pub fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    const NULL: Value = Value::Null;
    compare_values(a.unwrap_or(&NULL), b.unwrap_or(&NULL))
}

/// Ordering used by filter range operators
///
/// Only values of the same scalar class compare (numbers, strings, dates, booleans);
/// everything else is `None` so the predicate evaluates to false.
pub fn compare_same_class(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (x, y) if x.is_number() && y.is_number() => {
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Canonical string form of a value
///
/// Two values have the same key exactly when they are equal under `Value`'s `PartialEq`:
/// object keys are sorted and integral floats print like integers. Used for group keys
/// and `$addToSet` deduplication.
pub fn canonical_key(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => format!("n:{}", n),
        Value::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() && f.abs() < 9.0e15 {
                format!("n:{}", *f as i64)
            } else {
                format!("n:{}", f)
            }
        }
        Value::String(s) => format!("s:{:?}", s),
        Value::Date(d) => format!("d:{}", d.timestamp_millis()),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_key).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{:?}:{}", k, canonical_key(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
    }
}

/// Truthiness for conditional expressions: false, null and zero are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(n) => *n != 0,
        Value::Float(f) => *f != 0.0,
        _ => true,
    }
}

/// Set a value at a dot path, creating intermediate objects as needed
///
/// Arrays are addressed by numeric index; writing past the end pads with nulls, up to
/// [`MAX_ARRAY_PADDING`] new slots. Traversing through a scalar is a `TypeError`.
pub fn set_path(target: &mut Map, path: &str, value: Value) -> Result<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| QuarryError::InvalidQuery("empty field path".to_string()))?;

    if parents.is_empty() {
        target.insert(last.to_string(), value);
        return Ok(());
    }

    let first = parents[0];
    let mut current = target
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    for part in &parents[1..] {
        current = child_slot(current, part, path)?;
    }

    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            *array_slot(items, last, path)? = value;
            Ok(())
        }
        other => Err(QuarryError::TypeError(format!(
            "cannot create field '{}' in {} value at '{}'",
            last,
            other.value_type(),
            path
        ))),
    }
}

fn child_slot<'a>(current: &'a mut Value, part: &str, path: &str) -> Result<&'a mut Value> {
    match current {
        Value::Object(map) => Ok(map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(items) => {
            let slot = array_slot(items, part, path)?;
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            Ok(slot)
        }
        other => Err(QuarryError::TypeError(format!(
            "cannot traverse {} value at '{}' in path '{}'",
            other.value_type(),
            part,
            path
        ))),
    }
}

/// Most null slots a single path write may append to an array
pub const MAX_ARRAY_PADDING: usize = 10_000;

fn array_slot<'a>(items: &'a mut Vec<Value>, part: &str, path: &str) -> Result<&'a mut Value> {
    let index = parse_index(part, path)?;
    if index >= items.len() {
        if index - items.len() >= MAX_ARRAY_PADDING {
            return Err(QuarryError::InvalidQuery(format!(
                "array index {} in path '{}' is too far past the end ({} items)",
                index,
                path,
                items.len()
            )));
        }
        items.resize(index + 1, Value::Null);
    }
    Ok(&mut items[index])
}

fn parse_index(part: &str, path: &str) -> Result<usize> {
    part.parse::<usize>().map_err(|_| {
        QuarryError::TypeError(format!(
            "array segment '{}' in path '{}' is not an index",
            part, path
        ))
    })
}

/// Remove the value at a dot path, returning it when present
pub fn remove_path(target: &mut Map, path: &str) -> Option<Value> {
    let Some((parent_path, last)) = path.rsplit_once('.') else {
        return target.shift_remove(path);
    };

    let mut parts = parent_path.split('.');
    let mut current = target.get_mut(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get_mut(part)?,
            Value::Array(items) => items.get_mut(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Object(map) => map.shift_remove(last),
        _ => None,
    }
}
