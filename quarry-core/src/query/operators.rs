// src/query/operators.rs
//! Leaf conditions of a filter and the shared regex compile cache
//!
//! A [`Condition`] is one operator applied to the values a field path reaches.
//! Candidates for a path are its terminal values plus, for array terminals, each element,
//! and a condition holds when any candidate satisfies it.

use std::cmp::Ordering;
use std::fmt;
use std::num::NonZeroUsize;

use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::error::{QuarryError, Result};
use crate::value::Value;
use crate::value_utils::compare_same_class;

// ============================================================================
// REGEX WITH OPTIONS SUPPORT
// ============================================================================

const REGEX_CACHE_SIZE: usize = 100;

lazy_static! {
    /// Compiled patterns keyed by "options:pattern"
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> = Mutex::new(LruCache::new(
        NonZeroUsize::new(REGEX_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN)
    ));
}

/// Build regex pattern string with inline flags for the `i`, `m`, `s`, `x` options
fn build_regex_pattern(pattern: &str, options: &str) -> Result<String> {
    if let Some(bad) = options.chars().find(|c| !matches!(c, 'i' | 'm' | 's' | 'x')) {
        return Err(QuarryError::InvalidQuery(format!(
            "unsupported regex option '{}'",
            bad
        )));
    }
    if options.is_empty() {
        Ok(pattern.to_string())
    } else {
        Ok(format!("(?{}){}", options, pattern))
    }
}

fn get_or_compile_regex(pattern: &str, options: &str) -> Result<Regex> {
    let cache_key = format!("{}:{}", options, pattern);
    if let Some(regex) = REGEX_CACHE.lock().get(&cache_key) {
        return Ok(regex.clone());
    }

    let regex = Regex::new(&build_regex_pattern(pattern, options)?).map_err(|e| {
        QuarryError::InvalidQuery(format!("invalid regex pattern '{}': {}", pattern, e))
    })?;
    REGEX_CACHE.lock().put(cache_key, regex.clone());
    Ok(regex)
}

/// A regular expression compiled once at construction
#[derive(Clone)]
pub struct Pattern {
    source: String,
    options: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str, options: &str) -> Result<Self> {
        Ok(Pattern {
            source: source.to_string(),
            options: options.to_string(),
            regex: get_or_compile_regex(source, options)?,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.source, self.options)
    }
}

// ============================================================================
// CONDITIONS
// ============================================================================

/// One operator applied to a field path
#[derive(Debug, Clone)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Pattern),
    Size(usize),
}

impl Condition {
    /// Parse an operator map such as `{"$gte": 100, "$lte": 500}` into its conditions
    pub fn parse_operators(field: &str, ops: &serde_json::Map<String, JsonValue>) -> Result<Vec<Condition>> {
        let mut conditions = Vec::with_capacity(ops.len());
        let mut regex_seen = false;

        for (op, operand) in ops {
            let condition = match op.as_str() {
                "$eq" => Condition::Eq(Value::from_json(operand.clone())),
                "$ne" => Condition::Ne(Value::from_json(operand.clone())),
                "$gt" => Condition::Gt(Value::from_json(operand.clone())),
                "$gte" => Condition::Gte(Value::from_json(operand.clone())),
                "$lt" => Condition::Lt(Value::from_json(operand.clone())),
                "$lte" => Condition::Lte(Value::from_json(operand.clone())),
                "$in" => Condition::In(operand_list(field, op, operand)?),
                "$nin" => Condition::Nin(operand_list(field, op, operand)?),
                "$exists" => Condition::Exists(exists_flag(field, operand)?),
                "$size" => {
                    let size = operand.as_u64().ok_or_else(|| {
                        QuarryError::InvalidQuery(format!(
                            "$size on '{}' requires a non-negative integer",
                            field
                        ))
                    })?;
                    Condition::Size(size as usize)
                }
                "$regex" => {
                    regex_seen = true;
                    let source = operand.as_str().ok_or_else(|| {
                        QuarryError::InvalidQuery(format!(
                            "$regex on '{}' requires a string pattern",
                            field
                        ))
                    })?;
                    let options = match ops.get("$options") {
                        None => "",
                        Some(JsonValue::String(s)) => s.as_str(),
                        Some(_) => {
                            return Err(QuarryError::InvalidQuery(format!(
                                "$options on '{}' must be a string",
                                field
                            )))
                        }
                    };
                    Condition::Regex(Pattern::new(source, options)?)
                }
                "$options" => continue,
                other => {
                    return Err(QuarryError::InvalidQuery(format!(
                        "unknown operator '{}' on field '{}'",
                        other, field
                    )))
                }
            };
            conditions.push(condition);
        }

        if ops.contains_key("$options") && !regex_seen {
            return Err(QuarryError::InvalidQuery(format!(
                "$options on '{}' without $regex",
                field
            )));
        }
        Ok(conditions)
    }

    /// Evaluate against the terminal values a field path reached
    ///
    /// An empty `terminals` slice means the field is absent.
    pub fn matches(&self, terminals: &[&Value]) -> bool {
        if terminals.is_empty() {
            return matches!(self, Condition::Exists(false));
        }
        match self {
            Condition::Eq(expected) => any_candidate(terminals, |v| v == expected),
            Condition::Ne(expected) => !any_candidate(terminals, |v| v == expected),
            Condition::Gt(bound) => compare_any(terminals, bound, |o| o == Ordering::Greater),
            Condition::Gte(bound) => compare_any(terminals, bound, |o| o != Ordering::Less),
            Condition::Lt(bound) => compare_any(terminals, bound, |o| o == Ordering::Less),
            Condition::Lte(bound) => compare_any(terminals, bound, |o| o != Ordering::Greater),
            Condition::In(set) => any_candidate(terminals, |v| set.contains(v)),
            Condition::Nin(set) => !any_candidate(terminals, |v| set.contains(v)),
            Condition::Exists(flag) => *flag,
            Condition::Regex(pattern) => {
                any_candidate(terminals, |v| v.as_str().is_some_and(|s| pattern.is_match(s)))
            }
            Condition::Size(size) => terminals
                .iter()
                .any(|v| v.as_array().is_some_and(|items| items.len() == *size)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Condition::Eq(_) => "$eq",
            Condition::Ne(_) => "$ne",
            Condition::Gt(_) => "$gt",
            Condition::Gte(_) => "$gte",
            Condition::Lt(_) => "$lt",
            Condition::Lte(_) => "$lte",
            Condition::In(_) => "$in",
            Condition::Nin(_) => "$nin",
            Condition::Exists(_) => "$exists",
            Condition::Regex(_) => "$regex",
            Condition::Size(_) => "$size",
        }
    }
}

fn operand_list(field: &str, op: &str, operand: &JsonValue) -> Result<Vec<Value>> {
    operand
        .as_array()
        .map(|items| items.iter().cloned().map(Value::from_json).collect())
        .ok_or_else(|| {
            QuarryError::InvalidQuery(format!("{} on '{}' requires an array", op, field))
        })
}

fn exists_flag(field: &str, operand: &JsonValue) -> Result<bool> {
    match operand {
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        _ => Err(QuarryError::InvalidQuery(format!(
            "$exists on '{}' requires a boolean",
            field
        ))),
    }
}

/// True if the predicate holds for a terminal or, for array terminals, any element
fn any_candidate<F>(terminals: &[&Value], predicate: F) -> bool
where
    F: Fn(&Value) -> bool,
{
    terminals.iter().any(|terminal| {
        predicate(terminal)
            || terminal
                .as_array()
                .is_some_and(|items| items.iter().any(&predicate))
    })
}

fn compare_any<F>(terminals: &[&Value], bound: &Value, accept: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    any_candidate(terminals, |v| {
        compare_same_class(v, bound).is_some_and(&accept)
    })
}
