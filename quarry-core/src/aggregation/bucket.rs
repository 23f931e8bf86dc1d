// src/aggregation/bucket.rs
// $bucket and $bucketAuto stages

use std::cmp::Ordering;

use serde_json::Value as JsonValue;

use super::accumulator::{AccState, AccumulatorSet};
use super::expression::Expr;
use super::{config_error, StageContext};
use crate::error::Result;
use crate::log_debug;
use crate::value::{Map, Value};
use crate::value_utils::{compare_same_class, compare_values};

fn parse_output(obj: &serde_json::Map<String, JsonValue>, stage: &str) -> Result<AccumulatorSet> {
    match obj.get("output") {
        None => Ok(AccumulatorSet::count()),
        Some(JsonValue::Object(output)) => AccumulatorSet::from_json(output, &[]),
        Some(_) => Err(config_error(format!("{} output must be an object", stage))),
    }
}

fn check_keys(obj: &serde_json::Map<String, JsonValue>, stage: &str, allowed: &[&str]) -> Result<()> {
    match obj.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(config_error(format!("{} does not accept '{}'", stage, key))),
        None => Ok(()),
    }
}

/// $bucket stage - group by explicit `[lower, upper)` boundaries
#[derive(Debug, Clone)]
pub struct BucketStage {
    group_by: Expr,
    boundaries: Vec<Value>,
    default: Option<Value>,
    output: AccumulatorSet,
}

impl BucketStage {
    pub(super) fn from_json(spec: &JsonValue) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| config_error("$bucket must be an object"))?;
        check_keys(obj, "$bucket", &["groupBy", "boundaries", "default", "output"])?;

        let group_by = obj
            .get("groupBy")
            .ok_or_else(|| config_error("$bucket requires groupBy"))?;
        let boundaries: Vec<Value> = obj
            .get("boundaries")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| config_error("$bucket requires a boundaries array"))?
            .iter()
            .cloned()
            .map(Value::from_json)
            .collect();

        if boundaries.len() < 2 {
            return Err(config_error("$bucket requires at least 2 boundaries"));
        }
        for pair in boundaries.windows(2) {
            if compare_same_class(&pair[0], &pair[1]) != Some(Ordering::Less) || pair[0].is_null() {
                return Err(config_error(format!(
                    "$bucket boundaries must share one type and be strictly ascending, got {} then {}",
                    pair[0], pair[1]
                )));
            }
        }

        let default = obj.get("default").cloned().map(Value::from_json);
        if let Some(label) = &default {
            let first = &boundaries[0];
            let last = &boundaries[boundaries.len() - 1];
            let inside = matches!(
                compare_same_class(label, first),
                Some(Ordering::Greater | Ordering::Equal)
            ) && compare_same_class(label, last) == Some(Ordering::Less);
            if inside {
                return Err(config_error(format!(
                    "$bucket default {} falls inside the boundary range",
                    label
                )));
            }
        }

        Ok(BucketStage {
            group_by: Expr::parse(group_by)?,
            boundaries,
            default,
            output: parse_output(obj, "$bucket")?,
        })
    }

    /// Index of the bucket holding `value`, if any
    fn locate(&self, value: &Value) -> Option<usize> {
        self.boundaries.windows(2).position(|pair| {
            matches!(
                compare_same_class(value, &pair[0]),
                Some(Ordering::Greater | Ordering::Equal)
            ) && compare_same_class(value, &pair[1]) == Some(Ordering::Less)
        })
    }

    pub(super) fn execute(&self, docs: Vec<Value>, ctx: &mut StageContext<'_>) -> Result<Vec<Value>> {
        let mut buckets: Vec<Option<Vec<AccState>>> = vec![None; self.boundaries.len() - 1];
        let mut fallback: Option<Vec<AccState>> = None;

        for doc in &docs {
            let evaluated = self
                .group_by
                .evaluate(doc)
                .and_then(|key| Ok((key, self.output.inputs(doc)?)));
            let Some((key, inputs)) = ctx.keep(evaluated)? else {
                continue;
            };

            let states = match self.locate(&key) {
                Some(index) => &mut buckets[index],
                None if self.default.is_some() => &mut fallback,
                None => {
                    return Err(config_error(format!(
                        "$bucket value {} is outside the boundaries and no default is set",
                        key
                    )))
                }
            };
            let states = states.get_or_insert_with(|| self.output.new_states());
            AccumulatorSet::update(states, inputs);
        }

        let mut results = Vec::new();
        for (lower, states) in self.boundaries.iter().zip(buckets) {
            if let Some(states) = states {
                results.push(self.emit(lower.clone(), states));
            }
        }
        if let (Some(label), Some(states)) = (&self.default, fallback) {
            results.push(self.emit(label.clone(), states));
        }
        log_debug!("$bucket emitted {} buckets from {} documents", results.len(), docs.len());
        Ok(results)
    }

    fn emit(&self, id: Value, states: Vec<AccState>) -> Value {
        let mut out = Map::new();
        out.insert("_id".to_string(), id);
        self.output.finish_into(states, &mut out);
        Value::Object(out)
    }
}

/// $bucketAuto stage - equal-cardinality buckets over the sorted group values
#[derive(Debug, Clone)]
pub struct BucketAutoStage {
    group_by: Expr,
    buckets: usize,
    output: AccumulatorSet,
}

impl BucketAutoStage {
    pub(super) fn from_json(spec: &JsonValue) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| config_error("$bucketAuto must be an object"))?;
        check_keys(obj, "$bucketAuto", &["groupBy", "buckets", "output"])?;

        let group_by = obj
            .get("groupBy")
            .ok_or_else(|| config_error("$bucketAuto requires groupBy"))?;
        let buckets = obj
            .get("buckets")
            .and_then(JsonValue::as_u64)
            .filter(|n| *n > 0)
            .ok_or_else(|| config_error("$bucketAuto buckets must be a positive integer"))?;

        Ok(BucketAutoStage {
            group_by: Expr::parse(group_by)?,
            buckets: buckets as usize,
            output: parse_output(obj, "$bucketAuto")?,
        })
    }

    pub(super) fn execute(&self, docs: Vec<Value>, ctx: &mut StageContext<'_>) -> Result<Vec<Value>> {
        let mut keyed: Vec<(Value, Vec<Option<Value>>)> = Vec::with_capacity(docs.len());
        for doc in &docs {
            let evaluated = self
                .group_by
                .evaluate(doc)
                .and_then(|key| Ok((key, self.output.inputs(doc)?)));
            keyed.extend(ctx.keep(evaluated)?);
        }
        if keyed.is_empty() {
            return Ok(Vec::new());
        }

        // Non-null group values must be mutually comparable
        let mut non_null = keyed.iter().map(|(key, _)| key).filter(|key| !key.is_null());
        if let Some(first) = non_null.next() {
            if let Some(other) = non_null.find(|key| compare_same_class(first, key).is_none()) {
                return Err(config_error(format!(
                    "$bucketAuto groupBy values {} and {} cannot be ordered together",
                    first, other
                )));
            }
        }

        keyed.sort_by(|(a, _), (b, _)| compare_values(a, b));

        let count = self.buckets.min(keyed.len());
        let base = keyed.len() / count;
        let remainder = keyed.len() % count;

        // earlier buckets absorb the remainder; a run of equal values never straddles a
        // boundary, so a bucket grows to the end of its run and later buckets may vanish
        let mut groups: Vec<Vec<(Value, Vec<Option<Value>>)>> = Vec::with_capacity(count);
        let mut rest = keyed.into_iter().peekable();
        for i in 0..count {
            if rest.peek().is_none() {
                break;
            }
            let size = if i < remainder { base + 1 } else { base };
            let mut group: Vec<_> = rest.by_ref().take(size).collect();
            if i + 1 == count {
                group.extend(rest.by_ref());
            } else if let Some((last, _)) = group.last() {
                let last = last.clone();
                while let Some(entry) = rest.next_if(|(key, _)| compare_values(key, &last).is_eq()) {
                    group.push(entry);
                }
            }
            groups.push(group);
        }

        let mins: Vec<Value> = groups
            .iter()
            .filter_map(|g| g.first().map(|(key, _)| key.clone()))
            .collect();

        let mut results = Vec::with_capacity(groups.len());
        for (index, group) in groups.into_iter().enumerate() {
            let max = match mins.get(index + 1) {
                Some(next_min) => next_min.clone(),
                None => group
                    .last()
                    .map(|(key, _)| key.clone())
                    .unwrap_or(Value::Null),
            };

            let mut states = self.output.new_states();
            for (_, inputs) in group {
                AccumulatorSet::update(&mut states, inputs);
            }

            let mut range = Map::new();
            range.insert("min".to_string(), mins[index].clone());
            range.insert("max".to_string(), max);

            let mut out = Map::new();
            out.insert("_id".to_string(), Value::Object(range));
            self.output.finish_into(states, &mut out);
            results.push(Value::Object(out));
        }

        log_debug!("$bucketAuto emitted {} buckets from {} documents", results.len(), docs.len());
        Ok(results)
    }
}
