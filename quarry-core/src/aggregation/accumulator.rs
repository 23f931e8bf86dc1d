// src/aggregation/accumulator.rs
//! Group accumulators shared by `$group`, `$bucket` and `$bucketAuto`

use std::collections::HashSet;

use serde_json::Value as JsonValue;

use super::expression::Expr;
use crate::error::{QuarryError, Result};
use crate::value::{Map, Value};
use crate::value_utils::{canonical_key, compare_values};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    Push,
    AddToSet,
    First,
    Last,
}

impl AccumulatorOp {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => AccumulatorOp::Sum,
            "$avg" => AccumulatorOp::Avg,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            _ => return None,
        })
    }
}

/// One output field of a grouping stage: `{field: {$op: expr}}`
#[derive(Debug, Clone)]
pub struct Accumulator {
    op: AccumulatorOp,
    expr: Expr,
}

impl Accumulator {
    pub fn from_json(field: &str, spec: &JsonValue) -> Result<Self> {
        let obj = spec.as_object().filter(|o| o.len() == 1).ok_or_else(|| {
            QuarryError::ConfigError(format!(
                "accumulator for '{}' must be an object with exactly one operator",
                field
            ))
        })?;
        let (name, arg) = obj.iter().next().ok_or_else(|| {
            QuarryError::ConfigError(format!("accumulator for '{}' is empty", field))
        })?;
        let op = AccumulatorOp::from_name(name).ok_or_else(|| {
            QuarryError::ConfigError(format!("unknown accumulator '{}' for '{}'", name, field))
        })?;
        Ok(Accumulator {
            op,
            expr: Expr::parse(arg)?,
        })
    }

    /// `{$sum: 1}`
    pub fn count() -> Self {
        Accumulator {
            op: AccumulatorOp::Sum,
            expr: Expr::Literal(Value::Int(1)),
        }
    }

    pub fn new_state(&self) -> AccState {
        match self.op {
            AccumulatorOp::Sum => AccState::Sum(SumState::Int(0)),
            AccumulatorOp::Avg => AccState::Avg { total: 0.0, count: 0 },
            AccumulatorOp::Min => AccState::Min(None),
            AccumulatorOp::Max => AccState::Max(None),
            AccumulatorOp::Push => AccState::Push(Vec::new()),
            AccumulatorOp::AddToSet => AccState::AddToSet {
                seen: HashSet::new(),
                items: Vec::new(),
            },
            AccumulatorOp::First => AccState::First(None),
            AccumulatorOp::Last => AccState::Last(None),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SumState {
    Int(i64),
    Float(f64),
}

impl SumState {
    fn add(self, value: &Value) -> SumState {
        match (self, value) {
            (SumState::Int(acc), Value::Int(n)) => match acc.checked_add(*n) {
                Some(total) => SumState::Int(total),
                None => SumState::Float(acc as f64 + *n as f64),
            },
            (SumState::Int(acc), Value::Float(f)) => SumState::Float(acc as f64 + f),
            (SumState::Float(acc), Value::Int(n)) => SumState::Float(acc + *n as f64),
            (SumState::Float(acc), Value::Float(f)) => SumState::Float(acc + f),
            (state, _) => state,
        }
    }
}

/// Running state of one accumulator over one group
#[derive(Debug, Clone)]
pub enum AccState {
    Sum(SumState),
    Avg { total: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Push(Vec<Value>),
    AddToSet { seen: HashSet<String>, items: Vec<Value> },
    First(Option<Value>),
    Last(Option<Value>),
}

impl AccState {
    /// Fold one input; `None` means the expression referenced a missing field
    pub fn update(&mut self, input: Option<Value>) {
        match self {
            AccState::Sum(state) => {
                if let Some(value) = &input {
                    *state = state.add(value);
                }
            }
            AccState::Avg { total, count } => {
                if let Some(n) = input.as_ref().filter(|v| v.is_number()).and_then(Value::as_f64) {
                    *total += n;
                    *count += 1;
                }
            }
            AccState::Min(current) => keep_extreme(current, input, std::cmp::Ordering::Less),
            AccState::Max(current) => keep_extreme(current, input, std::cmp::Ordering::Greater),
            AccState::Push(items) => items.extend(input),
            AccState::AddToSet { seen, items } => {
                if let Some(value) = input {
                    if seen.insert(canonical_key(&value)) {
                        items.push(value);
                    }
                }
            }
            AccState::First(first) => {
                if first.is_none() {
                    *first = Some(input.unwrap_or(Value::Null));
                }
            }
            AccState::Last(last) => *last = Some(input.unwrap_or(Value::Null)),
        }
    }

    pub fn finish(self) -> Value {
        match self {
            AccState::Sum(SumState::Int(n)) => Value::Int(n),
            AccState::Sum(SumState::Float(f)) => Value::Float(f),
            AccState::Avg { count: 0, .. } => Value::Null,
            AccState::Avg { total, count } => Value::Float(total / count as f64),
            AccState::Min(v) | AccState::Max(v) | AccState::First(v) | AccState::Last(v) => {
                v.unwrap_or(Value::Null)
            }
            AccState::Push(items) => Value::Array(items),
            AccState::AddToSet { items, .. } => Value::Array(items),
        }
    }
}

fn keep_extreme(current: &mut Option<Value>, input: Option<Value>, wanted: std::cmp::Ordering) {
    let Some(value) = input.filter(|v| !v.is_null()) else {
        return;
    };
    let replace = match current {
        None => true,
        Some(existing) => compare_values(&value, existing) == wanted,
    };
    if replace {
        *current = Some(value);
    }
}

/// Ordered set of named accumulators
#[derive(Debug, Clone, Default)]
pub struct AccumulatorSet {
    fields: Vec<(String, Accumulator)>,
}

impl AccumulatorSet {
    /// Parse every key of `obj` except those in `reserved`
    pub fn from_json(obj: &serde_json::Map<String, JsonValue>, reserved: &[&str]) -> Result<Self> {
        let mut fields = Vec::with_capacity(obj.len());
        for (field, spec) in obj {
            if reserved.contains(&field.as_str()) {
                continue;
            }
            if field.contains('.') || field.starts_with('$') {
                return Err(QuarryError::ConfigError(format!(
                    "invalid accumulator field name '{}'",
                    field
                )));
            }
            fields.push((field.clone(), Accumulator::from_json(field, spec)?));
        }
        Ok(AccumulatorSet { fields })
    }

    /// `{count: {$sum: 1}}`
    pub fn count() -> Self {
        AccumulatorSet {
            fields: vec![("count".to_string(), Accumulator::count())],
        }
    }

    /// Evaluate every accumulator argument for one document
    ///
    /// Fails as a whole so a document either feeds all accumulators or none.
    pub fn inputs(&self, doc: &Value) -> Result<Vec<Option<Value>>> {
        self.fields
            .iter()
            .map(|(_, acc)| acc.expr.evaluate_optional(doc))
            .collect()
    }

    pub fn new_states(&self) -> Vec<AccState> {
        self.fields.iter().map(|(_, acc)| acc.new_state()).collect()
    }

    pub fn update(states: &mut [AccState], inputs: Vec<Option<Value>>) {
        for (state, input) in states.iter_mut().zip(inputs) {
            state.update(input);
        }
    }

    /// Write finished values into `out` after its `_id`
    pub fn finish_into(&self, states: Vec<AccState>, out: &mut Map) {
        for ((field, _), state) in self.fields.iter().zip(states) {
            out.insert(field.clone(), state.finish());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(spec: JsonValue, docs: &[JsonValue]) -> Value {
        let acc = Accumulator::from_json("out", &spec).unwrap();
        let mut state = acc.new_state();
        for doc in docs {
            let input = acc.expr.evaluate_optional(&Value::from_json(doc.clone())).unwrap();
            state.update(input);
        }
        state.finish()
    }

    fn pinturas() -> Vec<JsonValue> {
        vec![
            json!({"sku": "P007", "precio": 18500, "tags": ["pintura", "interior"]}),
            json!({"sku": "P008", "precio": 4200, "tags": ["brocha"]}),
            json!({"sku": "P009", "precio": 3900.5}),
            json!({"sku": "P010", "precio": "consultar"}),
        ]
    }

    #[test]
    fn test_sum() {
        assert_eq!(run(json!({"$sum": 1}), &pinturas()), Value::Int(4));
        assert_eq!(run(json!({"$sum": "$precio"}), &pinturas()), Value::Float(26600.5));
        assert_eq!(run(json!({"$sum": "$precio"}), &pinturas()[..2]), Value::Int(22700));
        assert_eq!(run(json!({"$sum": "$nada"}), &pinturas()), Value::Int(0));
        assert_eq!(run(json!({"$sum": "$precio"}), &[]), Value::Int(0));
    }

    #[test]
    fn test_sum_overflow_promotes() {
        let docs = vec![json!({"n": i64::MAX}), json!({"n": 1})];
        assert!(matches!(run(json!({"$sum": "$n"}), &docs), Value::Float(_)));
    }

    #[test]
    fn test_avg() {
        let avg = run(json!({"$avg": "$precio"}), &pinturas()[..2]);
        assert_eq!(avg, Value::Float(11350.0));
        assert_eq!(run(json!({"$avg": "$nada"}), &pinturas()), Value::Null);
    }

    #[test]
    fn test_min_max_keep_type() {
        let docs = &pinturas()[..3];
        assert_eq!(run(json!({"$min": "$precio"}), docs), Value::Float(3900.5));
        assert_eq!(run(json!({"$max": "$precio"}), docs), Value::Int(18500));
        assert_eq!(run(json!({"$min": "$nada"}), docs), Value::Null);
    }

    #[test]
    fn test_push_and_add_to_set() {
        let docs = vec![
            json!({"c": "Pinturas"}),
            json!({"c": "Eléctricas"}),
            json!({}),
            json!({"c": "Pinturas"}),
        ];
        assert_eq!(
            run(json!({"$push": "$c"}), &docs),
            Value::from_json(json!(["Pinturas", "Eléctricas", "Pinturas"]))
        );
        assert_eq!(
            run(json!({"$addToSet": "$c"}), &docs),
            Value::from_json(json!(["Pinturas", "Eléctricas"]))
        );
    }

    #[test]
    fn test_add_to_set_numeric_equality() {
        let docs = vec![json!({"n": 1}), json!({"n": 1.0}), json!({"n": 2})];
        assert_eq!(run(json!({"$addToSet": "$n"}), &docs), Value::from_json(json!([1, 2])));
    }

    #[test]
    fn test_first_last() {
        assert_eq!(run(json!({"$first": "$sku"}), &pinturas()), Value::from("P007"));
        assert_eq!(run(json!({"$last": "$sku"}), &pinturas()), Value::from("P010"));
        assert_eq!(run(json!({"$first": "$sku"}), &[]), Value::Null);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Accumulator::from_json("x", &json!({"$median": "$a"})).is_err());
        assert!(Accumulator::from_json("x", &json!({"$sum": 1, "$avg": 2})).is_err());
        assert!(Accumulator::from_json("x", &json!(5)).is_err());
        let obj = json!({"_id": null, "a.b": {"$sum": 1}});
        assert!(AccumulatorSet::from_json(obj.as_object().unwrap(), &["_id"]).is_err());
    }
}
