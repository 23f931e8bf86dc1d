// src/aggregation/expression.rs
//! Aggregation expressions
//!
//! Parsed once from JSON into an [`Expr`] tree and evaluated per document.
//! Construction errors are `ConfigError`; evaluation errors (`TypeError`, `ArithmeticError`)
//! only invalidate the document being evaluated.

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde_json::Value as JsonValue;

use crate::error::{QuarryError, Result};
use crate::query::Pattern;
use crate::value::{Map, Value};
use crate::value_utils::{compare_values, is_truthy};

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.%LZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Gte => ord != Ordering::Less,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Lte => ord != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Subtract,
    Multiply,
}

impl ArithOp {
    fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "$add",
            ArithOp::Subtract => "$subtract",
            ArithOp::Multiply => "$multiply",
        }
    }
}

/// Piece of a parsed `$dateToString` format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatPart {
    Literal(String),
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Millisecond,
    DayOfYear,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// Dotted field path, broadcast over arrays
    Field(String),
    Root,
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Add(Vec<Expr>),
    Subtract(Box<Expr>, Box<Expr>),
    Multiply(Vec<Expr>),
    Divide(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Cond {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Switch {
        branches: Vec<(Expr, Expr)>,
        default: Box<Expr>,
    },
    RegexMatch {
        input: Box<Expr>,
        pattern: Pattern,
    },
    DateToString {
        format: Vec<FormatPart>,
        date: Box<Expr>,
    },
    Slice {
        array: Box<Expr>,
        position: Option<Box<Expr>>,
        count: Box<Expr>,
    },
}

fn config(message: String) -> QuarryError {
    QuarryError::ConfigError(message)
}

fn type_error(message: String) -> QuarryError {
    QuarryError::TypeError(message)
}

impl Expr {
    pub fn parse(json: &JsonValue) -> Result<Expr> {
        match json {
            JsonValue::String(s) => parse_string(s),
            JsonValue::Array(items) => Ok(Expr::Array(
                items.iter().map(Expr::parse).collect::<Result<_>>()?,
            )),
            JsonValue::Object(obj) => parse_object(obj),
            literal => Ok(Expr::Literal(Value::from_json(literal.clone()))),
        }
    }

    /// Evaluate, turning a missing field into null
    pub fn evaluate(&self, doc: &Value) -> Result<Value> {
        Ok(self.evaluate_optional(doc)?.unwrap_or(Value::Null))
    }

    /// Evaluate, reporting a missing field reference as `None`
    pub fn evaluate_optional(&self, doc: &Value) -> Result<Option<Value>> {
        let value = match self {
            Expr::Literal(value) => value.clone(),
            Expr::Field(path) => return Ok(doc.resolve_path(path)),
            Expr::Root => doc.clone(),
            Expr::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (name, expr) in fields {
                    if let Some(value) = expr.evaluate_optional(doc)? {
                        out.insert(name.clone(), value);
                    }
                }
                Value::Object(out)
            }
            Expr::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.evaluate(doc))
                    .collect::<Result<_>>()?,
            ),
            Expr::Add(args) => fold_arith(ArithOp::Add, args, doc)?,
            Expr::Multiply(args) => fold_arith(ArithOp::Multiply, args, doc)?,
            Expr::Subtract(a, b) => {
                subtract(&a.evaluate(doc)?, &b.evaluate(doc)?)?
            }
            Expr::Divide(a, b) => divide(&a.evaluate(doc)?, &b.evaluate(doc)?)?,
            Expr::Compare(op, a, b) => {
                let ord = compare_values(&a.evaluate(doc)?, &b.evaluate(doc)?);
                Value::Bool(op.holds(ord))
            }
            Expr::And(args) => {
                for arg in args {
                    if !is_truthy(&arg.evaluate(doc)?) {
                        return Ok(Some(Value::Bool(false)));
                    }
                }
                Value::Bool(true)
            }
            Expr::Or(args) => {
                for arg in args {
                    if is_truthy(&arg.evaluate(doc)?) {
                        return Ok(Some(Value::Bool(true)));
                    }
                }
                Value::Bool(false)
            }
            Expr::Not(arg) => Value::Bool(!is_truthy(&arg.evaluate(doc)?)),
            Expr::Cond {
                condition,
                then,
                otherwise,
            } => {
                return if is_truthy(&condition.evaluate(doc)?) {
                    then.evaluate_optional(doc)
                } else {
                    otherwise.evaluate_optional(doc)
                }
            }
            Expr::Switch { branches, default } => {
                for (case, then) in branches {
                    if is_truthy(&case.evaluate(doc)?) {
                        return then.evaluate_optional(doc);
                    }
                }
                return default.evaluate_optional(doc);
            }
            Expr::RegexMatch { input, pattern } => match input.evaluate(doc)? {
                Value::Null => Value::Bool(false),
                Value::String(s) => Value::Bool(pattern.is_match(&s)),
                other => {
                    return Err(type_error(format!(
                        "$regexMatch input must be a string, found {}",
                        other.value_type()
                    )))
                }
            },
            Expr::DateToString { format, date } => match date.evaluate(doc)? {
                Value::Null => Value::Null,
                Value::Date(d) => Value::String(format_date(format, &d)),
                other => {
                    return Err(type_error(format!(
                        "$dateToString date must be a date, found {}",
                        other.value_type()
                    )))
                }
            },
            Expr::Slice {
                array,
                position,
                count,
            } => {
                let position = match position {
                    Some(p) => Some(p.evaluate(doc)?),
                    None => None,
                };
                slice(array.evaluate(doc)?, position, count.evaluate(doc)?)?
            }
        };
        Ok(Some(value))
    }
}

fn parse_string(s: &str) -> Result<Expr> {
    if let Some(var) = s.strip_prefix("$$") {
        let (name, rest) = match var.split_once('.') {
            Some((name, rest)) => (name, Some(rest)),
            None => (var, None),
        };
        if name != "ROOT" && name != "CURRENT" {
            return Err(config(format!("unknown variable '$${}'", name)));
        }
        return Ok(match rest {
            Some(path) => Expr::Field(path.to_string()),
            None => Expr::Root,
        });
    }
    if let Some(path) = s.strip_prefix('$') {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(config(format!("invalid field reference '{}'", s)));
        }
        return Ok(Expr::Field(path.to_string()));
    }
    Ok(Expr::Literal(Value::String(s.to_string())))
}

fn parse_object(obj: &serde_json::Map<String, JsonValue>) -> Result<Expr> {
    let operator = obj.keys().find(|k| k.starts_with('$'));
    let Some(op) = operator else {
        let mut fields = Vec::with_capacity(obj.len());
        for (name, value) in obj {
            fields.push((name.clone(), Expr::parse(value)?));
        }
        return Ok(Expr::Object(fields));
    };
    if obj.len() != 1 {
        return Err(config(format!(
            "expression object with operator '{}' must have exactly one key",
            op
        )));
    }
    let args = &obj[op.as_str()];

    let expr = match op.as_str() {
        "$literal" => Expr::Literal(Value::from_json(args.clone())),
        "$date" => Expr::Literal(Value::from_json(JsonValue::Object(obj.clone()))),
        "$add" => Expr::Add(parse_list(op, args)?),
        "$multiply" => Expr::Multiply(parse_list(op, args)?),
        "$subtract" => {
            let [a, b] = parse_fixed::<2>(op, args)?;
            Expr::Subtract(Box::new(a), Box::new(b))
        }
        "$divide" => {
            let [a, b] = parse_fixed::<2>(op, args)?;
            Expr::Divide(Box::new(a), Box::new(b))
        }
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let cmp = match op.as_str() {
                "$eq" => CompareOp::Eq,
                "$ne" => CompareOp::Ne,
                "$gt" => CompareOp::Gt,
                "$gte" => CompareOp::Gte,
                "$lt" => CompareOp::Lt,
                _ => CompareOp::Lte,
            };
            let [a, b] = parse_fixed::<2>(op, args)?;
            Expr::Compare(cmp, Box::new(a), Box::new(b))
        }
        "$and" => Expr::And(parse_list(op, args)?),
        "$or" => Expr::Or(parse_list(op, args)?),
        "$not" => {
            let mut list = parse_list(op, args)?;
            if list.len() != 1 {
                return Err(config("$not takes exactly one argument".to_string()));
            }
            Expr::Not(Box::new(list.remove(0)))
        }
        "$cond" => parse_cond(args)?,
        "$switch" => parse_switch(args)?,
        "$regexMatch" => parse_regex_match(args)?,
        "$dateToString" => parse_date_to_string(args)?,
        "$slice" => {
            let list = parse_list(op, args)?;
            let mut items = list.into_iter();
            match (items.next(), items.next(), items.next(), items.next()) {
                (Some(array), Some(count), None, None) => Expr::Slice {
                    array: Box::new(array),
                    position: None,
                    count: Box::new(count),
                },
                (Some(array), Some(position), Some(count), None) => Expr::Slice {
                    array: Box::new(array),
                    position: Some(Box::new(position)),
                    count: Box::new(count),
                },
                _ => return Err(config("$slice takes 2 or 3 arguments".to_string())),
            }
        }
        other => return Err(config(format!("unknown expression operator '{}'", other))),
    };
    Ok(expr)
}

/// Argument list; a single non-array argument counts as a one-element list
fn parse_list(op: &str, args: &JsonValue) -> Result<Vec<Expr>> {
    match args {
        JsonValue::Array(items) => items.iter().map(Expr::parse).collect(),
        single => Expr::parse(single)
            .map(|e| vec![e])
            .map_err(|e| config(format!("{}: {}", op, e))),
    }
}

fn parse_fixed<const N: usize>(op: &str, args: &JsonValue) -> Result<[Expr; N]> {
    let list = match args {
        JsonValue::Array(items) => items.iter().map(Expr::parse).collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };
    let len = list.len();
    list.try_into()
        .map_err(|_| config(format!("{} takes exactly {} arguments, got {}", op, N, len)))
}

fn required<'a>(obj: &'a serde_json::Map<String, JsonValue>, op: &str, key: &str) -> Result<&'a JsonValue> {
    obj.get(key)
        .ok_or_else(|| config(format!("{} requires '{}'", op, key)))
}

fn parse_cond(args: &JsonValue) -> Result<Expr> {
    let (condition, then, otherwise) = match args {
        JsonValue::Array(_) => {
            let [c, t, e] = parse_fixed::<3>("$cond", args)?;
            (c, t, e)
        }
        JsonValue::Object(obj) => {
            if let Some(extra) = obj.keys().find(|k| !matches!(k.as_str(), "if" | "then" | "else")) {
                return Err(config(format!("$cond does not accept '{}'", extra)));
            }
            (
                Expr::parse(required(obj, "$cond", "if")?)?,
                Expr::parse(required(obj, "$cond", "then")?)?,
                Expr::parse(required(obj, "$cond", "else")?)?,
            )
        }
        _ => return Err(config("$cond requires an array or an object".to_string())),
    };
    Ok(Expr::Cond {
        condition: Box::new(condition),
        then: Box::new(then),
        otherwise: Box::new(otherwise),
    })
}

fn parse_switch(args: &JsonValue) -> Result<Expr> {
    let obj = args
        .as_object()
        .ok_or_else(|| config("$switch requires an object".to_string()))?;
    let raw_branches = required(obj, "$switch", "branches")?
        .as_array()
        .ok_or_else(|| config("$switch branches must be an array".to_string()))?;
    if raw_branches.is_empty() {
        return Err(config("$switch requires at least one branch".to_string()));
    }

    let mut branches = Vec::with_capacity(raw_branches.len());
    for branch in raw_branches {
        let branch = branch
            .as_object()
            .ok_or_else(|| config("$switch branch must be an object".to_string()))?;
        branches.push((
            Expr::parse(required(branch, "$switch branch", "case")?)?,
            Expr::parse(required(branch, "$switch branch", "then")?)?,
        ));
    }

    let default = obj
        .get("default")
        .ok_or_else(|| config("$switch requires a default".to_string()))?;
    Ok(Expr::Switch {
        branches,
        default: Box::new(Expr::parse(default)?),
    })
}

fn parse_regex_match(args: &JsonValue) -> Result<Expr> {
    let obj = args
        .as_object()
        .ok_or_else(|| config("$regexMatch requires an object".to_string()))?;
    let input = Expr::parse(required(obj, "$regexMatch", "input")?)?;
    let source = required(obj, "$regexMatch", "regex")?
        .as_str()
        .ok_or_else(|| config("$regexMatch regex must be a string".to_string()))?;
    let options = match obj.get("options") {
        None => "",
        Some(JsonValue::String(s)) => s.as_str(),
        Some(_) => return Err(config("$regexMatch options must be a string".to_string())),
    };
    let pattern = Pattern::new(source, options).map_err(|e| config(format!("$regexMatch: {}", e)))?;
    Ok(Expr::RegexMatch {
        input: Box::new(input),
        pattern,
    })
}

fn parse_date_to_string(args: &JsonValue) -> Result<Expr> {
    let obj = args
        .as_object()
        .ok_or_else(|| config("$dateToString requires an object".to_string()))?;
    let format = match obj.get("format") {
        None => DEFAULT_DATE_FORMAT,
        Some(JsonValue::String(s)) => s.as_str(),
        Some(_) => return Err(config("$dateToString format must be a string".to_string())),
    };
    if let Some(tz) = obj.get("timezone") {
        if tz.as_str() != Some("UTC") {
            return Err(config("$dateToString only supports the UTC timezone".to_string()));
        }
    }
    Ok(Expr::DateToString {
        format: parse_format(format)?,
        date: Box::new(Expr::parse(required(obj, "$dateToString", "date")?)?),
    })
}

/// Split a `$dateToString` format into literal text and tokens
pub fn parse_format(format: &str) -> Result<Vec<FormatPart>> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        let token = match chars.next() {
            Some('%') => {
                literal.push('%');
                continue;
            }
            Some('Y') => FormatPart::Year,
            Some('m') => FormatPart::Month,
            Some('d') => FormatPart::Day,
            Some('H') => FormatPart::Hour,
            Some('M') => FormatPart::Minute,
            Some('S') => FormatPart::Second,
            Some('L') => FormatPart::Millisecond,
            Some('j') => FormatPart::DayOfYear,
            Some(other) => {
                return Err(config(format!(
                    "unsupported $dateToString token '%{}'",
                    other
                )))
            }
            None => return Err(config("$dateToString format ends with '%'".to_string())),
        };
        if !literal.is_empty() {
            parts.push(FormatPart::Literal(std::mem::take(&mut literal)));
        }
        parts.push(token);
    }
    if !literal.is_empty() {
        parts.push(FormatPart::Literal(literal));
    }
    Ok(parts)
}

pub fn format_date(format: &[FormatPart], date: &DateTime<Utc>) -> String {
    let mut out = String::new();
    for part in format {
        match part {
            FormatPart::Literal(text) => out.push_str(text),
            FormatPart::Year => out.push_str(&format!("{:04}", date.year())),
            FormatPart::Month => out.push_str(&format!("{:02}", date.month())),
            FormatPart::Day => out.push_str(&format!("{:02}", date.day())),
            FormatPart::Hour => out.push_str(&format!("{:02}", date.hour())),
            FormatPart::Minute => out.push_str(&format!("{:02}", date.minute())),
            FormatPart::Second => out.push_str(&format!("{:02}", date.second())),
            FormatPart::Millisecond => {
                out.push_str(&format!("{:03}", date.timestamp_subsec_millis()))
            }
            FormatPart::DayOfYear => out.push_str(&format!("{:03}", date.ordinal())),
        }
    }
    out
}

fn numeric_operand(op: &str, value: &Value) -> Result<()> {
    match value {
        Value::Int(_) | Value::Float(_) | Value::Null => Ok(()),
        other => Err(type_error(format!(
            "{} only supports numeric operands, found {}",
            op,
            other.value_type()
        ))),
    }
}

fn combine(op: ArithOp, a: &Value, b: &Value) -> Value {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        let exact = match op {
            ArithOp::Add => x.checked_add(*y),
            ArithOp::Subtract => x.checked_sub(*y),
            ArithOp::Multiply => x.checked_mul(*y),
        };
        if let Some(n) = exact {
            return Value::Int(n);
        }
    }
    let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    Value::Float(match op {
        ArithOp::Add => x + y,
        ArithOp::Subtract => x - y,
        ArithOp::Multiply => x * y,
    })
}

fn fold_arith(op: ArithOp, args: &[Expr], doc: &Value) -> Result<Value> {
    let values = args
        .iter()
        .map(|arg| arg.evaluate(doc))
        .collect::<Result<Vec<_>>>()?;

    // $add accepts one date operand; numbers are milliseconds
    if op == ArithOp::Add {
        if let Some(pos) = values.iter().position(|v| matches!(v, Value::Date(_))) {
            return add_to_date(&values, pos);
        }
    }

    for value in &values {
        numeric_operand(op.name(), value)?;
    }
    if values.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    let identity = match op {
        ArithOp::Multiply => Value::Int(1),
        _ => Value::Int(0),
    };
    Ok(values.iter().fold(identity, |acc, v| combine(op, &acc, v)))
}

fn add_to_date(values: &[Value], date_pos: usize) -> Result<Value> {
    let Value::Date(base) = &values[date_pos] else {
        return Ok(Value::Null);
    };
    let mut millis: i64 = 0;
    for (i, value) in values.iter().enumerate() {
        if i == date_pos {
            continue;
        }
        let offset = match value {
            Value::Null => return Ok(Value::Null),
            Value::Int(n) => *n,
            Value::Float(f) => float_millis(*f)?,
            other => {
                return Err(type_error(format!(
                    "$add with a date only accepts numeric operands, found {}",
                    other.value_type()
                )))
            }
        };
        millis = millis.checked_add(offset).ok_or_else(date_out_of_range)?;
    }
    shift_date(base, millis)
}

fn date_out_of_range() -> QuarryError {
    QuarryError::ArithmeticError("date arithmetic out of range".to_string())
}

/// Round a float offset to whole milliseconds, rejecting values no `i64` can hold
fn float_millis(ms: f64) -> Result<i64> {
    let rounded = ms.round();
    if rounded.is_finite() && rounded >= i64::MIN as f64 && rounded < i64::MAX as f64 {
        Ok(rounded as i64)
    } else {
        Err(date_out_of_range())
    }
}

fn shift_date(base: &DateTime<Utc>, millis: i64) -> Result<Value> {
    Duration::try_milliseconds(millis)
        .and_then(|offset| base.checked_add_signed(offset))
        .map(Value::Date)
        .ok_or_else(date_out_of_range)
}

fn subtract(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Date(x), Value::Date(y)) => Ok(Value::Int((*x - *y).num_milliseconds())),
        (Value::Date(x), Value::Int(ms)) => {
            shift_date(x, ms.checked_neg().ok_or_else(date_out_of_range)?)
        }
        (Value::Date(x), Value::Float(ms)) => {
            let ms = float_millis(*ms)?;
            shift_date(x, ms.checked_neg().ok_or_else(date_out_of_range)?)
        }
        (Value::Date(_), Value::Null) => Ok(Value::Null),
        _ => {
            numeric_operand("$subtract", a)?;
            numeric_operand("$subtract", b)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            Ok(combine(ArithOp::Subtract, a, b))
        }
    }
}

fn divide(a: &Value, b: &Value) -> Result<Value> {
    numeric_operand("$divide", a)?;
    numeric_operand("$divide", b)?;
    match (a.as_f64(), b.as_f64()) {
        (Some(_), Some(d)) if d == 0.0 => {
            Err(QuarryError::ArithmeticError("$divide by zero".to_string()))
        }
        (Some(n), Some(d)) => Ok(Value::Float(n / d)),
        _ => Ok(Value::Null),
    }
}

fn integer_arg(name: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i64),
        other => Err(type_error(format!(
            "$slice {} must be an integer, found {}",
            name, other
        ))),
    }
}

fn slice(array: Value, position: Option<Value>, count: Value) -> Result<Value> {
    let items = match array {
        Value::Null => return Ok(Value::Null),
        Value::Array(items) => items,
        other => {
            return Err(type_error(format!(
                "$slice requires an array, found {}",
                other.value_type()
            )))
        }
    };
    let len = items.len() as i64;
    let count = integer_arg("count", &count)?;

    let (start, take) = match position {
        None if count >= 0 => (0, count),
        None => ((len + count).max(0), len),
        Some(position) => {
            let position = integer_arg("position", &position)?;
            if count <= 0 {
                return Err(type_error(format!(
                    "$slice count must be positive when a position is given, got {}",
                    count
                )));
            }
            let start = if position < 0 {
                (len + position).max(0)
            } else {
                position.min(len)
            };
            (start, count)
        }
    };

    Ok(Value::Array(
        items
            .into_iter()
            .skip(start as usize)
            .take(take.max(0) as usize)
            .collect(),
    ))
}
