use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::error::{QuarryError, Result, ValidationError};
use crate::value::{Value, ValueType};
use crate::value_utils::canonical_key;

type Validation = std::result::Result<(), ValidationError>;

/// Compiled document schema
///
/// Built once (from a `$jsonSchema` object or through the builder methods) and immutable
/// afterwards. Validation reports the first violation found: required fields in declared
/// order, then declared properties in declared order, then unknown fields.
#[derive(Clone, Debug)]
pub struct Schema {
    required: Vec<String>,
    properties: IndexMap<String, FieldSchema>,
    additional_properties: bool,
}

/// Constraints for a single field
#[derive(Clone, Debug, Default)]
pub struct FieldSchema {
    /// Allowed type tags; empty means any type
    types: Vec<ValueType>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    pattern: Option<Regex>,
    enum_values: Option<Vec<Value>>,
    unique_items: bool,
    items: Option<Box<FieldSchema>>,
    object: Option<Schema>,
}

/// Map a `bsonType` / `type` name to the value tags it admits
fn parse_type_name(name: &str) -> Option<&'static [ValueType]> {
    const NUMBER: &[ValueType] = &[ValueType::Int, ValueType::Float];
    let types: &'static [ValueType] = match name {
        "int" | "long" | "integer" => &[ValueType::Int],
        "double" | "decimal" => &[ValueType::Float],
        "number" => NUMBER,
        "string" => &[ValueType::String],
        "bool" | "boolean" => &[ValueType::Bool],
        "date" => &[ValueType::Date],
        "array" => &[ValueType::Array],
        "object" => &[ValueType::Object],
        "null" => &[ValueType::Null],
        _ => return None,
    };
    Some(types)
}

impl Default for Schema {
    fn default() -> Self {
        Schema::new()
    }
}

fn schema_error(message: String) -> QuarryError {
    QuarryError::ConfigError(format!("invalid schema: {}", message))
}

impl Schema {
    /// Empty schema accepting any object
    pub fn new() -> Self {
        Schema {
            required: Vec::new(),
            properties: IndexMap::new(),
            additional_properties: true,
        }
    }

    pub fn field(mut self, name: impl Into<String>, schema: FieldSchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn additional_properties(mut self, allow: bool) -> Self {
        self.additional_properties = allow;
        self
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required
    }

    pub fn property(&self, name: &str) -> Option<&FieldSchema> {
        self.properties.get(name)
    }

    /// Parse a schema from its declarative JSON form
    ///
    /// Accepts either `{"$jsonSchema": {...}}` or the inner object directly.
    pub fn from_json(schema: &JsonValue) -> Result<Self> {
        let obj = schema
            .as_object()
            .ok_or_else(|| schema_error("schema must be an object".to_string()))?;
        if let Some(inner) = obj.get("$jsonSchema") {
            return Self::from_json(inner);
        }
        Self::parse_object(obj, "")
    }

    fn parse_object(obj: &serde_json::Map<String, JsonValue>, path: &str) -> Result<Self> {
        if let Some(types) = type_names(obj, path)? {
            if !types.iter().any(|t| *t == "object") {
                return Err(schema_error(format!(
                    "'{}' must be an object schema",
                    display_path(path)
                )));
            }
        }

        let mut schema = Schema::new();

        if let Some(required) = obj.get("required") {
            let arr = required.as_array().ok_or_else(|| {
                schema_error(format!("'{}' required must be an array", display_path(path)))
            })?;
            for entry in arr {
                let name = entry.as_str().ok_or_else(|| {
                    schema_error(format!(
                        "'{}' required entries must be strings",
                        display_path(path)
                    ))
                })?;
                schema.required.push(name.to_string());
            }
        }

        if let Some(props) = obj.get("properties") {
            let props = props.as_object().ok_or_else(|| {
                schema_error(format!("'{}' properties must be an object", display_path(path)))
            })?;
            for (name, spec) in props {
                let field_path = join_path(path, name);
                schema
                    .properties
                    .insert(name.clone(), FieldSchema::from_json(spec, &field_path)?);
            }
        }

        match obj.get("additionalProperties") {
            None => {}
            Some(JsonValue::Bool(allow)) => schema.additional_properties = *allow,
            Some(_) => {
                return Err(schema_error(format!(
                    "'{}' additionalProperties must be a boolean",
                    display_path(path)
                )))
            }
        }

        Ok(schema)
    }

    /// Validate a whole document
    pub fn validate(&self, doc: &Value) -> Validation {
        let obj = doc.as_object().ok_or_else(|| ValidationError::TypeMismatch {
            field: String::new(),
            expected: "object".to_string(),
            found: doc.value_type().to_string(),
        })?;

        for name in &self.required {
            if !obj.contains_key(name) {
                return Err(ValidationError::MissingRequiredField(name.clone()));
            }
        }

        for (name, field) in &self.properties {
            if let Some(value) = obj.get(name) {
                field.check(name, value)?;
            }
        }

        if !self.additional_properties {
            for name in obj.keys() {
                if name != "_id" && !self.properties.contains_key(name) {
                    return Err(ValidationError::UnknownField(name.clone()));
                }
            }
        }

        Ok(())
    }

    /// Validate only the given top-level fields of a document
    ///
    /// Used by the relaxed validation level after an update.
    pub fn validate_fields<'a, I>(&self, doc: &Value, fields: I) -> Validation
    where
        I: IntoIterator<Item = &'a String>,
    {
        let Some(obj) = doc.as_object() else {
            return self.validate(doc);
        };
        for name in fields {
            match (obj.get(name), self.properties.get(name)) {
                (None, _) if self.required.contains(name) => {
                    return Err(ValidationError::MissingRequiredField(name.clone()));
                }
                (None, _) => {}
                (Some(value), Some(field)) => field.check(name, value)?,
                (Some(_), None) if !self.additional_properties && name != "_id" => {
                    return Err(ValidationError::UnknownField(name.clone()));
                }
                (Some(_), None) => {}
            }
        }
        Ok(())
    }
}

fn type_names<'a>(
    obj: &'a serde_json::Map<String, JsonValue>,
    path: &str,
) -> Result<Option<Vec<&'a str>>> {
    let Some(raw) = obj.get("bsonType").or_else(|| obj.get("type")) else {
        return Ok(None);
    };
    let names = match raw {
        JsonValue::String(s) => vec![s.as_str()],
        JsonValue::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().ok_or_else(|| {
                    schema_error(format!(
                        "'{}' type list entries must be strings",
                        display_path(path)
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(schema_error(format!(
                "'{}' type must be a string or an array of strings",
                display_path(path)
            )))
        }
    };
    Ok(Some(names))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}

fn non_negative(spec: &serde_json::Map<String, JsonValue>, key: &str, path: &str) -> Result<Option<usize>> {
    match spec.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| {
                schema_error(format!(
                    "'{}' {} must be a non-negative integer",
                    path, key
                ))
            }),
    }
}

fn number(spec: &serde_json::Map<String, JsonValue>, key: &str, path: &str) -> Result<Option<f64>> {
    match spec.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .as_f64()
            .map(Some)
            .ok_or_else(|| schema_error(format!("'{}' {} must be a number", path, key))),
    }
}

impl FieldSchema {
    pub fn new(types: &[ValueType]) -> Self {
        FieldSchema {
            types: types.to_vec(),
            ..Default::default()
        }
    }

    /// Field with no type restriction
    pub fn any() -> Self {
        FieldSchema::default()
    }

    pub fn string() -> Self {
        Self::new(&[ValueType::String])
    }

    pub fn int() -> Self {
        Self::new(&[ValueType::Int])
    }

    pub fn number() -> Self {
        Self::new(&[ValueType::Int, ValueType::Float])
    }

    pub fn bool() -> Self {
        Self::new(&[ValueType::Bool])
    }

    pub fn date() -> Self {
        Self::new(&[ValueType::Date])
    }

    pub fn array(items: FieldSchema) -> Self {
        let mut schema = Self::new(&[ValueType::Array]);
        schema.items = Some(Box::new(items));
        schema
    }

    pub fn object(schema: Schema) -> Self {
        let mut field = Self::new(&[ValueType::Object]);
        field.object = Some(schema);
        field
    }

    pub fn nullable(mut self) -> Self {
        if !self.types.is_empty() && !self.types.contains(&ValueType::Null) {
            self.types.push(ValueType::Null);
        }
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.minimum = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.maximum = Some(max);
        self
    }

    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Result<Self> {
        self.pattern = Some(
            Regex::new(pattern)
                .map_err(|e| schema_error(format!("invalid pattern '{}': {}", pattern, e)))?,
        );
        Ok(self)
    }

    pub fn enum_values(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn unique_items(mut self) -> Self {
        self.unique_items = true;
        self
    }

    fn from_json(spec: &JsonValue, path: &str) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| schema_error(format!("property '{}' must be an object", path)))?;

        let mut field = FieldSchema::default();
        if let Some(names) = type_names(obj, path)? {
            for name in names {
                let types = parse_type_name(name).ok_or_else(|| {
                    schema_error(format!("unsupported type '{}' for '{}'", name, path))
                })?;
                for t in types {
                    if !field.types.contains(t) {
                        field.types.push(*t);
                    }
                }
            }
        }

        field.min_length = non_negative(obj, "minLength", path)?;
        field.max_length = non_negative(obj, "maxLength", path)?;
        if let Some(min) = non_negative(obj, "minItems", path)? {
            field.min_length = Some(min);
        }
        if let Some(max) = non_negative(obj, "maxItems", path)? {
            field.max_length = Some(max);
        }
        field.minimum = number(obj, "minimum", path)?;
        field.maximum = number(obj, "maximum", path)?;

        if let Some(raw) = obj.get("pattern") {
            let pattern = raw
                .as_str()
                .ok_or_else(|| schema_error(format!("'{}' pattern must be a string", path)))?;
            field = field.pattern(pattern)?;
        }

        if let Some(raw) = obj.get("enum") {
            let values = raw
                .as_array()
                .ok_or_else(|| schema_error(format!("'{}' enum must be an array", path)))?;
            field.enum_values = Some(values.iter().cloned().map(Value::from_json).collect());
        }

        match obj.get("uniqueItems") {
            None => {}
            Some(JsonValue::Bool(unique)) => field.unique_items = *unique,
            Some(_) => {
                return Err(schema_error(format!(
                    "'{}' uniqueItems must be a boolean",
                    path
                )))
            }
        }

        if let Some(items) = obj.get("items") {
            field.items = Some(Box::new(FieldSchema::from_json(
                items,
                &format!("{}.items", path),
            )?));
        }

        if obj.contains_key("properties")
            || obj.contains_key("required")
            || obj.contains_key("additionalProperties")
        {
            let mut nested = obj.clone();
            nested.remove("bsonType");
            nested.remove("type");
            field.object = Some(Schema::parse_object(&nested, path)?);
        }

        Ok(field)
    }

    /// Check a present value against this field's constraints
    fn check(&self, field: &str, value: &Value) -> Validation {
        let found = value.value_type();
        if !self.types.is_empty() && !self.types.contains(&found) {
            return Err(ValidationError::TypeMismatch {
                field: field.to_string(),
                expected: self
                    .types
                    .iter()
                    .map(ValueType::as_str)
                    .collect::<Vec<_>>()
                    .join("|"),
                found: found.to_string(),
            });
        }

        let violation = |reason: String| ValidationError::ConstraintViolation {
            field: field.to_string(),
            reason,
        };

        if let Value::String(s) = value {
            let len = s.chars().count();
            if let Some(min) = self.min_length {
                if len < min {
                    return Err(violation(format!("length {} is below minimum {}", len, min)));
                }
            }
            if let Some(max) = self.max_length {
                if len > max {
                    return Err(violation(format!("length {} exceeds maximum {}", len, max)));
                }
            }
            if let Some(pattern) = &self.pattern {
                if !pattern.is_match(s) {
                    return Err(violation(format!(
                        "value does not match pattern '{}'",
                        pattern.as_str()
                    )));
                }
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum {
                if n < min {
                    return Err(violation(format!("{} is below minimum {}", value, min)));
                }
            }
            if let Some(max) = self.maximum {
                if n > max {
                    return Err(violation(format!("{} exceeds maximum {}", value, max)));
                }
            }
        }

        if let Some(allowed) = &self.enum_values {
            if !allowed.contains(value) {
                return Err(violation(format!("{} is not one of the allowed values", value)));
            }
        }

        if let Value::Array(items) = value {
            if let Some(min) = self.min_length {
                if items.len() < min {
                    return Err(violation(format!(
                        "{} items, minimum is {}",
                        items.len(),
                        min
                    )));
                }
            }
            if let Some(max) = self.max_length {
                if items.len() > max {
                    return Err(violation(format!(
                        "{} items, maximum is {}",
                        items.len(),
                        max
                    )));
                }
            }
            if let Some(item_schema) = &self.items {
                for (index, item) in items.iter().enumerate() {
                    item_schema.check(&format!("{}.{}", field, index), item)?;
                }
            }
            if self.unique_items {
                let mut seen = std::collections::HashSet::new();
                for item in items {
                    if !seen.insert(canonical_key(item)) {
                        return Err(violation(format!("duplicate item {}", item)));
                    }
                }
            }
        }

        if let (Some(nested), Value::Object(_)) = (&self.object, value) {
            nested.validate(value).map_err(|e| e.nested_under(field))?;
        }

        Ok(())
    }
}
