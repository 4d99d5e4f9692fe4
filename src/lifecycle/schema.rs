//! A small dynamic object schema for request inputs.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value as JsonValue};

use super::validation::{ValidationFailure, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn describe(&self) -> &'static str {
        match self {
            FieldType::Any => "a value",
            FieldType::String => "a string",
            FieldType::Number => "a number",
            FieldType::Integer => "an integer",
            FieldType::Boolean => "a boolean",
            FieldType::Object => "an object",
            FieldType::Array => "an array",
        }
    }

    fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }

    /// Converts string inputs (query, params, headers) to the field type.
    fn coerce(&self, value: JsonValue) -> JsonValue {
        let JsonValue::String(s) = &value else {
            return value;
        };
        let converted = match self {
            FieldType::Number => s.parse::<f64>().ok().and_then(|n| {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    Some(JsonValue::from(n as i64))
                } else {
                    serde_json::Number::from_f64(n).map(JsonValue::Number)
                }
            }),
            FieldType::Integer => s.parse::<i64>().ok().map(JsonValue::from),
            FieldType::Boolean => match s.as_str() {
                "true" => Some(JsonValue::Bool(true)),
                "false" => Some(JsonValue::Bool(false)),
                _ => None,
            },
            FieldType::Array => Some(JsonValue::Array(
                s.split(',').map(|p| JsonValue::String(p.to_string())).collect(),
            )),
            _ => None,
        };
        converted.unwrap_or(value)
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    ty: FieldType,
    required: bool,
    min: Option<f64>,
    max: Option<f64>,
    pattern: Option<Regex>,
    default: Option<JsonValue>,
    allowed: Option<Vec<JsonValue>>,
}

impl Field {
    pub fn new(ty: FieldType) -> Self {
        Self {
            ty,
            required: false,
            min: None,
            max: None,
            pattern: None,
            default: None,
            allowed: None,
        }
    }

    pub fn any() -> Self {
        Self::new(FieldType::Any)
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn number() -> Self {
        Self::new(FieldType::Number)
    }

    pub fn integer() -> Self {
        Self::new(FieldType::Integer)
    }

    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    pub fn object() -> Self {
        Self::new(FieldType::Object)
    }

    pub fn array() -> Self {
        Self::new(FieldType::Array)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Lower bound: value for numbers, length for strings and arrays.
    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn default_value(mut self, value: JsonValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn valid(mut self, allowed: Vec<JsonValue>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    fn check(&self, key: &str, value: JsonValue, coerce: bool) -> Result<JsonValue, ValidationFailure> {
        let value = if coerce { self.ty.coerce(value) } else { value };
        let fail = |msg: String| -> Result<JsonValue, ValidationFailure> {
            Err(ValidationFailure::new(msg).key(key))
        };

        if !self.ty.accepts(&value) {
            return fail(format!("\"{key}\" must be {}", self.ty.describe()));
        }

        let size = match &value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => Some(s.chars().count() as f64),
            JsonValue::Array(a) => Some(a.len() as f64),
            _ => None,
        };
        if let (Some(size), Some(min)) = (size, self.min) {
            if size < min {
                return fail(format!("\"{key}\" must be at least {min}"));
            }
        }
        if let (Some(size), Some(max)) = (size, self.max) {
            if size > max {
                return fail(format!("\"{key}\" must be at most {max}"));
            }
        }

        if let (Some(pattern), JsonValue::String(s)) = (&self.pattern, &value) {
            if !pattern.is_match(s) {
                return fail(format!(
                    "\"{key}\" fails to match the required pattern: {}",
                    pattern.as_str()
                ));
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&value) {
                let list: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                return fail(format!("\"{key}\" must be one of [{}]", list.join(", ")));
            }
        }

        Ok(value)
    }
}

/// Policy for keys the schema does not describe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Unknown {
    Allow,
    Strip,
    #[default]
    Deny,
}

/// Object schema, reporting the first failing key
#[derive(Debug, Clone)]
pub struct Schema {
    fields: BTreeMap<String, Field>,
    unknown: Unknown,
    coerce: bool,
}

impl Default for Schema {
    fn default() -> Self {
        Self::object()
    }
}

impl Schema {
    pub fn object() -> Self {
        Self {
            fields: BTreeMap::new(),
            unknown: Unknown::default(),
            coerce: true,
        }
    }

    pub fn field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn unknown(mut self, unknown: Unknown) -> Self {
        self.unknown = unknown;
        self
    }

    /// Whether string inputs are converted to the declared field types.
    pub fn coerce(mut self, coerce: bool) -> Self {
        self.coerce = coerce;
        self
    }
}

impl Validator for Schema {
    fn validate(&self, value: &JsonValue) -> Result<JsonValue, ValidationFailure> {
        let input = match value {
            JsonValue::Object(map) => map.clone(),
            JsonValue::Null => Map::new(),
            _ => return Err(ValidationFailure::new("\"value\" must be an object")),
        };

        let mut output = Map::new();
        for (name, field) in &self.fields {
            match input.get(name) {
                Some(v) => {
                    output.insert(name.clone(), field.check(name, v.clone(), self.coerce)?);
                }
                None if field.required => {
                    return Err(ValidationFailure::new(format!("\"{name}\" is required")).key(name))
                }
                None => {
                    if let Some(default) = &field.default {
                        output.insert(name.clone(), default.clone());
                    }
                }
            }
        }

        for (key, v) in input {
            if self.fields.contains_key(&key) {
                continue;
            }
            match self.unknown {
                Unknown::Allow => {
                    output.insert(key, v);
                }
                Unknown::Strip => {}
                Unknown::Deny => {
                    return Err(ValidationFailure::new(format!("\"{key}\" is not allowed")).key(key))
                }
            }
        }

        Ok(JsonValue::Object(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> Schema {
        Schema::object()
            .field("id", Field::integer().required().min(1.0))
            .field("name", Field::string().min(2.0).max(10.0))
            .field("role", Field::string().valid(vec![json!("admin"), json!("user")]))
            .field("limit", Field::integer().default_value(json!(10)))
    }

    #[test]
    fn test_coercion_and_defaults() {
        let out = user_schema()
            .validate(&json!({"id": "42", "name": "Ann"}))
            .unwrap();
        assert_eq!(out, json!({"id": 42, "name": "Ann", "limit": 10}));
    }

    #[test]
    fn test_failures_name_the_key() {
        let schema = user_schema();

        let err = schema.validate(&json!({})).unwrap_err();
        assert_eq!(err.keys, vec!["id".to_string()]);
        assert_eq!(err.message, "\"id\" is required");

        let err = schema.validate(&json!({"id": "abc"})).unwrap_err();
        assert_eq!(err.message, "\"id\" must be an integer");

        let err = schema.validate(&json!({"id": 1, "name": "A"})).unwrap_err();
        assert_eq!(err.keys, vec!["name".to_string()]);

        let err = schema.validate(&json!({"id": 1, "role": "root"})).unwrap_err();
        assert_eq!(err.keys, vec!["role".to_string()]);

        let err = schema.validate(&json!({"id": 1, "extra": true})).unwrap_err();
        assert_eq!(err.message, "\"extra\" is not allowed");
    }

    #[test]
    fn test_unknown_policies_and_patterns() {
        let schema = Schema::object()
            .field("code", Field::string().pattern(Regex::new("^[A-Z]{3}$").unwrap()))
            .unknown(Unknown::Strip);
        let out = schema.validate(&json!({"code": "ABC", "x": 1})).unwrap();
        assert_eq!(out, json!({"code": "ABC"}));
        assert!(schema.validate(&json!({"code": "abc"})).is_err());

        let allow = Schema::object().unknown(Unknown::Allow);
        assert_eq!(allow.validate(&json!({"x": 1})).unwrap(), json!({"x": 1}));
        assert!(allow.validate(&json!([1])).is_err());
    }

    #[test]
    fn test_no_coercion() {
        let schema = Schema::object().field("n", Field::number()).coerce(false);
        assert!(schema.validate(&json!({"n": "1"})).is_err());
        assert!(schema.validate(&json!({"n": 1.5})).is_ok());
    }
}
