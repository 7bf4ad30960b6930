//! Parameter schema validation.
//!
//! Deployments declare a JSON-Schema-like description of their parameters,
//! and work pools describe the infrastructure variables their job template
//! accepts the same way. [`ParameterValidator`] is the seam; the bundled
//! [`JsonSchemaValidator`] understands the subset these documents use:
//! `type`, `properties`, `required`, `additionalProperties`, `enum`,
//! `pattern`, `minimum`, `maximum`, `exclusiveMinimum`, `exclusiveMaximum`
//! and `items`. Unknown keywords are ignored.

use std::fmt;

use regex::Regex;
use serde_json::{Map, Value};

/// A single reason a value does not satisfy a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Dotted path to the offending value (`""` for the root).
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Validates a parameter mapping against a declared schema.
pub trait ParameterValidator: Send + Sync {
    fn validate(&self, schema: &Value, values: &Map<String, Value>) -> Result<(), Vec<SchemaViolation>>;
}

/// Built-in validator for the JSON Schema subset described above.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaValidator;

impl ParameterValidator for JsonSchemaValidator {
    fn validate(&self, schema: &Value, values: &Map<String, Value>) -> Result<(), Vec<SchemaViolation>> {
        let mut violations = Vec::new();
        check(schema, &Value::Object(values.clone()), "", &mut violations);
        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }
}

/// Names of the top-level properties a schema declares.
pub fn declared_properties(schema: &Value) -> Vec<&str> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

/// Default values declared for top-level properties.
pub fn property_defaults(schema: &Value) -> Map<String, Value> {
    let mut defaults = Map::new();
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in props {
            if let Some(default) = prop.get("default") {
                defaults.insert(name.clone(), default.clone());
            }
        }
    }
    defaults
}

fn check(schema: &Value, value: &Value, path: &str, out: &mut Vec<SchemaViolation>) {
    let Some(schema) = schema.as_object() else {
        // `true`/`{}`-like schemas accept anything.
        if schema == &Value::Bool(false) {
            push(out, path, "no value is allowed here");
        }
        return;
    };

    if let Some(expected) = schema.get("type")
        && !type_matches(expected, value)
    {
        push(out, path, format!("expected type {expected}, got {}", type_name(value)));
        return;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array)
        && !allowed.contains(value)
    {
        push(out, path, format!("value {value} is not one of {}", Value::Array(allowed.clone())));
    }

    match value {
        Value::Object(map) => check_object(schema, map, path, out),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (idx, item) in items.iter().enumerate() {
                    check(item_schema, item, &join(path, &idx.to_string()), out);
                }
            }
        }
        Value::String(s) => {
            if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
                match Regex::new(pattern) {
                    Ok(re) if !re.is_match(s) => {
                        push(out, path, format!("{s:?} does not match pattern {pattern:?}"))
                    }
                    Ok(_) => {}
                    Err(e) => push(out, path, format!("schema pattern is invalid: {e}")),
                }
            }
        }
        Value::Number(n) => {
            if let Some(x) = n.as_f64() {
                check_bounds(schema, x, path, out);
            }
        }
        Value::Bool(_) | Value::Null => {}
    }
}

fn check_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
    out: &mut Vec<SchemaViolation>,
) {
    let props = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                push(out, &join(path, name), "required property is missing");
            }
        }
    }

    for (key, val) in map {
        let child = join(path, key);
        match props.and_then(|p| p.get(key)) {
            Some(prop_schema) => check(prop_schema, val, &child, out),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => push(out, &child, "unknown property"),
                Some(extra @ Value::Object(_)) => check(extra, val, &child, out),
                _ => {}
            },
        }
    }
}

fn check_bounds(schema: &Map<String, Value>, x: f64, path: &str, out: &mut Vec<SchemaViolation>) {
    let bound = |key: &str| schema.get(key).and_then(Value::as_f64);
    if let Some(min) = bound("minimum")
        && x < min
    {
        push(out, path, format!("{x} is less than minimum {min}"));
    }
    if let Some(max) = bound("maximum")
        && x > max
    {
        push(out, path, format!("{x} is greater than maximum {max}"));
    }
    if let Some(min) = bound("exclusiveMinimum")
        && x <= min
    {
        push(out, path, format!("{x} must be greater than {min}"));
    }
    if let Some(max) = bound("exclusiveMaximum")
        && x >= max
    {
        push(out, path, format!("{x} must be less than {max}"));
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(t) => single_type_matches(t, value),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| single_type_matches(t, value)),
        _ => true,
    }
}

fn single_type_matches(t: &str, value: &Value) -> bool {
    match t {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() { key.to_string() } else { format!("{path}.{key}") }
}

fn push(out: &mut Vec<SchemaViolation>, path: &str, message: impl Into<String>) {
    out.push(SchemaViolation {
        path: path.to_string(),
        message: message.into(),
    });
}
