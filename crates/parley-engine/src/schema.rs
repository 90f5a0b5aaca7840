//! Minimal JSON-schema check for tool parameters.
//!
//! Covers what tool schemas actually use here: top-level `type: object`,
//! `required`, primitive `type` on each property, and `enum`. Nested
//! schemas are not descended into.

use serde_json::{Map, Value};

/// Check `params` against `schema`. The error names the first violation.
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), String> {
    let Some(params) = params.as_object() else {
        return Err(format!("parameters must be an object, got {}", type_name(params)));
    };
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };
    if let Some(kind) = schema.get("type").and_then(Value::as_str) {
        if kind != "object" {
            return Err(format!("tool schema must describe an object, not {kind}"));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !params.contains_key(name) {
                return Err(format!("missing required parameter '{name}'"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (name, value) in params {
        if let Some(property) = properties.get(name).and_then(Value::as_object) {
            check_property(name, property, value)?;
        }
    }
    Ok(())
}

fn check_property(name: &str, property: &Map<String, Value>, value: &Value) -> Result<(), String> {
    match property.get("type") {
        Some(Value::String(expected)) => {
            if !matches_type(expected, value) {
                return Err(format!(
                    "parameter '{name}' must be {expected}, got {}",
                    type_name(value)
                ));
            }
        }
        Some(Value::Array(options)) => {
            let ok = options
                .iter()
                .filter_map(Value::as_str)
                .any(|expected| matches_type(expected, value));
            if !ok {
                return Err(format!(
                    "parameter '{name}' has unexpected type {}",
                    type_name(value)
                ));
            }
        }
        _ => {}
    }

    if let Some(allowed) = property.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("parameter '{name}' must be one of {}", Value::Array(allowed.clone())));
        }
    }
    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // unknown type keywords are not enforced
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
