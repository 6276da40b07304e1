use serde_json::{Map, Value};

use crate::error::{SchemaError, ToolError};

pub(crate) fn validate_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    match schema_obj.get("type").and_then(Value::as_str) {
        Some("object") => {}
        _ => return Err(SchemaError::RootTypeMustBeObject),
    }

    if let Some(required) = schema_obj.get("required") {
        let all_strings = required
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !all_strings {
            return Err(SchemaError::InvalidRequired);
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        if let Some((name, _)) = properties.iter().find(|(_, field)| !field.is_object()) {
            return Err(SchemaError::InvalidProperty(name.clone()));
        }
    }

    Ok(())
}

pub(crate) fn validate_arguments(
    tool_name: &str,
    schema: &Value,
    args: &Value,
) -> Result<(), ToolError> {
    let invalid = |message: String| ToolError::InvalidArguments {
        tool: tool_name.to_string(),
        message,
    };

    let args_obj = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be a JSON object".to_string()))?;
    let schema_obj = schema
        .as_object()
        .ok_or_else(|| invalid("tool schema must be a JSON object".to_string()))?;

    let required = schema_obj
        .get("required")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for field_name in required.iter().filter_map(Value::as_str) {
        if !args_obj.contains_key(field_name) {
            return Err(invalid(format!("missing required field: {field_name}")));
        }
    }

    let empty = Map::new();
    let properties = schema_obj
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let closed = schema_obj
        .get("additionalProperties")
        .and_then(Value::as_bool)
        == Some(false);

    for (key, value) in args_obj {
        match properties.get(key) {
            Some(field_schema) => check_field(key, field_schema, value).map_err(&invalid)?,
            None if closed => return Err(invalid(format!("unknown field: {key}"))),
            None => {}
        }
    }

    Ok(())
}

fn check_field(key: &str, field_schema: &Value, value: &Value) -> Result<(), String> {
    if let Some(type_name) = field_schema.get("type").and_then(Value::as_str) {
        if !value_matches_type(value, type_name) {
            return Err(format!("field '{key}' must be of type {type_name}"));
        }
    }

    if let Some(allowed) = field_schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("field '{key}' must be one of {}", Value::from(allowed.clone())));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(minimum) = field_schema.get("minimum").and_then(Value::as_f64) {
            if number < minimum {
                return Err(format!("field '{key}' must be at least {minimum}"));
            }
        }
        if let Some(bound) = field_schema.get("exclusiveMinimum").and_then(Value::as_f64) {
            if number <= bound {
                return Err(format!("field '{key}' must be greater than {bound}"));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
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
