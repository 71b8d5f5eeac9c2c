use serde_json::Value;

/// Validates caller input against an agent's declared input schema.
///
/// The schema is a structural contract of the form
/// `{"fields": [{"name": "...", "type": "...", "required": true}]}` with
/// types string, number, integer, boolean, object, array and any. An empty
/// or absent `fields` list accepts any JSON object. Violations are collected
/// per field so the caller gets the full list in one response.
pub fn validate_input(input: &Value, schema: &Value) -> Result<(), Vec<String>> {
    let fields = match schema.get("fields").and_then(Value::as_array) {
        Some(fields) if !fields.is_empty() => fields,
        _ => return Ok(()),
    };

    let mut violations = Vec::new();
    let Some(input_obj) = input.as_object() else {
        return Err(vec!["input must be a JSON object".to_string()]);
    };

    for field in fields {
        let Some(name) = field.get("name").and_then(Value::as_str) else {
            continue; // malformed schema entry, nothing to check against
        };
        let required = field
            .get("required")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let expected = field.get("type").and_then(Value::as_str).unwrap_or("any");

        match input_obj.get(name) {
            None | Some(Value::Null) => {
                if required {
                    violations.push(format!("missing required field '{name}'"));
                }
            }
            Some(value) => {
                if !type_matches(value, expected) {
                    violations.push(format!(
                        "field '{name}' expected {expected}, got {}",
                        type_name(value)
                    ));
                }
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
