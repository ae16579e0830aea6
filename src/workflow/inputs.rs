//! Run-input resolution against a workflow's declared input specs.

use serde_json::{Map, Value};

use super::types::InputSpec;
use crate::error::{Error, Result};

/// Merge supplied inputs with declared defaults and type-check the result.
///
/// Unknown keys are rejected so typos fail before the run starts. Required
/// inputs without a supplied value are an error; optional inputs without a
/// default resolve to null.
pub fn resolve_inputs(
    specs: &[InputSpec],
    supplied: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    for key in supplied.keys() {
        if !specs.iter().any(|s| &s.name == key) {
            return Err(Error::Input(format!("unknown input '{}'", key)));
        }
    }

    let mut resolved = Map::with_capacity(specs.len());
    for spec in specs {
        let value = match supplied.get(&spec.name) {
            Some(value) => value.clone(),
            None => match &spec.default {
                Some(default) => default.clone(),
                None if spec.required => {
                    return Err(Error::Input(format!(
                        "required input '{}' was not supplied",
                        spec.name
                    )));
                }
                None => Value::Null,
            },
        };
        if !value.is_null() && !spec.input_type.matches(&value) {
            return Err(Error::Input(format!(
                "input '{}' expects type '{}'",
                spec.name,
                spec.input_type.as_str()
            )));
        }
        resolved.insert(spec.name.clone(), value);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::InputType;
    use serde_json::json;

    fn spec(name: &str, input_type: InputType, required: bool, default: Option<Value>) -> InputSpec {
        InputSpec {
            name: name.to_string(),
            input_type,
            required,
            default,
            description: String::new(),
        }
    }

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {:?}", other),
        }
    }

    #[test]
    fn test_defaults_fill_in() {
        let specs = vec![
            spec("region", InputType::String, false, Some(json!("us-east"))),
            spec("limit", InputType::Int, true, None),
        ];
        let resolved = resolve_inputs(&specs, &as_map(json!({"limit": 10}))).unwrap();
        assert_eq!(resolved["region"], json!("us-east"));
        assert_eq!(resolved["limit"], json!(10));
    }

    #[test]
    fn test_missing_required() {
        let specs = vec![spec("limit", InputType::Int, true, None)];
        let err = resolve_inputs(&specs, &Map::new()).unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_optional_without_default_is_null() {
        let specs = vec![spec("note", InputType::String, false, None)];
        let resolved = resolve_inputs(&specs, &Map::new()).unwrap();
        assert_eq!(resolved["note"], Value::Null);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let specs = vec![spec("limit", InputType::Int, false, Some(json!(1)))];
        let err = resolve_inputs(&specs, &as_map(json!({"limt": 2}))).unwrap_err();
        assert!(err.to_string().contains("limt"));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let specs = vec![spec("limit", InputType::Int, true, None)];
        let err = resolve_inputs(&specs, &as_map(json!({"limit": "ten"}))).unwrap_err();
        assert!(err.to_string().contains("type 'int'"));
    }
}
