//! Validation of instance parameter values against extension-declared definitions.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ControllerError, ControllerResult, ParameterViolation};

const REQUIRED_MESSAGE: &str = "This is a required parameter.";

/// Parameter declared by an extension version. `definition` is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub id: String,
    pub name: String,
    #[serde(rename = "definition")]
    pub raw_definition: Value,
}

/// Value supplied for the definition whose `id` equals `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: String,
}

impl ParameterValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Checks `values` against `definitions`, collecting every violation into one error.
pub fn validate_parameters(
    definitions: &[ParameterDefinition],
    values: &[ParameterValue],
) -> ControllerResult<()> {
    let values_by_id = values
        .iter()
        .map(|value| (value.name.as_str(), value.value.as_str()))
        .collect::<HashMap<_, _>>();
    let violations = definitions
        .iter()
        .filter_map(|definition| {
            validate_definition(definition, values_by_id.get(definition.id.as_str()).copied())
                .map(|message| ParameterViolation {
                    id: definition.id.clone(),
                    name: definition.name.clone(),
                    message,
                })
        })
        .collect::<Vec<_>>();
    if violations.is_empty() {
        Ok(())
    } else {
        tracing::debug!(violations = violations.len(), "parameter validation failed");
        Err(ControllerError::Validation { violations })
    }
}

fn validate_definition(definition: &ParameterDefinition, value: Option<&str>) -> Option<String> {
    let raw = &definition.raw_definition;
    let kind = raw.get("type").and_then(Value::as_str)?;
    if !matches!(kind, "string" | "boolean" | "select") {
        return None;
    }
    let required = raw
        .get("required")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let value = match value {
        Some(value) if !value.is_empty() => value,
        _ if required => return Some(REQUIRED_MESSAGE.to_string()),
        _ => return None,
    };
    match kind {
        "string" => validate_string(raw, value),
        "boolean" => validate_boolean(value),
        _ => validate_select(raw, value),
    }
}

fn validate_string(raw: &Value, value: &str) -> Option<String> {
    let pattern = raw.get("regex").and_then(Value::as_str)?;
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(regex) if regex.is_match(value) => None,
        Ok(_) => Some("The value has an invalid format.".to_string()),
        Err(error) => Some(format!("The parameter definition has an invalid regex: {error}")),
    }
}

fn validate_boolean(value: &str) -> Option<String> {
    match value {
        "true" | "false" => None,
        _ => Some("Boolean value must be 'true' or 'false'.".to_string()),
    }
}

fn validate_select(raw: &Value, value: &str) -> Option<String> {
    let allowed = raw
        .get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|option| option.get("id").and_then(Value::as_str))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if allowed.contains(&value) {
        None
    } else {
        Some(format!(
            "The value is not allowed. Possible values are {}.",
            allowed
                .iter()
                .map(|option| format!("'{option}'"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}
