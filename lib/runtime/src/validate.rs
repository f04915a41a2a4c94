//! Parameter validation for tool invocations.

use crate::error::ParameterError;
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Declares one accepted parameter of a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Whether the parameter must be present.
    pub required: bool,
    /// Expected JSON type (`string`, `number`, `boolean`, `object`,
    /// `array`); `None` accepts any type.
    pub kind: Option<String>,
}

impl ParameterSpec {
    /// A required parameter of the given type.
    #[must_use]
    pub fn required(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            kind: Some(kind.into()),
        }
    }

    /// An optional parameter of the given type.
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            kind: Some(kind.into()),
        }
    }
}

/// Validates parameters against their specs, returning every failure.
#[must_use]
pub fn validate_parameters(
    specs: &[ParameterSpec],
    parameters: &JsonMap<String, JsonValue>,
) -> Vec<ParameterError> {
    let mut errors = Vec::new();

    for spec in specs {
        let Some(value) = parameters.get(&spec.name) else {
            if spec.required {
                errors.push(ParameterError::new(&spec.name, "is required"));
            }
            continue;
        };

        if let Some(kind) = &spec.kind
            && !matches_kind(value, kind)
        {
            errors.push(ParameterError::new(
                &spec.name,
                format!("expected {kind}"),
            ));
        }
    }

    errors
}

fn matches_kind(value: &JsonValue, kind: &str) -> bool {
    match kind {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn missing_required_parameter_reported() {
        let specs = vec![ParameterSpec::required("url", "string")];
        let errors = validate_parameters(&specs, &params(json!({})));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].parameter, "url");
    }

    #[test]
    fn type_mismatch_reported() {
        let specs = vec![ParameterSpec::required("count", "number")];
        let errors = validate_parameters(&specs, &params(json!({"count": "three"})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("number"));
    }

    #[test]
    fn optional_parameters_may_be_absent() {
        let specs = vec![ParameterSpec::optional("note", "string")];
        assert!(validate_parameters(&specs, &params(json!({}))).is_empty());
    }

    #[test]
    fn valid_parameters_pass() {
        let specs = vec![
            ParameterSpec::required("url", "string"),
            ParameterSpec::optional("retries", "number"),
        ];
        let errors = validate_parameters(
            &specs,
            &params(json!({"url": "https://example.com", "retries": 2})),
        );
        assert!(errors.is_empty());
    }
}
