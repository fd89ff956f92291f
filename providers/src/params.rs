//! Declared parameter schemas for extractors and their validation.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::ProviderError;

/// Config key validated by the pricing module instead of the parameter schema.
pub const PRICING_KEY: &str = "pricing";

/// Type of a parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamType {
    /// Any string, optionally matching a pattern.
    String {
        /// Regex the value must match.
        #[serde(skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    /// A finite number within optional bounds.
    Number {
        /// Inclusive lower bound.
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        /// Inclusive upper bound.
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// `true` or `false`.
    Boolean,
    /// One of a fixed set of strings.
    Enum {
        /// Allowed values.
        values: Vec<String>,
    },
}

/// One declared parameter.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    /// Config key.
    pub key: &'static str,
    /// Value type and constraints.
    #[serde(flatten)]
    pub param_type: ParamType,
    /// Whether the key must be present.
    pub required: bool,
    /// Human description.
    pub description: &'static str,
    /// Value used when the key is absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    /// An optional string parameter.
    #[must_use]
    pub const fn string(key: &'static str, description: &'static str) -> Self {
        Self {
            key,
            param_type: ParamType::String { pattern: None },
            required: false,
            description,
            default: None,
        }
    }

    /// An optional number parameter.
    #[must_use]
    pub const fn number(key: &'static str, description: &'static str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            key,
            param_type: ParamType::Number { min, max },
            required: false,
            description,
            default: None,
        }
    }

    /// An optional boolean parameter.
    #[must_use]
    pub const fn boolean(key: &'static str, description: &'static str) -> Self {
        Self {
            key,
            param_type: ParamType::Boolean,
            required: false,
            description,
            default: None,
        }
    }

    /// An optional enum parameter.
    #[must_use]
    pub fn one_of(key: &'static str, description: &'static str, values: &[&str]) -> Self {
        Self {
            key,
            param_type: ParamType::Enum {
                values: values.iter().map(ToString::to_string).collect(),
            },
            required: false,
            description,
            default: None,
        }
    }

    /// Marks the parameter as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Restricts a string parameter to a regex.
    #[must_use]
    pub fn with_pattern(mut self, pattern: &str) -> Self {
        if let ParamType::String { pattern: p } = &mut self.param_type {
            *p = Some(pattern.to_string());
        }
        self
    }

    fn check(&self, value: &Value) -> Option<String> {
        let key = self.key;
        match &self.param_type {
            ParamType::String { pattern } => {
                let Some(s) = value.as_str() else {
                    return Some(format!("Parameter {key} must be a string"));
                };
                let pattern = pattern.as_deref()?;
                match Regex::new(pattern) {
                    Ok(re) if re.is_match(s) => None,
                    Ok(_) => Some(format!("Parameter {key} does not match pattern")),
                    Err(e) => Some(format!("Parameter {key} has an invalid pattern: {e}")),
                }
            }
            ParamType::Number { min, max } => {
                let Some(n) = value.as_f64().filter(|n| n.is_finite()) else {
                    return Some(format!("Parameter {key} must be a number"));
                };
                if let Some(min) = min.filter(|m| n < *m) {
                    return Some(format!("Parameter {key} must be >= {min}"));
                }
                if let Some(max) = max.filter(|m| n > *m) {
                    return Some(format!("Parameter {key} must be <= {max}"));
                }
                None
            }
            ParamType::Boolean => (!value.is_boolean())
                .then(|| format!("Parameter {key} must be a boolean")),
            ParamType::Enum { values } => {
                let Some(s) = value.as_str() else {
                    return Some(format!("Parameter {key} must be a string"));
                };
                (!values.iter().any(|v| v == s)).then(|| {
                    format!("Parameter {key} must be one of: {}", values.join(", "))
                })
            }
        }
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Validates `config` against `specs` and fills in defaults.
///
/// Every problem is reported, not only the first. The `pricing` key is
/// ignored here.
pub fn validate_params(specs: &[ParamSpec], config: &Map<String, Value>) -> Result<Map<String, Value>, ProviderError> {
    let mut errors = Vec::new();

    for key in config.keys() {
        if key != PRICING_KEY && !specs.iter().any(|s| s.key == key) {
            errors.push(format!("Unknown parameter: {key}"));
        }
    }

    let mut resolved = Map::new();
    for spec in specs {
        let value = config.get(spec.key);
        if is_blank(value) {
            if spec.required {
                errors.push(format!("Missing required parameter: {}", spec.key));
            } else if let Some(default) = &spec.default {
                resolved.insert(spec.key.to_string(), default.clone());
            }
            continue;
        }
        if let Some(value) = value {
            match spec.check(value) {
                Some(error) => errors.push(error),
                None => {
                    resolved.insert(spec.key.to_string(), value.clone());
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(ProviderError::InvalidConfig(errors))
    }
}
