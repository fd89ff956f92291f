//! Field-level validation rules.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::paths::FieldPath;

/// Whether a rule checks extracted values or restricts what may be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Checks an extracted value.
    #[default]
    Verification,
    /// Constrains what the model may return.
    Restriction,
}

/// Check performed by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    /// `{regex}`: string form of the value must match.
    Pattern,
    /// `{values}`: value must be one of the listed values.
    Enum,
    /// `{value}`: numeric value must be at least `value`.
    RangeMin,
    /// `{value}`: numeric value must be at most `value`.
    RangeMax,
    /// `{value}`: string or array length must be at least `value`.
    LengthMin,
    /// `{value}`: string or array length must be at most `value`.
    LengthMax,
    /// `{mappings: [{from, to}]}`: value must not contain any `from` sequence.
    OcrCorrection,
}

impl RuleOperator {
    /// Snake-case name used in prompts and messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Enum => "enum",
            Self::RangeMin => "range_min",
            Self::RangeMax => "range_max",
            Self::LengthMin => "length_min",
            Self::LengthMax => "length_max",
            Self::OcrCorrection => "ocr_correction",
        }
    }
}

/// A common OCR misread and its correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrMapping {
    /// Misread sequence.
    pub from: String,
    /// Correct sequence.
    pub to: String,
}

#[derive(Deserialize)]
struct PatternConfig {
    regex: String,
}

#[derive(Deserialize)]
struct EnumConfig {
    values: Vec<Value>,
}

#[derive(Deserialize)]
struct BoundConfig {
    value: f64,
}

#[derive(Deserialize)]
struct MappingConfig {
    mappings: Vec<OcrMapping>,
}

const fn default_enabled() -> bool {
    true
}

/// A rule declared on a schema field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    /// Stable identifier; breaks priority ties.
    pub id: String,
    /// Dot-path of the checked field.
    pub field_path: String,
    /// Rule category.
    #[serde(default)]
    pub rule_type: RuleType,
    /// Check to perform.
    pub rule_operator: RuleOperator,
    /// Operator-specific configuration.
    #[serde(default)]
    pub rule_config: Value,
    /// Replaces the generated violation message.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Higher runs and is prompted first.
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules are neither prompted nor evaluated.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
}

impl ValidationRule {
    /// Creates an enabled verification rule.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        field_path: impl Into<String>,
        operator: RuleOperator,
        config: Value,
    ) -> Self {
        Self {
            id: id.into(),
            field_path: field_path.into(),
            rule_type: RuleType::Verification,
            rule_operator: operator,
            rule_config: config,
            error_message: None,
            priority: 0,
            enabled: true,
            description: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the custom violation message.
    #[must_use]
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Compiles the operator configuration.
    pub fn compile(&self) -> Result<CompiledRule, String> {
        let config = self.rule_config.clone();
        let invalid = |e: serde_json::Error| {
            format!(
                "Rule {} has invalid {} config: {e}",
                self.id,
                self.rule_operator.as_str()
            )
        };
        let check = match self.rule_operator {
            RuleOperator::Pattern => {
                let cfg: PatternConfig = serde_json::from_value(config).map_err(invalid)?;
                let regex = Regex::new(&cfg.regex)
                    .map_err(|e| format!("Rule {} has invalid pattern: {e}", self.id))?;
                Check::Pattern(regex)
            }
            RuleOperator::Enum => {
                let cfg: EnumConfig = serde_json::from_value(config).map_err(invalid)?;
                Check::Enum(cfg.values)
            }
            RuleOperator::RangeMin | RuleOperator::RangeMax => {
                let cfg: BoundConfig = serde_json::from_value(config).map_err(invalid)?;
                Check::Range {
                    bound: cfg.value,
                    min: self.rule_operator == RuleOperator::RangeMin,
                }
            }
            RuleOperator::LengthMin | RuleOperator::LengthMax => {
                let cfg: BoundConfig = serde_json::from_value(config).map_err(invalid)?;
                Check::Length {
                    bound: cfg.value,
                    min: self.rule_operator == RuleOperator::LengthMin,
                }
            }
            RuleOperator::OcrCorrection => {
                let cfg: MappingConfig = serde_json::from_value(config).map_err(invalid)?;
                Check::OcrCorrection(cfg.mappings)
            }
        };
        Ok(CompiledRule {
            rule: self.clone(),
            path: FieldPath::parse(&self.field_path),
            check,
        })
    }

    /// One-line description used in prompts.
    #[must_use]
    pub fn prompt_line(&self) -> String {
        let rule_type = match self.rule_type {
            RuleType::Verification => "verification",
            RuleType::Restriction => "restriction",
        };
        let mut line = format!(
            "- [{}] {rule_type}/{} {}: {}",
            self.priority,
            self.rule_operator.as_str(),
            self.field_path,
            self.rule_config
        );
        if let Some(msg) = &self.error_message {
            line.push_str(" | ");
            line.push_str(msg);
        }
        line
    }
}

#[derive(Debug)]
enum Check {
    Pattern(Regex),
    Enum(Vec<Value>),
    Range { bound: f64, min: bool },
    Length { bound: f64, min: bool },
    OcrCorrection(Vec<OcrMapping>),
}

/// A rule with its configuration parsed and its path resolved.
#[derive(Debug)]
pub struct CompiledRule {
    rule: ValidationRule,
    path: FieldPath,
    check: Check,
}

impl CompiledRule {
    /// Evaluates the rule against every value its path reaches.
    ///
    /// Absent and `null` values are skipped; presence is the required-field
    /// check's concern.
    #[must_use]
    pub fn evaluate(&self, record: &Value) -> Vec<String> {
        self.path
            .resolve(record)
            .into_iter()
            .filter(|v| !v.is_null())
            .filter_map(|v| self.violation(v))
            .map(|detail| {
                let message = self.rule.error_message.clone().unwrap_or(detail);
                format!("{}: {message}", self.rule.field_path)
            })
            .collect()
    }

    fn violation(&self, value: &Value) -> Option<String> {
        match &self.check {
            Check::Pattern(regex) => {
                let text = as_text(value);
                (!regex.is_match(&text))
                    .then(|| format!("value '{text}' does not match pattern {}", regex.as_str()))
            }
            Check::Enum(values) => {
                let allowed = values.iter().any(|allowed| {
                    allowed == value || as_text(allowed) == as_text(value)
                });
                (!allowed).then(|| {
                    let list: Vec<String> = values.iter().map(as_text).collect();
                    format!("value '{}' must be one of: {}", as_text(value), list.join(", "))
                })
            }
            Check::Range { bound, min } => match as_number(value) {
                None => Some(format!("value '{}' is not a number", as_text(value))),
                Some(n) if *min && n < *bound => Some(format!("value {n} is below minimum {bound}")),
                Some(n) if !*min && n > *bound => Some(format!("value {n} exceeds maximum {bound}")),
                Some(_) => None,
            },
            Check::Length { bound, min } => {
                #[allow(clippy::cast_precision_loss)]
                let len = match value {
                    Value::Array(items) => items.len(),
                    other => as_text(other).chars().count(),
                } as f64;
                if *min && len < *bound {
                    Some(format!("length {len} is below minimum {bound}"))
                } else if !*min && len > *bound {
                    Some(format!("length {len} exceeds maximum {bound}"))
                } else {
                    None
                }
            }
            Check::OcrCorrection(mappings) => {
                let text = value.as_str()?;
                let hits: Vec<&OcrMapping> = mappings
                    .iter()
                    .filter(|m| !m.from.is_empty() && text.contains(&m.from))
                    .collect();
                if hits.is_empty() {
                    return None;
                }
                let corrected = hits
                    .iter()
                    .fold(text.to_string(), |acc, m| acc.replace(&m.from, &m.to));
                Some(format!(
                    "value '{text}' contains likely OCR misreads; expected '{corrected}'"
                ))
            }
        }
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}
