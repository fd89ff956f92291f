//! Target schemas: JSON Schema document, required fields, rules and prompt settings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::strategy::ExtractionStrategy;
use crate::validation::rules::ValidationRule;

/// Everything the engine needs to know about one extraction target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionSchema {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// JSON Schema the candidate must satisfy.
    pub json_schema: Value,
    /// Required dot-paths. When empty they are derived from `json_schema`.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Field-level rules.
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
    /// Free-form validation settings shown to the model (secrets filtered).
    #[serde(default)]
    pub validation_settings: Map<String, Value>,
    /// Strategy declared for documents of this schema.
    #[serde(default)]
    pub extraction_strategy: Option<ExtractionStrategy>,
    /// Replaces the built-in system instruction.
    #[serde(default)]
    pub system_prompt_template: Option<String>,
}

impl ExtractionSchema {
    /// Creates a schema with no rules.
    #[must_use]
    pub fn new(id: impl Into<String>, json_schema: Value) -> Self {
        Self {
            id: id.into(),
            json_schema,
            ..Self::default()
        }
    }

    /// Sets the required dot-paths.
    #[must_use]
    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Appends a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Declares the extraction strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: ExtractionStrategy) -> Self {
        self.extraction_strategy = Some(strategy);
        self
    }

    /// Markdown prompt rules carried in the validation settings.
    #[must_use]
    pub fn prompt_rules_markdown(&self) -> Option<&str> {
        self.validation_settings
            .get("promptRulesMarkdown")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Declared required fields, or those derived from the JSON Schema.
    #[must_use]
    pub fn effective_required_fields(&self) -> Vec<String> {
        if self.required_fields.is_empty() {
            crate::validation::paths::derive_required_fields(&self.json_schema)
        } else {
            self.required_fields.clone()
        }
    }

    /// Enabled rules ordered by descending priority, ties by id.
    #[must_use]
    pub fn ordered_rules(&self) -> Vec<&ValidationRule> {
        let mut rules: Vec<&ValidationRule> = self.rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_camel_case() {
        let schema: ExtractionSchema = serde_json::from_value(json!({
            "id": "invoice",
            "jsonSchema": {"type": "object"},
            "requiredFields": ["invoiceNumber"],
            "extractionStrategy": "VISION_FIRST",
            "validationSettings": {"promptRulesMarkdown": "  Dates are DD/MM/YYYY.  "}
        }))
        .unwrap();
        assert_eq!(schema.required_fields, vec!["invoiceNumber"]);
        assert_eq!(schema.extraction_strategy, Some(ExtractionStrategy::VisionFirst));
        assert_eq!(schema.prompt_rules_markdown(), Some("Dates are DD/MM/YYYY."));
    }

    #[test]
    fn test_required_fields_derived_when_empty() {
        let schema = ExtractionSchema::new(
            "s",
            json!({"type": "object", "required": ["total"], "properties": {"total": {"type": "number"}}}),
        );
        assert_eq!(schema.effective_required_fields(), vec!["total"]);
        let schema = schema.with_required_fields(["vendor"]);
        assert_eq!(schema.effective_required_fields(), vec!["vendor"]);
    }
}
