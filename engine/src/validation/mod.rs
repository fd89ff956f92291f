//! Candidate validation against a JSON Schema, required paths and rules.

pub mod paths;
pub mod rules;

use serde_json::Value;

use crate::error::WorkflowError;
use crate::schema::ExtractionSchema;
use crate::state::ExtractionValidationResult;

use paths::FieldPath;
use rules::CompiledRule;

/// Validates candidate records for one schema.
///
/// The three checks are independent: every schema error, missing field
/// and rule violation is reported, none short-circuits the others.
pub struct ValidationEngine {
    validator: jsonschema::Validator,
    required: Vec<(String, FieldPath)>,
    /// Compiled once; a rule with a bad configuration keeps its error.
    rules: Vec<Result<CompiledRule, String>>,
}

impl std::fmt::Debug for ValidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationEngine")
            .field("required", &self.required)
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

impl ValidationEngine {
    /// Compiles the schema's JSON Schema and resolves its required fields.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::Schema` if the JSON Schema does not compile.
    pub fn new(schema: &ExtractionSchema) -> Result<Self, WorkflowError> {
        let validator = jsonschema::Validator::new(&schema.json_schema)
            .map_err(|e| WorkflowError::Schema(e.to_string()))?;
        Ok(Self {
            validator,
            required: Self::parse_paths(schema.effective_required_fields()),
            rules: schema
                .ordered_rules()
                .into_iter()
                .map(rules::ValidationRule::compile)
                .collect(),
        })
    }

    /// Replaces the required-field list.
    #[must_use]
    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required = Self::parse_paths(fields);
        self
    }

    fn parse_paths(fields: Vec<String>) -> Vec<(String, FieldPath)> {
        fields
            .into_iter()
            .map(|raw| {
                let path = FieldPath::parse(&raw);
                (raw.trim().trim_end_matches('?').to_string(), path)
            })
            .collect()
    }

    /// Required dot-paths, without nullable markers.
    #[must_use]
    pub fn required_fields(&self) -> Vec<String> {
        self.required.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Produces a verdict for `candidate`.
    #[must_use]
    pub fn validate(&self, candidate: &Value) -> ExtractionValidationResult {
        let mut errors = schema_errors(&self.validator, candidate);

        let missing_fields = self
            .required
            .iter()
            .filter(|(_, path)| path.is_missing(candidate))
            .map(|(name, _)| name.clone())
            .collect();

        for rule in &self.rules {
            match rule {
                Ok(compiled) => errors.extend(compiled.evaluate(candidate)),
                Err(e) => errors.push(e.clone()),
            }
        }

        ExtractionValidationResult::new(missing_fields, errors)
    }
}

/// Collects every JSON Schema violation as `"<path|root>: <message>"`.
///
/// # Examples
///
/// ```
/// use docflow_engine::validation::collect_schema_errors;
/// use serde_json::json;
///
/// let schema = json!({"type": "object", "properties": {"total": {"type": "number"}}});
/// let errors = collect_schema_errors(&schema, &json!({"total": "ten"}));
/// assert_eq!(errors.len(), 1);
/// assert!(errors[0].starts_with("/total: "));
/// ```
#[must_use]
pub fn collect_schema_errors(schema: &Value, instance: &Value) -> Vec<String> {
    match jsonschema::Validator::new(schema) {
        Ok(validator) => schema_errors(&validator, instance),
        Err(e) => vec![format!("Schema compilation error: {e}")],
    }
}

fn schema_errors(validator: &jsonschema::Validator, instance: &Value) -> Vec<String> {
    validator
        .iter_errors(instance)
        .map(|error| {
            let path = error.instance_path.to_string();
            let path = if path.is_empty() { "root".to_string() } else { path };
            format!("{path}: {error}")
        })
        .collect()
}
