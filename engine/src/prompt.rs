//! Prompt assembly for extraction and re-extraction.
//!
//! The assembler produces two opaque text blocks. It never calls a model.

use std::fmt::Write;

use serde_json::{Map, Value};

use crate::schema::ExtractionSchema;
use crate::validation::paths::FieldPath;

const EXTRACTION_INSTRUCTION: &str = "Extract structured data from the document. \
Return ONLY valid JSON that matches the JSON Schema. \
Follow the validation rules and extraction hints.";

const REEXTRACTION_INSTRUCTION: &str = "You are correcting a previous extraction. \
Return ONLY valid JSON that matches the JSON Schema. \
Fix the reported problems and keep every other value unchanged.";

const MINIMAL_DIFF_INSTRUCTION: &str = "Return the complete JSON object. \
Change only what is needed to resolve the problems above; do not regenerate values that were not flagged.";

/// Setting keys never shown to the model.
const SECRET_MARKERS: &[&str] = &["key", "secret", "token", "password"];

/// How the OCR text should be weighed by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextRole {
    /// The text is a primary source.
    Primary,
    /// The text is reference material; the page images win on conflict.
    Advisory,
}

/// Feedback from a rejected candidate.
#[derive(Debug, Clone, Copy)]
pub struct RetryFeedback<'a> {
    /// The rejected candidate, if one parsed.
    pub previous: Option<&'a Value>,
    /// Fields the retry should fill or fix.
    pub target_fields: &'a [String],
    /// Error message explaining the rejection.
    pub error: Option<&'a str>,
}

/// Inputs for one attempt's prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptInput<'a> {
    /// Per-page vision transcript; replaces the page images when present.
    pub transcript: Option<&'a str>,
    /// OCR text, or caller-supplied text.
    pub text: Option<&'a str>,
    /// Weight of `text`.
    pub text_role: Option<TextRole>,
    /// Number of page images attached to the request.
    pub image_count: usize,
    /// Present on re-extraction attempts.
    pub retry: Option<RetryFeedback<'a>>,
}

/// System context and user input for one extraction call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    /// Instructions, schema, rules and settings.
    pub system_context: String,
    /// Document text and retry feedback.
    pub user_input: String,
}

/// Builds prompts for a schema.
#[derive(Debug, Clone)]
pub struct PromptAssembler<'a> {
    schema: &'a ExtractionSchema,
    required_fields: &'a [String],
    custom_prompt: Option<&'a str>,
}

impl<'a> PromptAssembler<'a> {
    /// Creates an assembler over the schema and the required fields in force.
    #[must_use]
    pub const fn new(schema: &'a ExtractionSchema, required_fields: &'a [String]) -> Self {
        Self {
            schema,
            required_fields,
            custom_prompt: None,
        }
    }

    /// Appends caller instructions to the system context.
    #[must_use]
    pub const fn with_custom_prompt(mut self, prompt: Option<&'a str>) -> Self {
        self.custom_prompt = prompt;
        self
    }

    /// Builds the prompt for one attempt.
    #[must_use]
    pub fn build(&self, input: &PromptInput<'_>) -> AssembledPrompt {
        AssembledPrompt {
            system_context: self.system_context(input.retry.is_some()),
            user_input: Self::user_input(input),
        }
    }

    fn system_context(&self, is_retry: bool) -> String {
        let mut out = String::new();

        let base = self
            .schema
            .system_prompt_template
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(if is_retry {
                REEXTRACTION_INSTRUCTION
            } else {
                EXTRACTION_INSTRUCTION
            });
        out.push_str(base);

        let schema_text = serde_json::to_string_pretty(&self.schema.json_schema)
            .unwrap_or_else(|_| self.schema.json_schema.to_string());
        let _ = write!(out, "\n\nJSON Schema:\n{schema_text}");

        if self.required_fields.is_empty() {
            out.push_str("\n\nRequired fields: none");
        } else {
            out.push_str("\n\nRequired fields:");
            for field in self.required_fields {
                let _ = write!(out, "\n- {field}");
            }
        }

        let rules = self.schema.ordered_rules();
        if rules.is_empty() {
            out.push_str("\n\nValidation Rules: none");
        } else {
            out.push_str("\n\nValidation Rules:");
            for rule in rules {
                out.push('\n');
                out.push_str(&rule.prompt_line());
            }
        }

        let settings = public_settings(&self.schema.validation_settings);
        if !settings.is_empty() {
            let text = serde_json::to_string_pretty(&Value::Object(settings))
                .unwrap_or_default();
            let _ = write!(out, "\n\nValidation Settings:\n{text}");
        }

        if let Some(markdown) = self.schema.prompt_rules_markdown() {
            let _ = write!(out, "\n\nPrompt Rules (Markdown):\n{markdown}");
        }

        if let Some(custom) = self.custom_prompt.map(str::trim).filter(|c| !c.is_empty()) {
            let _ = write!(out, "\n\nAdditional instructions:\n{custom}");
        }

        out
    }

    fn user_input(input: &PromptInput<'_>) -> String {
        let mut out = String::new();

        if let Some(transcript) = input.transcript.filter(|t| !t.trim().is_empty()) {
            let _ = write!(out, "Page Transcript:\n{transcript}\n\n");
        }

        match (input.text.filter(|t| !t.trim().is_empty()), input.text_role) {
            (Some(text), Some(TextRole::Advisory)) => {
                let _ = write!(
                    out,
                    "OCR Text (reference only; prefer the page images where they disagree):\n{text}"
                );
            }
            (Some(text), _) => {
                let _ = write!(out, "OCR Text:\n{text}");
            }
            (None, _) => {}
        }
        let trimmed_len = out.trim_end().len();
        out.truncate(trimmed_len);

        if input.image_count > 0 {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            let _ = write!(
                out,
                "{} page image(s) of the document are attached.",
                input.image_count
            );
        }

        if let Some(retry) = &input.retry {
            Self::push_retry(&mut out, retry);
        }

        out
    }

    fn push_retry(out: &mut String, retry: &RetryFeedback<'_>) {
        if let Some(previous) = retry.previous {
            let mut trimmed = previous.clone();
            for field in retry.target_fields {
                FieldPath::parse(field).remove(&mut trimmed);
            }
            let text = serde_json::to_string_pretty(&trimmed).unwrap_or_default();
            let _ = write!(out, "\n\nPrevious result:\n{text}");
        }

        if let Some(error) = retry.error.filter(|e| !e.trim().is_empty()) {
            let _ = write!(out, "\n\nError: {error}");
        }
        if !retry.target_fields.is_empty() {
            out.push_str("\n\nMissing fields:");
            for field in retry.target_fields {
                let _ = write!(out, "\n- {field}");
            }
        }

        let _ = write!(out, "\n\n{MINIMAL_DIFF_INSTRUCTION}");
    }
}

fn public_settings(settings: &Map<String, Value>) -> Map<String, Value> {
    settings
        .iter()
        .filter(|(key, _)| key.as_str() != "promptRulesMarkdown")
        .filter(|(key, _)| {
            let lower = key.to_lowercase();
            !SECRET_MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
