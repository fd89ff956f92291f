//! Per-execution workflow state.

use std::fmt;
use std::ops::{Add, AddAssign};

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::strategy::StrategyResolution;

/// Lifecycle status of one workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Created; schema loading and document pre-check.
    Pending,
    /// Checking a candidate record.
    Validating,
    /// OCR, rasterization and page transcription.
    TextExtracting,
    /// Waiting on the structured extraction call.
    Extracting,
    /// A candidate was rejected and another attempt is being prepared.
    ExtractionRetry,
    /// Handing the result to the sink.
    Saving,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
}

impl WorkflowStatus {
    /// Whether no further transitions can follow.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Any non-terminal status may fail; terminal statuses accept nothing.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Self::Failed)
            | (Self::Pending, Self::TextExtracting)
            | (Self::TextExtracting | Self::ExtractionRetry, Self::Extracting)
            | (Self::Extracting, Self::Validating)
            | (Self::Validating, Self::ExtractionRetry | Self::Saving)
            | (Self::Saving, Self::Completed) => true,
            _ => false,
        }
    }

    /// Upper-case identifier used in logs and serialized output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Validating => "VALIDATING",
            Self::TextExtracting => "TEXT_EXTRACTING",
            Self::Extracting => "EXTRACTING",
            Self::ExtractionRetry => "EXTRACTION_RETRY",
            Self::Saving => "SAVING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counts reported by a model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Input tokens.
    pub prompt_tokens: u64,
    /// Output tokens.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Creates a usage record.
    #[must_use]
    pub const fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Sum of input and output tokens.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens.saturating_add(rhs.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(rhs.completion_tokens),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Output of the text acquisition stage.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextExtractionState {
    /// Plain text.
    pub text: String,
    /// Markdown rendering, or the accumulated page transcript.
    pub markdown: String,
    /// Identifier of the extractor that produced the text.
    pub extractor: String,
    /// Model used by the extractor, if any.
    pub model: Option<String>,
    /// Provider-specific structural result (layout, blocks, tables).
    pub structural_result: Option<Value>,
    /// Pages processed by OCR or transcription.
    pub pages_processed: u32,
    /// Usage reported by the OCR extractor.
    pub usage: TokenUsage,
    /// Page images handed to the model.
    pub page_images: u32,
}

/// Verdict for one candidate record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionValidationResult {
    /// True when there are no errors and no missing fields.
    pub valid: bool,
    /// Required dot-paths absent from the candidate.
    pub missing_fields: Vec<String>,
    /// Schema and rule violations.
    pub errors: Vec<String>,
}

impl ExtractionValidationResult {
    /// Builds a verdict, deriving `valid` from the two lists.
    #[must_use]
    pub fn new(missing_fields: Vec<String>, errors: Vec<String>) -> Self {
        Self {
            valid: missing_fields.is_empty() && errors.is_empty(),
            missing_fields,
            errors,
        }
    }

    /// A verdict for output that could not be parsed at all.
    #[must_use]
    pub fn content_error(message: impl Into<String>) -> Self {
        Self::new(Vec::new(), vec![message.into()])
    }

    /// One-line description used as the current error.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing_fields.is_empty() {
            parts.push(format!("Missing fields: {}", self.missing_fields.join(", ")));
        }
        if !self.errors.is_empty() {
            parts.push(self.errors.join("; "));
        }
        if parts.is_empty() {
            "valid".to_string()
        } else {
            parts.join(". ")
        }
    }
}

/// Candidate captured from the most recent extraction attempt.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionStateResult {
    /// Candidate record (merged into the previous record for field re-extraction).
    pub data: Option<Value>,
    /// True when the candidate validated.
    pub success: bool,
    /// Error for this attempt, if any.
    pub error: Option<String>,
    /// `retryCount` at the time the candidate was captured.
    pub retry_count: u32,
    /// Validation verdict.
    pub validation: Option<ExtractionValidationResult>,
    /// Usage of this attempt's extraction call.
    pub usage: TokenUsage,
    /// Model reported by the provider.
    pub model: Option<String>,
}

/// Ephemeral state owned by a single workflow execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// Document being processed.
    pub manifest_id: String,
    /// Queue job that triggered the execution, if any.
    pub job_id: Option<String>,
    /// Current status.
    pub status: WorkflowStatus,
    /// Every status entered, in order.
    pub status_history: Vec<WorkflowStatus>,
    /// Errors accumulated across attempts.
    pub errors: Vec<String>,
    /// Most recent error.
    pub current_error: Option<String>,
    /// Re-extraction ceiling.
    pub max_retries: u32,
    /// Re-extractions performed so far.
    pub retry_count: u32,
    /// Resolved strategy and whether a fallback occurred.
    pub strategy: Option<StrategyResolution>,
    /// Text acquisition output.
    pub text_result: Option<TextExtractionState>,
    /// Latest extraction attempt.
    pub extraction_result: Option<ExtractionStateResult>,
    /// LLM usage summed over every call of the execution.
    pub llm_usage: TokenUsage,
    /// LLM calls made, including per-page transcription.
    pub llm_calls: u32,
    /// Cost of text acquisition.
    pub text_cost: Decimal,
    /// Cost of all LLM calls.
    pub llm_cost: Decimal,
    /// `text_cost + llm_cost`; `None` when the components disagree on currency.
    pub extraction_cost: Option<Decimal>,
    /// Currency of the cost figures.
    pub currency: Option<String>,
}

impl WorkflowState {
    /// Creates a `Pending` state.
    #[must_use]
    pub fn new(manifest_id: impl Into<String>, max_retries: u32) -> Self {
        Self {
            manifest_id: manifest_id.into(),
            job_id: None,
            status: WorkflowStatus::Pending,
            status_history: vec![WorkflowStatus::Pending],
            errors: Vec::new(),
            current_error: None,
            max_retries,
            retry_count: 0,
            strategy: None,
            text_result: None,
            extraction_result: None,
            llm_usage: TokenUsage::default(),
            llm_calls: 0,
            text_cost: Decimal::ZERO,
            llm_cost: Decimal::ZERO,
            extraction_cost: None,
            currency: None,
        }
    }

    /// Moves to `next`, recording it in the history.
    ///
    /// An edge the lifecycle does not permit is logged and ignored; the
    /// return value says whether the move happened.
    pub fn transition(&mut self, next: WorkflowStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::error!(
                manifest_id = %self.manifest_id,
                from = %self.status,
                to = %next,
                "Illegal workflow transition ignored"
            );
            return false;
        }
        tracing::debug!(
            manifest_id = %self.manifest_id,
            from = %self.status,
            to = %next,
            "Workflow transition"
        );
        self.status = next;
        self.status_history.push(next);
        true
    }

    /// Appends an error and makes it current.
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.current_error = Some(message.clone());
        self.errors.push(message);
    }

    /// Whether another re-extraction is permitted.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Consumes one retry. Returns false, leaving the count unchanged, when
    /// the ceiling has been reached.
    pub fn begin_retry(&mut self) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.retry_count += 1;
        true
    }

    /// Whether the cost total matches its components.
    #[must_use]
    pub fn cost_is_consistent(&self) -> bool {
        self.extraction_cost
            .is_none_or(|total| total == self.text_cost + self.llm_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_follow_lifecycle() {
        let mut state = WorkflowState::new("m-1", 1);
        assert!(!state.transition(WorkflowStatus::Validating));
        assert!(!state.transition(WorkflowStatus::Completed));
        for next in [
            WorkflowStatus::TextExtracting,
            WorkflowStatus::Extracting,
            WorkflowStatus::Validating,
            WorkflowStatus::ExtractionRetry,
            WorkflowStatus::Extracting,
            WorkflowStatus::Validating,
            WorkflowStatus::Saving,
            WorkflowStatus::Completed,
        ] {
            assert!(state.transition(next), "{next}");
        }
        assert!(!state.transition(WorkflowStatus::Failed));
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.status_history.len(), 9);
    }

    #[test]
    fn test_any_active_status_may_fail() {
        for from in [
            WorkflowStatus::Pending,
            WorkflowStatus::TextExtracting,
            WorkflowStatus::Extracting,
            WorkflowStatus::Validating,
            WorkflowStatus::ExtractionRetry,
            WorkflowStatus::Saving,
        ] {
            assert!(from.can_transition_to(WorkflowStatus::Failed), "{from}");
        }
        assert!(!WorkflowStatus::Failed.can_transition_to(WorkflowStatus::Failed));
        assert!(!WorkflowStatus::Saving.can_transition_to(WorkflowStatus::Extracting));
    }

    #[test]
    fn test_retry_count_never_exceeds_max() {
        let mut state = WorkflowState::new("m-1", 2);
        assert!(state.begin_retry());
        assert!(state.begin_retry());
        assert!(!state.begin_retry());
        assert_eq!(state.retry_count, 2);
    }

    #[test]
    fn test_zero_retries() {
        let mut state = WorkflowState::new("m-1", 0);
        assert!(!state.can_retry());
        assert!(!state.begin_retry());
        assert_eq!(state.retry_count, 0);
    }

    #[test]
    fn test_record_error_sets_current() {
        let mut state = WorkflowState::new("m-1", 3);
        state.record_error("first");
        state.record_error("second");
        assert_eq!(state.errors, vec!["first", "second"]);
        assert_eq!(state.current_error.as_deref(), Some("second"));
    }

    #[test]
    fn test_transition_history() {
        let mut state = WorkflowState::new("m-1", 3);
        state.transition(WorkflowStatus::TextExtracting);
        state.transition(WorkflowStatus::Failed);
        assert!(state.status.is_terminal());
        assert_eq!(
            state.status_history,
            vec![
                WorkflowStatus::Pending,
                WorkflowStatus::TextExtracting,
                WorkflowStatus::Failed
            ]
        );
    }

    #[test]
    fn test_usage_accumulates() {
        let mut usage = TokenUsage::new(10, 5);
        usage += TokenUsage::new(1, 2);
        assert_eq!(usage, TokenUsage::new(11, 7));
        assert_eq!(usage.total(), 18);
    }

    #[test]
    fn test_verdict_summary() {
        let verdict = ExtractionValidationResult::new(vec!["total".into()], vec![]);
        assert!(!verdict.valid);
        assert_eq!(verdict.summary(), "Missing fields: total");
        assert!(ExtractionValidationResult::new(vec![], vec![]).valid);
    }
}
