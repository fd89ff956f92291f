//! Error types for workflow execution with attempt history tracking.

use std::time::Duration;
use thiserror::Error;

use crate::collaborators::{AcquisitionError, LlmError};
use crate::state::ExtractionValidationResult;

/// Record of a single extraction attempt that did not validate.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// The attempt number (1-indexed).
    pub attempt_number: u32,
    /// The parsed candidate, or `None` when the model output was not parseable.
    pub candidate: Option<serde_json::Value>,
    /// Verdict produced for this attempt.
    pub verdict: ExtractionValidationResult,
    /// Raw model output text.
    pub raw_output: String,
    /// Elapsed time since the workflow started.
    pub elapsed: Duration,
}

/// Errors that end a workflow execution in `Failed`.
///
/// Cancellation is not represented here; it is a distinct
/// [`WorkflowOutcome`](crate::workflow::WorkflowOutcome) variant.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The document failed the pre-check (unsupported type, empty file).
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// OCR or rasterization failed.
    #[error("Text acquisition failed: {0}")]
    Acquisition(String),

    /// The language model could not be reached or refused the request.
    #[error("LLM transport error: {0}")]
    Transport(String),

    /// The prompt exceeded the model's context window.
    #[error("Context too large: {0}")]
    ContextTooLarge(String),

    /// Model output could not be used as a structured record.
    #[error("Content error: {0}")]
    Content(String),

    /// Every permitted attempt produced an invalid candidate.
    #[error("Extraction failed after {attempts} attempts (max retries: {max_retries})")]
    RetriesExhausted {
        /// Number of extraction attempts made.
        attempts: u32,
        /// Configured retry ceiling.
        max_retries: u32,
        /// Verdict of the last attempt.
        verdict: ExtractionValidationResult,
        /// History of every rejected attempt.
        history: Vec<AttemptRecord>,
    },

    /// The schema could not be loaded or compiled.
    #[error("Schema error: {0}")]
    Schema(String),

    /// The engine is missing a collaborator or was configured inconsistently.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The result sink rejected the terminal state.
    #[error("Persistence failed: {0}")]
    Persistence(String),
}

impl WorkflowError {
    /// Returns the last validation verdict when the failure came from exhausted retries.
    #[must_use]
    pub const fn verdict(&self) -> Option<&ExtractionValidationResult> {
        match self {
            Self::RetriesExhausted { verdict, .. } => Some(verdict),
            _ => None,
        }
    }
}

impl From<AcquisitionError> for WorkflowError {
    fn from(err: AcquisitionError) -> Self {
        match err {
            AcquisitionError::NotConfigured(_) => Self::Config(err.to_string()),
            other => Self::Acquisition(other.to_string()),
        }
    }
}

impl From<LlmError> for WorkflowError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::ContextLengthExceeded(msg) => Self::ContextTooLarge(msg),
            LlmError::Transport(_) | LlmError::RateLimited(_) | LlmError::Provider(_) => {
                Self::Transport(err.to_string())
            }
        }
    }
}
