//! Common imports for docflow-engine usage.
//!
//! ```
//! use docflow_engine::prelude::*;
//! ```

// Engine entry points
pub use crate::workflow::{
    FieldReextract, WorkflowEngine, WorkflowEngineBuilder, WorkflowOutcome, WorkflowRequest,
};

// Collaborator contracts
pub use crate::collaborators::{
    AcquisitionError, CancellationFlag, CancellationSource, ChatMessage, CompletionOptions,
    ContentPart, Document, ImageDetail, LlmClient, LlmCompletion, LlmError, NoProgress,
    OcrEngine, OcrOutput, PageImage, ProgressSink, Rasterizer, ResultSink, Role, SchemaSource,
    StaticSchemaSource,
};

// Configuration and schemas
pub use crate::config::{ProviderConfig, VisionMode, WorkflowConfig};
pub use crate::cost::{PricingConfig, PricingMode};
pub use crate::schema::ExtractionSchema;
pub use crate::strategy::{ExtractionStrategy, FileType};
pub use crate::validation::rules::{RuleOperator, RuleType, ValidationRule};

// State and errors
pub use crate::error::WorkflowError;
pub use crate::state::{ExtractionValidationResult, TokenUsage, WorkflowState, WorkflowStatus};
