//! # docflow-engine
//!
//! Turns stored documents (PDFs and images) into schema-valid JSON records.
//!
//! A run acquires text and page images according to an
//! [`ExtractionStrategy`](strategy::ExtractionStrategy), asks a language model
//! for a candidate record, validates it against the schema, required fields
//! and custom rules, and feeds the failures back into a bounded number of
//! re-extractions. Costs of the OCR and model calls are computed from their
//! pricing configurations.
//!
//! The engine performs no I/O itself: OCR, rasterization, model calls,
//! schema lookup, progress, cancellation and persistence are collaborator
//! traits in [`collaborators`].
//!
//! ## Example
//!
//! ```no_run
//! # use docflow_engine::prelude::*;
//! # use std::sync::Arc;
//! # async fn example(
//! #     llm: Arc<dyn LlmClient>,
//! #     sink: Arc<dyn ResultSink>,
//! # ) -> Result<(), WorkflowError> {
//! let schema = ExtractionSchema::new("invoice", serde_json::json!({
//!     "type": "object",
//!     "properties": {"total": {"type": "number"}},
//!     "required": ["total"]
//! }));
//! let engine = WorkflowEngine::builder(
//!     llm,
//!     Arc::new(StaticSchemaSource::new().with_schema(schema)),
//!     sink,
//! )
//! .config(WorkflowConfig::default().with_max_retries(2))
//! .build()?;
//!
//! let document = Document::new("invoice.png", std::fs::read("invoice.png").unwrap_or_default());
//! let request = WorkflowRequest::new("manifest-1", "invoice", document)
//!     .with_strategy(ExtractionStrategy::VisionOnly);
//! let outcome = engine.run(request, &NoProgress, &CancellationFlag::new()).await;
//! # Ok(())
//! # }
//! ```

/// Text and image acquisition.
pub mod acquisition;

/// Collaborator traits and the data they exchange.
pub mod collaborators;

/// Workflow and provider configuration.
pub mod config;

/// Pricing and cost accounting.
pub mod cost;

/// Error types.
pub mod error;

/// Model calls for extraction and page transcription.
pub mod extraction;

/// Progress reporting and cancellation polling.
pub mod progress;

/// Prompt assembly.
pub mod prompt;

/// Extraction schemas.
pub mod schema;

/// Workflow state.
pub mod state;

/// Strategy selection.
pub mod strategy;

/// Candidate validation.
pub mod validation;

/// The workflow state machine.
pub mod workflow;

/// Commonly used types and traits.
pub mod prelude;
