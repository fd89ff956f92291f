//! Contracts for the services the engine drives.
//!
//! The engine performs no I/O of its own. OCR, rasterization, model calls,
//! schema lookup, progress delivery, cancellation and persistence all go
//! through the traits in this module.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::cost::PricingConfig;
use crate::error::WorkflowError;
use crate::schema::ExtractionSchema;
use crate::state::{TokenUsage, WorkflowState};
use crate::strategy::FileType;

/// Message fragments that identify a context-window overflow.
const CONTEXT_LENGTH_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "too many tokens",
    "context length",
    "prompt is too long",
];

/// Failure of an OCR or rasterization collaborator.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// OCR provider failed.
    #[error("OCR failed: {0}")]
    Ocr(String),
    /// The document could not be paginated into images.
    #[error("Rasterization failed: {0}")]
    Rasterize(String),
    /// The engine has no collaborator for a required path.
    #[error("No {0} collaborator configured")]
    NotConfigured(&'static str),
}

/// Failure of the language model collaborator.
///
/// All variants are transport-level: the request never produced usable
/// output. Malformed output is a content problem handled by the retry loop.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network or connection failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Provider throttled the request.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The prompt did not fit in the model's context window.
    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),
    /// Any other provider-side error.
    #[error("provider error: {0}")]
    Provider(String),
}

impl LlmError {
    /// Classifies a provider error message.
    #[must_use]
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if CONTEXT_LENGTH_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::ContextLengthExceeded(message)
        } else if lower.contains("rate limit") || lower.contains("429") {
            Self::RateLimited(message)
        } else if lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("network")
        {
            Self::Transport(message)
        } else {
            Self::Provider(message)
        }
    }
}

/// A stored document handed to the engine.
#[derive(Debug, Clone)]
pub struct Document {
    /// Original file name; its extension determines the file type.
    pub file_name: String,
    /// Raw file contents.
    pub bytes: Arc<[u8]>,
}

impl Document {
    /// Creates a document from a file name and its contents.
    #[must_use]
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    /// Lower-case extension without the dot.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
    }

    /// File type derived from the extension.
    #[must_use]
    pub fn file_type(&self) -> Option<FileType> {
        self.extension().as_deref().and_then(FileType::from_extension)
    }

    /// MIME type derived from the extension.
    #[must_use]
    pub fn mime_type(&self) -> &'static str {
        match self.extension().as_deref() {
            Some("pdf") => "application/pdf",
            Some("png") => "image/png",
            Some("jpg" | "jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            Some("bmp") => "image/bmp",
            _ => "application/octet-stream",
        }
    }

    /// Checks that the document can be processed at all.
    pub fn precheck(&self) -> Result<FileType, WorkflowError> {
        let file_type = self.file_type().ok_or_else(|| {
            WorkflowError::InvalidDocument(format!(
                "Unsupported file type: {}",
                self.file_name
            ))
        })?;
        if self.bytes.is_empty() {
            return Err(WorkflowError::InvalidDocument(format!(
                "Document is empty: {}",
                self.file_name
            )));
        }
        Ok(file_type)
    }
}

/// One rasterized page, or the document itself when it is an image.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-based page number.
    pub page_number: u32,
    /// Encoded image bytes.
    pub bytes: Arc<[u8]>,
    /// MIME type of `bytes`.
    pub mime_type: String,
}

/// Result of an OCR call.
#[derive(Debug, Clone, Default)]
pub struct OcrOutput {
    /// Plain text.
    pub text: String,
    /// Markdown rendering (may equal `text`).
    pub markdown: String,
    /// Provider-specific structure.
    pub structural_result: Option<Value>,
    /// Pages processed, for page-priced extractors.
    pub pages_processed: u32,
    /// Token usage, for model-backed extractors.
    pub usage: Option<TokenUsage>,
    /// Model used, if any.
    pub model: Option<String>,
}

/// Produces text from a document.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Stable identifier of this extractor.
    fn id(&self) -> &str;

    /// How this extractor's usage is priced.
    fn pricing(&self) -> Option<&PricingConfig> {
        None
    }

    /// Extracts text from the whole document.
    async fn process(&self, document: &Document) -> Result<OcrOutput, AcquisitionError>;
}

/// Splits a document into page images.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Renders every page, in page order.
    async fn rasterize(&self, document: &Document) -> Result<Vec<PageImage>, AcquisitionError>;
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Instructions for the model.
    System,
    /// Input from the caller.
    User,
}

/// Image fidelity hint for vision models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageDetail {
    /// Let the provider decide.
    #[default]
    Auto,
    /// Low resolution.
    Low,
    /// Full resolution.
    High,
}

/// A piece of message content.
#[derive(Debug, Clone)]
pub enum ContentPart {
    /// Text content.
    Text(String),
    /// An image with a fidelity hint.
    Image {
        /// The page to send.
        image: PageImage,
        /// Fidelity hint.
        detail: ImageDetail,
    },
}

/// A message sent to the model.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Sender role.
    pub role: Role,
    /// Ordered content parts.
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    /// A text-only system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    /// A text-only user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    /// Appends images to this message.
    #[must_use]
    pub fn with_images<'a>(mut self, images: impl IntoIterator<Item = &'a PageImage>) -> Self {
        self.content.extend(images.into_iter().map(|image| ContentPart::Image {
            image: image.clone(),
            detail: ImageDetail::High,
        }));
        self
    }

    /// Whether any part is an image.
    #[must_use]
    pub fn has_images(&self) -> bool {
        self.content
            .iter()
            .any(|p| matches!(p, ContentPart::Image { .. }))
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// JSON Schema for constrained output, when the provider supports it.
    pub response_schema: Option<Value>,
}

/// A model response.
#[derive(Debug, Clone, Default)]
pub struct LlmCompletion {
    /// Raw text content.
    pub content: String,
    /// Usage, when the provider reports it.
    pub usage: Option<TokenUsage>,
    /// Model that served the request.
    pub model: Option<String>,
}

/// Sends chat messages to a language model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Runs one completion.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        provider: &ProviderConfig,
    ) -> Result<LlmCompletion, LlmError>;
}

/// Read-only access to schemas and their rules.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Loads the schema with the given identifier.
    async fn load(&self, schema_id: &str) -> Result<ExtractionSchema, WorkflowError>;
}

/// Schemas held in memory, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaSource {
    schemas: HashMap<String, ExtractionSchema>,
}

impl StaticSchemaSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a schema under its own id.
    #[must_use]
    pub fn with_schema(mut self, schema: ExtractionSchema) -> Self {
        self.schemas.insert(schema.id.clone(), schema);
        self
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn load(&self, schema_id: &str) -> Result<ExtractionSchema, WorkflowError> {
        self.schemas
            .get(schema_id)
            .cloned()
            .ok_or_else(|| WorkflowError::Schema(format!("Schema not found: {schema_id}")))
    }
}

/// Receives progress percentages.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Reports progress in `0..=100`.
    async fn report(&self, percent: u8);
}

/// A progress sink that drops every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _percent: u8) {}
}

/// Answers whether the caller wants the execution stopped.
#[async_trait]
pub trait CancellationSource: Send + Sync {
    /// Polled at stage boundaries.
    async fn is_cancellation_requested(&self) -> bool;
}

/// Shared flag that cancels an execution once set.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CancellationSource for CancellationFlag {
    async fn is_cancellation_requested(&self) -> bool {
        self.is_set()
    }
}

/// Receives the terminal state for persistence.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Stores a `Completed` or `Failed` state.
    async fn commit(
        &self,
        state: &WorkflowState,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_context_length() {
        let err = LlmError::classify("This model's maximum context length is 128000 tokens");
        assert!(matches!(err, LlmError::ContextLengthExceeded(_)));
        let err = LlmError::classify("error: context_length_exceeded");
        assert!(matches!(err, LlmError::ContextLengthExceeded(_)));
    }

    #[test]
    fn test_classify_rate_limit_and_transport() {
        assert!(matches!(
            LlmError::classify("HTTP 429 Too Many Requests"),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            LlmError::classify("connection reset by peer"),
            LlmError::Transport(_)
        ));
        assert!(matches!(
            LlmError::classify("invalid api key"),
            LlmError::Provider(_)
        ));
    }

    #[test]
    fn test_document_precheck() {
        let doc = Document::new("Invoice.PDF", vec![1_u8, 2, 3]);
        assert_eq!(doc.precheck().unwrap(), FileType::Pdf);
        assert_eq!(doc.mime_type(), "application/pdf");

        let doc = Document::new("scan.jpeg", vec![1_u8]);
        assert_eq!(doc.precheck().unwrap(), FileType::Image);
        assert_eq!(doc.mime_type(), "image/jpeg");
    }

    #[test]
    fn test_document_precheck_rejects() {
        let doc = Document::new("notes.txt", vec![1_u8]);
        assert!(matches!(doc.precheck(), Err(WorkflowError::InvalidDocument(_))));
        let doc = Document::new("empty.png", Vec::<u8>::new());
        assert!(matches!(doc.precheck(), Err(WorkflowError::InvalidDocument(_))));
    }

    #[tokio::test]
    async fn test_cancellation_flag() {
        let flag = CancellationFlag::new();
        let shared = flag.clone();
        assert!(!flag.is_cancellation_requested().await);
        shared.cancel();
        assert!(flag.is_cancellation_requested().await);
    }
}
