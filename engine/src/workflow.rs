//! The extraction workflow state machine.
//!
//! ```text
//! Pending -> TextExtracting -> Extracting -> Validating
//! Validating --valid--> Saving -> Completed
//! Validating --invalid, retries left--> ExtractionRetry -> Extracting
//! Validating --invalid, no retries left--> Failed
//! any stage --unrecoverable error--> Failed
//! ```
//!
//! Cancellation is polled before text acquisition, before every model
//! call and before validation. A canceled run commits nothing.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::acquisition::TextAcquisitionStage;
use crate::collaborators::{
    CancellationSource, Document, LlmClient, OcrEngine, PageImage, ProgressSink, Rasterizer,
    ResultSink, SchemaSource,
};
use crate::config::{ProviderConfig, VisionMode, WorkflowConfig};
use crate::cost::{CostAccountant, CostComponent, UsageMetrics};
use crate::error::{AttemptRecord, WorkflowError};
use crate::extraction::{PageTranscript, StructuredExtractionStage, TranscriptOutcome};
use crate::progress::{checkpoints, interpolate, ExecutionContext, StageLog};
use crate::prompt::{PromptAssembler, PromptInput, RetryFeedback, TextRole};
use crate::state::{
    ExtractionStateResult, ExtractionValidationResult, TextExtractionState, WorkflowState,
    WorkflowStatus,
};
use crate::strategy::{resolve_strategy, ExtractionStrategy, FileType};
use crate::validation::paths::FieldPath;
use crate::validation::ValidationEngine;

/// Key carried alongside re-extracted fields.
const EXTRACTION_INFO_KEY: &str = "_extraction_info";
/// Extractor id recorded when the caller supplied the text.
const TEXT_OVERRIDE_EXTRACTOR: &str = "text-override";
/// Extractor id recorded for a per-page vision transcript.
const TRANSCRIPT_EXTRACTOR: &str = "vision-transcript";

/// Re-extraction of a single field of an existing record.
#[derive(Debug, Clone)]
pub struct FieldReextract {
    /// Dot-path of the field; a trailing `?` is ignored.
    pub field_path: String,
    /// The record to correct.
    pub previous_data: Value,
}

/// One workflow execution request.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    /// Document identifier.
    pub manifest_id: String,
    /// Queue job, for log correlation.
    pub job_id: Option<String>,
    /// Schema to extract against.
    pub schema_id: String,
    /// The document.
    pub document: Document,
    /// Overrides the schema's declared strategy.
    pub strategy_override: Option<ExtractionStrategy>,
    /// Extra instructions appended to the system context.
    pub custom_prompt: Option<String>,
    /// Text used instead of OCR output.
    pub text_context_override: Option<String>,
    /// Restricts the run to one field of an existing record.
    pub field_reextract: Option<FieldReextract>,
}

impl WorkflowRequest {
    /// Creates a request with no overrides.
    #[must_use]
    pub fn new(
        manifest_id: impl Into<String>,
        schema_id: impl Into<String>,
        document: Document,
    ) -> Self {
        Self {
            manifest_id: manifest_id.into(),
            job_id: None,
            schema_id: schema_id.into(),
            document,
            strategy_override: None,
            custom_prompt: None,
            text_context_override: None,
            field_reextract: None,
        }
    }

    /// Sets the job id.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Overrides the strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: ExtractionStrategy) -> Self {
        self.strategy_override = Some(strategy);
        self
    }

    /// Adds caller instructions.
    #[must_use]
    pub fn with_custom_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }

    /// Supplies the text instead of running OCR.
    #[must_use]
    pub fn with_text_context(mut self, text: impl Into<String>) -> Self {
        self.text_context_override = Some(text.into());
        self
    }

    /// Re-extracts one field of `previous_data`.
    #[must_use]
    pub fn with_field_reextract(mut self, field_path: impl Into<String>, previous_data: Value) -> Self {
        self.field_reextract = Some(FieldReextract {
            field_path: field_path.into(),
            previous_data,
        });
        self
    }
}

/// How an execution ended.
#[derive(Debug)]
pub enum WorkflowOutcome {
    /// The record validated and was committed.
    Completed(Box<WorkflowState>),
    /// The run failed; the state was handed to the sink when possible.
    Failed {
        /// Terminal state.
        state: Box<WorkflowState>,
        /// Cause.
        error: WorkflowError,
    },
    /// The caller canceled; nothing was committed.
    Canceled {
        /// Document identifier.
        manifest_id: String,
        /// Status when cancellation was observed.
        last_status: WorkflowStatus,
        /// Last progress reported.
        last_progress: Option<u8>,
    },
}

impl WorkflowOutcome {
    /// Terminal state, unless canceled.
    #[must_use]
    pub fn state(&self) -> Option<&WorkflowState> {
        match self {
            Self::Completed(state) | Self::Failed { state, .. } => Some(state),
            Self::Canceled { .. } => None,
        }
    }

    /// Whether the run completed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Whether the run was canceled.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

enum Flow {
    Extracted,
    Canceled,
}

/// Builder for [`WorkflowEngine`].
pub struct WorkflowEngineBuilder {
    config: WorkflowConfig,
    provider: ProviderConfig,
    llm: Arc<dyn LlmClient>,
    schemas: Arc<dyn SchemaSource>,
    sink: Arc<dyn ResultSink>,
    ocr: Option<Arc<dyn OcrEngine>>,
    rasterizer: Option<Arc<dyn Rasterizer>>,
}

impl WorkflowEngineBuilder {
    /// Sets the retry configuration.
    #[must_use]
    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the model configuration.
    #[must_use]
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = provider;
        self
    }

    /// Sets the OCR collaborator.
    #[must_use]
    pub fn ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    /// Sets the rasterizer collaborator.
    #[must_use]
    pub fn rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    /// Validates pricing and builds the engine.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::Config` if either pricing configuration is invalid.
    pub fn build(self) -> Result<WorkflowEngine, WorkflowError> {
        if let Some(pricing) = &self.provider.pricing {
            pricing
                .validate()
                .map_err(|e| WorkflowError::Config(format!("LLM pricing: {e}")))?;
        }
        if let Some(pricing) = self.ocr.as_ref().and_then(|o| o.pricing()) {
            pricing
                .validate()
                .map_err(|e| WorkflowError::Config(format!("OCR pricing: {e}")))?;
        }
        Ok(WorkflowEngine {
            config: self.config,
            provider: self.provider,
            llm: self.llm,
            schemas: self.schemas,
            sink: self.sink,
            ocr: self.ocr,
            rasterizer: self.rasterizer,
        })
    }
}

/// Drives extraction workflows over a fixed set of collaborators.
///
/// The engine holds no per-execution state; each [`run`](Self::run) owns
/// its own [`WorkflowState`].
pub struct WorkflowEngine {
    config: WorkflowConfig,
    provider: ProviderConfig,
    llm: Arc<dyn LlmClient>,
    schemas: Arc<dyn SchemaSource>,
    sink: Arc<dyn ResultSink>,
    ocr: Option<Arc<dyn OcrEngine>>,
    rasterizer: Option<Arc<dyn Rasterizer>>,
}

impl WorkflowEngine {
    /// Starts building an engine around the required collaborators.
    #[must_use]
    pub fn builder(
        llm: Arc<dyn LlmClient>,
        schemas: Arc<dyn SchemaSource>,
        sink: Arc<dyn ResultSink>,
    ) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            config: WorkflowConfig::default(),
            provider: ProviderConfig::default(),
            llm,
            schemas,
            sink,
            ocr: None,
            rasterizer: None,
        }
    }

    /// Retry configuration in force.
    #[must_use]
    pub const fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Runs one workflow to a terminal outcome.
    pub async fn run(
        &self,
        request: WorkflowRequest,
        progress: &dyn ProgressSink,
        cancellation: &dyn CancellationSource,
    ) -> WorkflowOutcome {
        let mut state = WorkflowState::new(request.manifest_id.clone(), self.config.max_retries);
        state.job_id.clone_from(&request.job_id);
        let mut ctx = ExecutionContext::new(
            &request.manifest_id,
            request.job_id.as_deref(),
            progress,
            cancellation,
        );

        match self.execute(&request, &mut state, &mut ctx).await {
            Ok(Flow::Extracted) => self.save(state, &mut ctx).await,
            Ok(Flow::Canceled) => {
                tracing::info!(
                    manifest_id = %state.manifest_id,
                    status = %state.status,
                    "Workflow canceled; nothing committed"
                );
                WorkflowOutcome::Canceled {
                    manifest_id: state.manifest_id,
                    last_status: state.status,
                    last_progress: ctx.last_reported(),
                }
            }
            Err(error) => self.fail(state, error, &ctx, true).await,
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn execute(
        &self,
        request: &WorkflowRequest,
        state: &mut WorkflowState,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Flow, WorkflowError> {
        ctx.report(checkpoints::STARTED).await;

        // Pending: schema, document pre-check, strategy.
        let span = StageLog::start("precheck", ctx);
        let schema = self.schemas.load(&request.schema_id).await?;
        let file_type = request.document.precheck()?;
        let mut validator = ValidationEngine::new(&schema)?;

        let reextract = request.field_reextract.as_ref().map(|f| {
            let field = f.field_path.trim().trim_end_matches('?').to_string();
            (field, &f.previous_data)
        });
        if let Some((field, _)) = &reextract {
            validator = validator.with_required_fields(vec![field.clone()]);
        }

        let requested = request.strategy_override.or(schema.extraction_strategy);
        let resolution = resolve_strategy(requested, file_type, self.provider.capabilities());
        if resolution.fallback {
            tracing::warn!(
                manifest_id = %state.manifest_id,
                requested = ?resolution.requested,
                resolved = %resolution.strategy,
                "Provider lacks vision support; falling back to OCR"
            );
        }
        state.strategy = Some(resolution);
        let strategy = resolution.strategy;
        span.end(state.retry_count, 0);
        ctx.report(checkpoints::PRECHECKED).await;

        // TextExtracting
        if ctx.is_canceled().await {
            return Ok(Flow::Canceled);
        }
        state.transition(WorkflowStatus::TextExtracting);
        ctx.report(checkpoints::ACQUISITION_STARTED).await;
        let span = StageLog::start("text_extraction", ctx);

        let override_text = request
            .text_context_override
            .as_deref()
            .filter(|t| !t.trim().is_empty());
        let acquisition = TextAcquisitionStage::new(self.ocr.as_deref(), self.rasterizer.as_deref());
        let acquired = acquisition
            .acquire(&request.document, file_type, strategy, override_text.is_some())
            .await?;
        if let Some(warning) = &acquired.ocr_warning {
            state.record_error(format!("Advisory OCR failed: {warning}"));
        }

        let mut text_state = TextExtractionState {
            page_images: u32::try_from(acquired.pages.len()).unwrap_or(u32::MAX),
            ..TextExtractionState::default()
        };
        if let Some(text) = override_text {
            text_state.text = text.to_string();
            text_state.markdown = text.to_string();
            text_state.extractor = TEXT_OVERRIDE_EXTRACTOR.to_string();
        } else if let Some(ocr) = &acquired.ocr {
            text_state.text.clone_from(&ocr.text);
            text_state.markdown = if ocr.markdown.trim().is_empty() {
                ocr.text.clone()
            } else {
                ocr.markdown.clone()
            };
            text_state.extractor = self
                .ocr
                .as_ref()
                .map(|o| o.id().to_string())
                .unwrap_or_default();
            text_state.model.clone_from(&ocr.model);
            text_state.structural_result.clone_from(&ocr.structural_result);
            text_state.pages_processed = ocr.pages_processed;
            text_state.usage = ocr.usage.unwrap_or_default();
        }

        let extraction =
            StructuredExtractionStage::new(self.llm.as_ref(), &self.provider, &self.config.page_separator);

        let per_page = self.config.vision_mode == VisionMode::PerPage
            && file_type == FileType::Pdf
            && acquired.pages.len() > 1;
        let mut transcript: Option<PageTranscript> = None;
        if per_page {
            let outcome = extraction.transcribe_pages(&acquired.pages, ctx).await;
            state.llm_calls += outcome.calls();
            match outcome {
                TranscriptOutcome::Completed(t) => {
                    state.llm_usage += t.usage;
                    if text_state.extractor.is_empty() {
                        text_state.extractor = TRANSCRIPT_EXTRACTOR.to_string();
                        text_state.text.clone_from(&t.markdown);
                    }
                    text_state.markdown.clone_from(&t.markdown);
                    transcript = Some(t);
                }
                TranscriptOutcome::Canceled(t) => {
                    state.llm_usage += t.usage;
                    return Ok(Flow::Canceled);
                }
                TranscriptOutcome::Failed { partial, error } => {
                    state.llm_usage += partial.usage;
                    return Err(error.into());
                }
            }
        }

        state.text_result = Some(text_state);
        span.end(state.retry_count, 0);
        ctx.report(checkpoints::ACQUIRED).await;

        // Extracting / Validating / ExtractionRetry
        let required = validator.required_fields();
        let assembler = PromptAssembler::new(&schema, &required)
            .with_custom_prompt(request.custom_prompt.as_deref());
        let response_schema = (self.config.use_structured_output
            && self.provider.supports_structured_output)
            .then_some(&schema.json_schema);
        let images: &[PageImage] = if transcript.is_some() {
            &[]
        } else {
            &acquired.pages
        };
        let ocr_text = if override_text.is_some() {
            override_text
        } else {
            acquired.ocr.as_ref().map(|o| o.text.as_str())
        };
        let text_role = match strategy {
            ExtractionStrategy::VisionFirst if override_text.is_none() => TextRole::Advisory,
            _ => TextRole::Primary,
        };

        let started = Instant::now();
        let total_attempts = usize::try_from(self.config.max_retries)
            .unwrap_or(usize::MAX)
            .saturating_add(1);
        let mut attempts: u32 = 0;
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut last_candidate: Option<Value> = None;
        let mut feedback: Option<(Vec<String>, Option<String>)> = None;

        if let Some((field, previous)) = &reextract {
            state.retry_count = state.max_retries.min(1);
            last_candidate = Some((*previous).clone());
            let verdict = ExtractionValidationResult::new(vec![field.clone()], Vec::new());
            state.extraction_result = Some(ExtractionStateResult {
                data: Some((*previous).clone()),
                success: false,
                error: Some(verdict.summary()),
                retry_count: state.retry_count,
                validation: Some(verdict),
                ..ExtractionStateResult::default()
            });
            feedback = Some((vec![field.clone()], None));
        }

        loop {
            if ctx.is_canceled().await {
                return Ok(Flow::Canceled);
            }
            state.transition(WorkflowStatus::Extracting);
            let span = StageLog::start("extraction", ctx);

            let retry = feedback.as_ref().map(|(targets, error)| RetryFeedback {
                previous: last_candidate.as_ref(),
                target_fields: targets,
                error: error.as_deref(),
            });
            let prompt = assembler.build(&PromptInput {
                transcript: transcript.as_ref().map(|t| t.markdown.as_str()),
                text: ocr_text,
                text_role: Some(text_role),
                image_count: images.len(),
                retry,
            });

            attempts += 1;
            state.llm_calls += 1;
            let output = extraction
                .extract(&prompt, images, response_schema)
                .await?;
            state.llm_usage += output.usage;
            span.end(state.retry_count, 0);
            ctx.report(interpolate(
                checkpoints::ACQUIRED,
                checkpoints::EXTRACTED,
                usize::try_from(attempts).unwrap_or(usize::MAX),
                total_attempts,
            ))
            .await;

            if ctx.is_canceled().await {
                return Ok(Flow::Canceled);
            }
            state.transition(WorkflowStatus::Validating);
            let span = StageLog::start("validation", ctx);

            let (candidate, verdict) = match output.parsed {
                Ok(value) => match &reextract {
                    Some((field, previous)) => {
                        let record = merge_field(previous, &value, field);
                        let mut verdict = validator.validate(&record);
                        // The merged record still holds the previous value.
                        if FieldPath::parse(field).is_missing(&value) {
                            verdict = ExtractionValidationResult::new(
                                vec![field.clone()],
                                verdict.errors,
                            );
                        }
                        (Some(record), verdict)
                    }
                    None => {
                        let verdict = validator.validate(&value);
                        (Some(value), verdict)
                    }
                },
                Err(message) => (None, ExtractionValidationResult::content_error(message)),
            };

            state.extraction_result = Some(ExtractionStateResult {
                data: candidate.clone(),
                success: verdict.valid,
                error: (!verdict.valid).then(|| verdict.summary()),
                retry_count: state.retry_count,
                validation: Some(verdict.clone()),
                usage: output.usage,
                model: output.model.clone(),
            });
            span.end(state.retry_count, verdict.missing_fields.len());

            if verdict.valid {
                return Ok(Flow::Extracted);
            }

            for error in &verdict.errors {
                state.record_error(error.clone());
            }
            if !verdict.missing_fields.is_empty() {
                state.record_error(format!(
                    "Missing fields: {}",
                    verdict.missing_fields.join(", ")
                ));
            }
            history.push(AttemptRecord {
                attempt_number: attempts,
                candidate: candidate.clone(),
                verdict: verdict.clone(),
                raw_output: output.raw,
                elapsed: started.elapsed(),
            });
            if candidate.is_some() {
                last_candidate = candidate;
            }

            if !(self.config.enable_extraction_retry && state.begin_retry()) {
                if history.iter().all(|a| a.candidate.is_none()) {
                    return Err(WorkflowError::Content(verdict.errors.join("; ")));
                }
                return Err(WorkflowError::RetriesExhausted {
                    attempts,
                    max_retries: state.max_retries,
                    verdict,
                    history,
                });
            }

            state.transition(WorkflowStatus::ExtractionRetry);
            tracing::info!(
                manifest_id = %state.manifest_id,
                retry = state.retry_count,
                max_retries = state.max_retries,
                missing_fields = verdict.missing_fields.len(),
                errors = verdict.errors.len(),
                "Candidate rejected; re-extracting"
            );
            let delay = self.config.retry_delay(state.retry_count);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let targets = if verdict.missing_fields.is_empty() {
                reextract
                    .as_ref()
                    .map(|(field, _)| vec![field.clone()])
                    .unwrap_or_default()
            } else {
                verdict.missing_fields
            };
            let error = (!verdict.errors.is_empty()).then(|| verdict.errors.join("; "));
            feedback = Some((targets, error));
        }
    }

    async fn save(&self, mut state: WorkflowState, ctx: &mut ExecutionContext<'_>) -> WorkflowOutcome {
        self.apply_costs(&mut state);
        state.transition(WorkflowStatus::Saving);
        ctx.report(checkpoints::SAVING).await;

        let mut terminal = state.clone();
        terminal.transition(WorkflowStatus::Completed);
        if !terminal.cost_is_consistent() {
            tracing::error!(manifest_id = %terminal.manifest_id, "Cost total does not match components");
        }

        match self.sink.commit(&terminal).await {
            Ok(()) => {
                ctx.report(checkpoints::COMPLETED).await;
                tracing::info!(
                    event = "end",
                    stage = "workflow",
                    manifest_id = %terminal.manifest_id,
                    job_id = ?terminal.job_id,
                    duration_ms = ctx.elapsed_ms(),
                    retry_count = terminal.retry_count,
                    extraction_cost = ?terminal.extraction_cost,
                    currency = ?terminal.currency,
                );
                WorkflowOutcome::Completed(Box::new(terminal))
            }
            Err(e) => {
                let error = WorkflowError::Persistence(e.to_string());
                self.fail(state, error, ctx, false).await
            }
        }
    }

    async fn fail(
        &self,
        mut state: WorkflowState,
        error: WorkflowError,
        ctx: &ExecutionContext<'_>,
        commit: bool,
    ) -> WorkflowOutcome {
        let failed_stage = state.status;
        state.record_error(error.to_string());
        self.apply_costs(&mut state);
        state.transition(WorkflowStatus::Failed);

        tracing::warn!(
            event = "fail",
            stage = %failed_stage,
            manifest_id = %state.manifest_id,
            job_id = ?state.job_id,
            duration_ms = ctx.elapsed_ms(),
            retry_count = state.retry_count,
            missing_fields = error.verdict().map_or(0, |v| v.missing_fields.len()),
            error = %error,
        );

        if commit {
            if let Err(e) = self.sink.commit(&state).await {
                tracing::error!(
                    manifest_id = %state.manifest_id,
                    error = %e,
                    "Result sink rejected failed state"
                );
            }
        }
        WorkflowOutcome::Failed {
            state: Box::new(state),
            error,
        }
    }

    fn apply_costs(&self, state: &mut WorkflowState) {
        let text = state.text_result.as_ref();
        let ocr_pricing = self.ocr.as_ref().and_then(|ocr| {
            text.filter(|t| t.extractor == ocr.id())
                .and_then(|_| ocr.pricing())
        });
        let text_usage = text.map_or_else(UsageMetrics::default, |t| {
            UsageMetrics::from_tokens(t.usage).with_pages(t.pages_processed)
        });
        let llm_pricing = self.provider.pricing.as_ref().filter(|_| state.llm_calls > 0);
        let llm_usage = UsageMetrics::from_tokens(state.llm_usage)
            .with_pages(text.map_or(0, |t| t.page_images.max(t.pages_processed)));

        let summary = CostAccountant.summarize(
            CostComponent {
                pricing: ocr_pricing,
                usage: text_usage,
            },
            CostComponent {
                pricing: llm_pricing,
                usage: llm_usage,
            },
        );
        state.text_cost = summary.text_cost;
        state.llm_cost = summary.llm_cost;
        state.extraction_cost = summary.total;
        state.currency = summary.currency;
    }
}

/// Copies the re-extracted field (and extraction info) onto the previous record.
fn merge_field(previous: &Value, candidate: &Value, field: &str) -> Value {
    let mut merged = previous.clone();
    FieldPath::parse(field).copy_into(candidate, &mut merged);
    if let (Some(info), Some(obj)) = (candidate.get(EXTRACTION_INFO_KEY), merged.as_object_mut()) {
        obj.insert(EXTRACTION_INFO_KEY.to_string(), info.clone());
    }
    merged
}
