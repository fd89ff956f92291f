use async_trait::async_trait;
use docflow_engine::prelude::*;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const VALID: &str = r#"{"total": 12, "vendor": "ACME"}"#;

#[derive(Clone)]
enum Reply {
    Text(&'static str),
    Unreachable,
    ContextOverflow,
}

#[derive(Debug, Clone)]
struct SeenCall {
    system: String,
    user: String,
    images: usize,
}

struct ScriptedLlm {
    script: Vec<Reply>,
    calls: Mutex<Vec<SeenCall>>,
    cancel_after: Option<(usize, CancellationFlag)>,
}

impl ScriptedLlm {
    fn new(script: Vec<Reply>) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
            cancel_after: None,
        }
    }

    fn canceling_after(mut self, calls: usize, flag: CancellationFlag) -> Self {
        self.cancel_after = Some((calls, flag));
        self
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn seen(&self) -> Vec<SeenCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn text_of(message: &ChatMessage) -> String {
    message
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text(t) => Some(t.as_str()),
            ContentPart::Image { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
        _provider: &ProviderConfig,
    ) -> Result<LlmCompletion, LlmError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(SeenCall {
                system: text_of(&messages[0]),
                user: text_of(&messages[1]),
                images: messages[1]
                    .content
                    .iter()
                    .filter(|p| matches!(p, ContentPart::Image { .. }))
                    .count(),
            });
            calls.len()
        };
        if let Some((after, flag)) = &self.cancel_after {
            if index >= *after {
                flag.cancel();
            }
        }
        let reply = self
            .script
            .get(index - 1)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or(Reply::Text("{}"));
        match reply {
            Reply::Text(content) => Ok(LlmCompletion {
                content: content.to_string(),
                usage: Some(TokenUsage::new(100, 20)),
                model: Some("scripted".into()),
            }),
            Reply::Unreachable => Err(LlmError::Transport("connection refused".into())),
            Reply::ContextOverflow => Err(LlmError::classify(
                "This model's maximum context length is 128000 tokens",
            )),
        }
    }
}

#[derive(Default)]
struct CountingOcr {
    calls: AtomicUsize,
    text: &'static str,
    pricing: Option<PricingConfig>,
}

#[async_trait]
impl OcrEngine for CountingOcr {
    fn id(&self) -> &str {
        "counting-ocr"
    }

    fn pricing(&self) -> Option<&PricingConfig> {
        self.pricing.as_ref()
    }

    async fn process(&self, _document: &Document) -> Result<OcrOutput, AcquisitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(OcrOutput {
            text: self.text.to_string(),
            markdown: self.text.to_string(),
            pages_processed: 2,
            ..OcrOutput::default()
        })
    }
}

struct CountingRasterizer {
    calls: AtomicUsize,
    pages: u32,
}

impl CountingRasterizer {
    const fn new(pages: u32) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            pages,
        }
    }
}

#[async_trait]
impl Rasterizer for CountingRasterizer {
    async fn rasterize(&self, _document: &Document) -> Result<Vec<PageImage>, AcquisitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((1..=self.pages)
            .map(|n| PageImage {
                page_number: n,
                bytes: Arc::from(vec![0x89, 0x50, 0x4e, 0x47]),
                mime_type: "image/png".into(),
            })
            .collect())
    }
}

#[derive(Default)]
struct RecordingSink {
    committed: Mutex<Vec<WorkflowState>>,
    reject: bool,
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn commit(
        &self,
        state: &WorkflowState,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.committed.lock().unwrap().push(state.clone());
        if self.reject {
            return Err("database unavailable".into());
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingProgress(Mutex<Vec<u8>>);

#[async_trait]
impl ProgressSink for RecordingProgress {
    async fn report(&self, percent: u8) {
        self.0.lock().unwrap().push(percent);
    }
}

fn invoice_schema() -> ExtractionSchema {
    ExtractionSchema::new(
        "invoice",
        json!({
            "type": "object",
            "properties": {
                "total": {"type": "number"},
                "vendor": {"type": "string"}
            },
            "required": ["total"]
        }),
    )
}

struct Harness {
    llm: Arc<ScriptedLlm>,
    ocr: Arc<CountingOcr>,
    rasterizer: Arc<CountingRasterizer>,
    sink: Arc<RecordingSink>,
    progress: RecordingProgress,
    flag: CancellationFlag,
    config: WorkflowConfig,
    provider: ProviderConfig,
    schema: ExtractionSchema,
}

impl Harness {
    fn new(script: Vec<Reply>) -> Self {
        Self {
            llm: Arc::new(ScriptedLlm::new(script)),
            ocr: Arc::new(CountingOcr {
                text: "INVOICE\nTOTAL 12.00",
                ..CountingOcr::default()
            }),
            rasterizer: Arc::new(CountingRasterizer::new(2)),
            sink: Arc::new(RecordingSink::default()),
            progress: RecordingProgress::default(),
            flag: CancellationFlag::new(),
            config: WorkflowConfig::default(),
            provider: ProviderConfig::default(),
            schema: invoice_schema(),
        }
    }

    async fn run(&self, request: WorkflowRequest) -> WorkflowOutcome {
        let engine = WorkflowEngine::builder(
            self.llm.clone(),
            Arc::new(StaticSchemaSource::new().with_schema(self.schema.clone())),
            self.sink.clone(),
        )
        .config(self.config.clone())
        .provider(self.provider.clone())
        .ocr(self.ocr.clone())
        .rasterizer(self.rasterizer.clone())
        .build()
        .unwrap();
        engine.run(request, &self.progress, &self.flag).await
    }

    fn ocr_calls(&self) -> usize {
        self.ocr.calls.load(Ordering::SeqCst)
    }

    fn raster_calls(&self) -> usize {
        self.rasterizer.calls.load(Ordering::SeqCst)
    }

    fn committed(&self) -> Vec<WorkflowState> {
        self.sink.committed.lock().unwrap().clone()
    }

    fn progress(&self) -> Vec<u8> {
        self.progress.0.lock().unwrap().clone()
    }
}

fn pdf_request(strategy: ExtractionStrategy) -> WorkflowRequest {
    WorkflowRequest::new("manifest-1", "invoice", Document::new("invoice.pdf", b"%PDF-1.7".to_vec()))
        .with_job_id("job-1")
        .with_strategy(strategy)
}

#[tokio::test]
async fn test_ocr_first_completes_on_first_attempt() {
    let h = Harness::new(vec![Reply::Text(VALID)]);
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    let WorkflowOutcome::Completed(state) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(state.retry_count, 0);
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(
        state.status_history,
        vec![
            WorkflowStatus::Pending,
            WorkflowStatus::TextExtracting,
            WorkflowStatus::Extracting,
            WorkflowStatus::Validating,
            WorkflowStatus::Saving,
            WorkflowStatus::Completed,
        ]
    );
    assert_eq!(state.extraction_result.as_ref().unwrap().data, Some(serde_json::from_str::<Value>(VALID).unwrap()));
    assert_eq!(state.text_result.as_ref().unwrap().extractor, "counting-ocr");
    assert_eq!(state.llm_usage, TokenUsage::new(100, 20));

    assert_eq!((h.ocr_calls(), h.raster_calls(), h.llm.call_count()), (1, 0, 1));
    let seen = h.llm.seen();
    assert_eq!(seen[0].images, 0);
    assert!(seen[0].user.starts_with("OCR Text:\nINVOICE"));
    assert!(seen[0].system.contains("Required fields:\n- total"));

    let committed = h.committed();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].status, WorkflowStatus::Completed);

    let progress = h.progress();
    assert!(progress.windows(2).all(|w| w[0] < w[1]), "{progress:?}");
    assert_eq!(progress.first(), Some(&5));
    assert_eq!(progress.last(), Some(&100));
}

#[tokio::test]
async fn test_vision_only_never_calls_ocr() {
    let h = Harness::new(vec![Reply::Text(VALID)]);
    let outcome = h.run(pdf_request(ExtractionStrategy::VisionOnly)).await;

    assert!(outcome.is_completed());
    assert_eq!((h.ocr_calls(), h.raster_calls()), (0, 1));
    let seen = h.llm.seen();
    assert_eq!(seen[0].images, 2);
    assert!(!seen[0].user.contains("OCR Text"));
}

#[tokio::test]
async fn test_vision_first_and_two_stage_call_both_paths() {
    for strategy in [ExtractionStrategy::VisionFirst, ExtractionStrategy::TwoStage] {
        let h = Harness::new(vec![Reply::Text(VALID)]);
        let outcome = h.run(pdf_request(strategy)).await;
        assert!(outcome.is_completed(), "{strategy}");
        assert_eq!((h.ocr_calls(), h.raster_calls()), (1, 1), "{strategy}");
        assert_eq!(h.llm.seen()[0].images, 2);
    }
}

#[tokio::test]
async fn test_vision_first_succeeds_when_ocr_disagrees() {
    let mut h = Harness::new(vec![Reply::Text(VALID)]);
    h.ocr = Arc::new(CountingOcr {
        text: "TOTAL 999.99\nVENDOR Someone Else",
        ..CountingOcr::default()
    });
    let outcome = h.run(pdf_request(ExtractionStrategy::VisionFirst)).await;

    let state = outcome.state().unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.extraction_result.as_ref().unwrap().data.as_ref().unwrap()["total"], 12);
    assert!(h.llm.seen()[0].user.contains("reference only"));
}

#[tokio::test]
async fn test_vision_only_falls_back_without_vision_support() {
    let mut h = Harness::new(vec![Reply::Text(VALID)]);
    h.provider.supports_vision = false;
    let outcome = h.run(pdf_request(ExtractionStrategy::VisionOnly)).await;

    let state = outcome.state().unwrap();
    let resolution = state.strategy.unwrap();
    assert_eq!(resolution.strategy, ExtractionStrategy::OcrFirst);
    assert_eq!(resolution.requested, Some(ExtractionStrategy::VisionOnly));
    assert!(resolution.fallback);
    assert_eq!((h.ocr_calls(), h.raster_calls()), (1, 0));
}

#[tokio::test]
async fn test_undeclared_strategy_uses_vision_for_images() {
    let h = Harness::new(vec![Reply::Text(VALID)]);
    let request = WorkflowRequest::new("m", "invoice", Document::new("scan.PNG", vec![1_u8, 2, 3]));
    let outcome = h.run(request).await;

    let resolution = outcome.state().unwrap().strategy.unwrap();
    assert_eq!(resolution.strategy, ExtractionStrategy::VisionOnly);
    assert!(!resolution.fallback);
    assert_eq!((h.ocr_calls(), h.raster_calls()), (0, 0));
    assert_eq!(h.llm.seen()[0].images, 1);
}

#[tokio::test]
async fn test_vision_failure_does_not_fall_back_to_ocr() {
    let h = Harness::new(vec![Reply::Unreachable]);
    let outcome = h.run(pdf_request(ExtractionStrategy::VisionOnly)).await;

    let WorkflowOutcome::Failed { state, error } = outcome else {
        panic!("expected failure");
    };
    assert!(matches!(error, WorkflowError::Transport(ref m) if m.contains("connection refused")));
    assert_eq!(h.ocr_calls(), 0);
    assert_eq!(h.llm.call_count(), 1);
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert!(state.errors.iter().any(|e| e.contains("connection refused")));
    assert_eq!(h.committed().len(), 1);
}

#[tokio::test]
async fn test_never_valid_fails_after_max_retries_plus_one_attempts() {
    let mut h = Harness::new(vec![Reply::Text(r#"{"vendor": "ACME"}"#)]);
    h.config = WorkflowConfig::default().with_max_retries(2);
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    let WorkflowOutcome::Failed { state, error } = outcome else {
        panic!("expected failure");
    };
    let WorkflowError::RetriesExhausted {
        attempts,
        max_retries,
        verdict,
        history,
    } = error
    else {
        panic!("expected exhausted retries, got {error}");
    };
    assert_eq!((attempts, max_retries), (3, 2));
    assert_eq!(history.len(), 3);
    assert_eq!(verdict.missing_fields, vec!["total".to_string()]);
    assert_eq!(state.retry_count, 2);
    assert_eq!(h.llm.call_count(), 3);
    let retries = state
        .status_history
        .iter()
        .filter(|s| **s == WorkflowStatus::ExtractionRetry)
        .count();
    assert_eq!(retries, 2);
    assert_eq!(h.committed()[0].status, WorkflowStatus::Failed);
    assert!(h.progress().iter().all(|p| *p < 100));
}

#[tokio::test]
async fn test_retry_disabled_fails_after_one_attempt() {
    let mut h = Harness::new(vec![Reply::Text("{}")]);
    h.config = WorkflowConfig::default().with_extraction_retry(false);
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    assert!(matches!(outcome, WorkflowOutcome::Failed { .. }));
    assert_eq!(h.llm.call_count(), 1);
    assert_eq!(outcome.state().unwrap().retry_count, 0);
}

#[tokio::test]
async fn test_retry_prompt_targets_missing_fields() {
    let h = Harness::new(vec![
        Reply::Text(r#"{"vendor": "ACME"}"#),
        Reply::Text(VALID),
    ]);
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    let state = outcome.state().unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.retry_count, 1);
    assert_eq!(state.llm_usage, TokenUsage::new(200, 40));

    let seen = h.llm.seen();
    assert!(!seen[0].user.contains("Missing fields"));
    let retry = &seen[1].user;
    assert!(retry.contains("Previous result:"));
    assert!(retry.contains("\"vendor\": \"ACME\""));
    assert!(retry.contains("Missing fields:\n- total"));
    assert!(seen[1].system.starts_with("You are correcting a previous extraction"));
}

#[tokio::test]
async fn test_unparsable_output_is_retried() {
    let h = Harness::new(vec![
        Reply::Text("Sorry, I cannot help with that."),
        Reply::Text(VALID),
    ]);
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    let state = outcome.state().unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.retry_count, 1);
    assert!(state.errors[0].starts_with("Model output is not valid JSON"));
    assert!(h.llm.seen()[1].user.contains("Error: Model output is not valid JSON"));
}

#[tokio::test]
async fn test_context_overflow_is_terminal() {
    let h = Harness::new(vec![Reply::ContextOverflow]);
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    assert!(matches!(
        outcome,
        WorkflowOutcome::Failed {
            error: WorkflowError::ContextTooLarge(_),
            ..
        }
    ));
    assert_eq!(h.llm.call_count(), 1);
}

#[tokio::test]
async fn test_costs_are_computed_per_component_and_summed() {
    let mut h = Harness::new(vec![Reply::Text(VALID)]);
    h.ocr = Arc::new(CountingOcr {
        text: "TOTAL 12.00",
        pricing: Some(PricingConfig::page("USD", Decimal::new(1, 2))),
        ..CountingOcr::default()
    });
    h.provider.pricing = Some(PricingConfig::token("USD", Decimal::from(2), Decimal::from(4)));
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    let state = outcome.state().unwrap();
    assert_eq!(state.text_cost, Decimal::new(2, 2));
    assert_eq!(state.llm_cost, Decimal::new(28, 5));
    assert_eq!(state.extraction_cost, Some(Decimal::new(2028, 5)));
    assert_eq!(state.currency.as_deref(), Some("USD"));
    assert!(state.cost_is_consistent());
}

#[tokio::test]
async fn test_mixed_currencies_leave_total_undefined() {
    let mut h = Harness::new(vec![Reply::Text(VALID)]);
    h.ocr = Arc::new(CountingOcr {
        text: "TOTAL 12.00",
        pricing: Some(PricingConfig::page("EUR", Decimal::new(1, 2))),
        ..CountingOcr::default()
    });
    h.provider.pricing = Some(PricingConfig::fixed("USD", Decimal::new(5, 2)));
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    let state = outcome.state().unwrap();
    assert_eq!(state.text_cost, Decimal::new(2, 2));
    assert_eq!(state.llm_cost, Decimal::new(5, 2));
    assert_eq!(state.extraction_cost, None);
}

#[tokio::test]
async fn test_invalid_pricing_is_rejected_at_build() {
    let mut provider = ProviderConfig::default();
    let mut pricing = PricingConfig::token("USD", Decimal::ONE, Decimal::ONE);
    pricing.input_price_per_million = None;
    provider.pricing = Some(pricing);

    let result = WorkflowEngine::builder(
        Arc::new(ScriptedLlm::new(Vec::new())),
        Arc::new(StaticSchemaSource::new()),
        Arc::new(RecordingSink::default()),
    )
    .provider(provider)
    .build();
    assert!(matches!(result, Err(WorkflowError::Config(_))));
}

#[tokio::test]
async fn test_per_page_transcript_feeds_text_only_extraction() {
    let mut h = Harness::new(vec![
        Reply::Text("# Invoice"),
        Reply::Text("Total: 12.00"),
        Reply::Text(VALID),
    ]);
    h.config = WorkflowConfig::default().with_vision_mode(VisionMode::PerPage);
    let outcome = h.run(pdf_request(ExtractionStrategy::VisionOnly)).await;

    let state = outcome.state().unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    let text = state.text_result.as_ref().unwrap();
    assert_eq!(text.markdown, "# Invoice\n\n---\n\nTotal: 12.00");
    assert_eq!(text.extractor, "vision-transcript");
    assert_eq!(state.llm_usage, TokenUsage::new(300, 60));

    let seen = h.llm.seen();
    assert_eq!(seen.len(), 3);
    assert_eq!((seen[0].images, seen[1].images, seen[2].images), (1, 1, 0));
    assert!(seen[2].user.starts_with("Page Transcript:\n# Invoice"));
}

#[tokio::test]
async fn test_cancel_between_pages_commits_nothing() {
    let mut h = Harness::new(vec![Reply::Text("# page")]);
    h.rasterizer = Arc::new(CountingRasterizer::new(3));
    h.config = WorkflowConfig::default().with_vision_mode(VisionMode::PerPage);
    h.llm = Arc::new(ScriptedLlm::new(vec![Reply::Text("# page")]).canceling_after(1, h.flag.clone()));
    let outcome = h.run(pdf_request(ExtractionStrategy::VisionOnly)).await;

    let WorkflowOutcome::Canceled {
        manifest_id,
        last_status,
        last_progress,
    } = outcome
    else {
        panic!("expected cancellation");
    };
    assert_eq!(manifest_id, "manifest-1");
    assert_eq!(last_status, WorkflowStatus::TextExtracting);
    assert!(last_progress.unwrap() < 100);
    assert_eq!(h.llm.call_count(), 1);
    assert!(h.committed().is_empty());
    assert!(h.progress().iter().all(|p| *p < 40));
}

#[tokio::test]
async fn test_cancel_before_acquisition() {
    let h = Harness::new(vec![Reply::Text(VALID)]);
    h.flag.cancel();
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    assert!(matches!(
        outcome,
        WorkflowOutcome::Canceled {
            last_status: WorkflowStatus::Pending,
            ..
        }
    ));
    assert_eq!((h.ocr_calls(), h.llm.call_count()), (0, 0));
    assert!(h.committed().is_empty());
}

#[tokio::test]
async fn test_unsupported_document_fails_precheck() {
    let h = Harness::new(vec![Reply::Text(VALID)]);
    let request = WorkflowRequest::new("m", "invoice", Document::new("notes.txt", b"hello".to_vec()));
    let outcome = h.run(request).await;

    let WorkflowOutcome::Failed { state, error } = outcome else {
        panic!("expected failure");
    };
    assert!(matches!(error, WorkflowError::InvalidDocument(_)));
    assert_eq!(
        state.status_history,
        vec![WorkflowStatus::Pending, WorkflowStatus::Failed]
    );
    assert_eq!((h.ocr_calls(), h.llm.call_count()), (0, 0));
}

#[tokio::test]
async fn test_unknown_schema_fails() {
    let h = Harness::new(vec![Reply::Text(VALID)]);
    let request = WorkflowRequest::new("m", "receipt", Document::new("a.pdf", b"%PDF".to_vec()));
    let outcome = h.run(request).await;
    assert!(matches!(
        outcome,
        WorkflowOutcome::Failed {
            error: WorkflowError::Schema(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_text_context_override_skips_ocr() {
    let h = Harness::new(vec![Reply::Text(VALID)]);
    let request = pdf_request(ExtractionStrategy::OcrFirst)
        .with_text_context("Invoice total: 12")
        .with_custom_prompt("Amounts are in euro.");
    let outcome = h.run(request).await;

    let state = outcome.state().unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.text_result.as_ref().unwrap().extractor, "text-override");
    assert_eq!(h.ocr_calls(), 0);
    let seen = h.llm.seen();
    assert_eq!(seen[0].user, "OCR Text:\nInvoice total: 12");
    assert!(seen[0].system.ends_with("Additional instructions:\nAmounts are in euro."));
}

#[tokio::test]
async fn test_field_reextract_merges_into_previous_record() {
    let mut h = Harness::new(vec![Reply::Text(r#"{"total": 999, "vendor": "ACME"}"#)]);
    h.schema = invoice_schema().with_required_fields(["total", "vendor"]);
    let request = pdf_request(ExtractionStrategy::OcrFirst)
        .with_field_reextract("vendor", json!({"total": 10, "vendor": "AC ME"}));
    let outcome = h.run(request).await;

    let state = outcome.state().unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.retry_count, 1);
    assert_eq!(
        state.extraction_result.as_ref().unwrap().data,
        Some(json!({"total": 10, "vendor": "ACME"}))
    );

    let seen = h.llm.seen();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].user.contains("Missing fields:\n- vendor"));
    assert!(seen[0].user.contains("\"total\": 10"));
    assert!(!seen[0].user.contains("AC ME"));
}

#[tokio::test]
async fn test_field_reextract_without_target_is_rejected() {
    let mut h = Harness::new(vec![
        Reply::Text(r#"{"total": 10}"#),
        Reply::Text(r#"{"vendor": "ACME"}"#),
    ]);
    h.schema = invoice_schema().with_required_fields(["total", "vendor"]);
    let request = pdf_request(ExtractionStrategy::OcrFirst)
        .with_field_reextract("vendor", json!({"total": 10, "vendor": "AC ME"}));
    let outcome = h.run(request).await;

    let state = outcome.state().unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.retry_count, 2);
    assert_eq!(state.llm_calls, 2);
    assert_eq!(
        state.extraction_result.as_ref().unwrap().data,
        Some(json!({"total": 10, "vendor": "ACME"}))
    );
    assert!(state.errors.iter().any(|e| e == "Missing fields: vendor"));
    assert!(h.llm.seen()[1].user.contains("Missing fields:\n- vendor"));
}

#[tokio::test]
async fn test_field_reextract_without_target_fails_when_retry_disabled() {
    let mut h = Harness::new(vec![Reply::Text(r#"{"total": 10}"#)]);
    h.schema = invoice_schema().with_required_fields(["total", "vendor"]);
    h.config = WorkflowConfig::default().with_extraction_retry(false);
    let request = pdf_request(ExtractionStrategy::OcrFirst)
        .with_field_reextract("vendor", json!({"total": 10, "vendor": "AC ME"}));
    let outcome = h.run(request).await;

    let WorkflowOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure");
    };
    let verdict = error.verdict().unwrap();
    assert_eq!(verdict.missing_fields, vec!["vendor".to_string()]);
    assert_eq!(h.llm.call_count(), 1);
}

#[tokio::test]
async fn test_failed_page_keeps_earlier_page_usage() {
    let mut h = Harness::new(vec![
        Reply::Text("# Invoice"),
        Reply::Text("Total: 12.00"),
        Reply::Unreachable,
    ]);
    h.rasterizer = Arc::new(CountingRasterizer::new(3));
    h.config = WorkflowConfig::default().with_vision_mode(VisionMode::PerPage);
    let outcome = h.run(pdf_request(ExtractionStrategy::VisionOnly)).await;

    let WorkflowOutcome::Failed { state, error } = outcome else {
        panic!("expected failure");
    };
    assert!(matches!(error, WorkflowError::Transport(_)));
    assert_eq!(state.llm_calls, 3);
    assert_eq!(state.llm_usage, TokenUsage::new(200, 40));
    assert_eq!(h.llm.call_count(), 3);
    assert_eq!(h.committed()[0].llm_usage, TokenUsage::new(200, 40));
}

#[tokio::test]
async fn test_unparsable_output_without_retry_is_content_error() {
    let mut h = Harness::new(vec![Reply::Text("Sorry, I cannot help with that.")]);
    h.config = WorkflowConfig::default().with_extraction_retry(false);
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    let WorkflowOutcome::Failed { state, error } = outcome else {
        panic!("expected failure");
    };
    assert!(
        matches!(error, WorkflowError::Content(ref m) if m.starts_with("Model output is not valid JSON")),
        "{error}"
    );
    assert_eq!(state.extraction_result.as_ref().unwrap().data, None);
    assert_eq!(h.llm.call_count(), 1);
}

#[tokio::test]
async fn test_parsed_attempt_keeps_exhausted_retries_error() {
    let mut h = Harness::new(vec![
        Reply::Text(r#"{"vendor": "ACME"}"#),
        Reply::Text("not json"),
    ]);
    h.config = WorkflowConfig::default().with_max_retries(1);
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    let WorkflowOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure");
    };
    assert!(matches!(error, WorkflowError::RetriesExhausted { attempts: 2, .. }), "{error}");
}

#[tokio::test]
async fn test_sink_rejection_fails_the_run() {
    let mut h = Harness::new(vec![Reply::Text(VALID)]);
    h.sink = Arc::new(RecordingSink {
        reject: true,
        ..RecordingSink::default()
    });
    let outcome = h.run(pdf_request(ExtractionStrategy::OcrFirst)).await;

    let WorkflowOutcome::Failed { state, error } = outcome else {
        panic!("expected failure");
    };
    assert!(matches!(error, WorkflowError::Persistence(ref m) if m.contains("database unavailable")));
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(h.committed().len(), 1);
    assert!(!h.progress().contains(&100));
}
