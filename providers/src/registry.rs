//! Extractors selectable by a stable string id.
//!
//! Each entry declares its parameters; configurations are validated against
//! that declaration when the extractor is built, not when it first runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use docflow_engine::collaborators::{LlmClient, OcrEngine};
use docflow_engine::config::ProviderConfig;
use docflow_engine::cost::PricingConfig;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::errors::ProviderError;
use crate::params::{validate_params, ParamSpec, PRICING_KEY};
use crate::pdftoppm::{PdftoppmRasterizer, DEFAULT_DPI};
use crate::tesseract::{TesseractOcr, TESSERACT_ID};
use crate::vision::{VisionLlmOcr, VISION_LLM_ID};

/// How an extractor reads documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorCategory {
    /// Classic OCR.
    Ocr,
    /// Vision model transcription.
    Vision,
    /// Both.
    Hybrid,
}

/// Describes one registered extractor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorMetadata {
    /// Stable id.
    pub id: &'static str,
    /// Display name.
    pub name: &'static str,
    /// What it does.
    pub description: &'static str,
    /// Implementation version.
    pub version: &'static str,
    /// Kind of extractor.
    pub category: ExtractorCategory,
    /// File extensions it accepts.
    pub supported_formats: Vec<&'static str>,
    /// Declared parameters.
    pub params_schema: Vec<ParamSpec>,
}

/// Shared collaborators some extractors build on.
#[derive(Clone, Default)]
pub struct ExtractorContext {
    /// Language model for vision-backed extractors.
    pub llm: Option<Arc<dyn LlmClient>>,
    /// Model settings passed to `llm`.
    pub provider: ProviderConfig,
}

type Factory = fn(&Map<String, Value>, &ExtractorContext) -> Result<Arc<dyn OcrEngine>, ProviderError>;

struct Entry {
    metadata: ExtractorMetadata,
    factory: Factory,
}

/// Registry of text extractors keyed by id.
pub struct ExtractorRegistry {
    entries: BTreeMap<&'static str, Entry>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ExtractorRegistry {
    /// An empty registry.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// A registry holding the bundled extractors.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(tesseract_metadata(), build_tesseract);
        registry.register(vision_metadata(), build_vision);
        registry
    }

    /// Adds or replaces an extractor.
    pub fn register(&mut self, metadata: ExtractorMetadata, factory: Factory) {
        self.entries.insert(metadata.id, Entry { metadata, factory });
    }

    /// Metadata of every extractor, sorted by id.
    pub fn list(&self) -> impl Iterator<Item = &ExtractorMetadata> {
        self.entries.values().map(|e| &e.metadata)
    }

    /// Metadata of one extractor.
    #[must_use]
    pub fn metadata(&self, id: &str) -> Option<&ExtractorMetadata> {
        self.entries.get(id).map(|e| &e.metadata)
    }

    /// Validates `config` and builds the extractor.
    pub fn create(
        &self,
        id: &str,
        config: &Map<String, Value>,
        context: &ExtractorContext,
    ) -> Result<Arc<dyn OcrEngine>, ProviderError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| ProviderError::UnknownExtractor(id.to_string()))?;
        let mut params = validate_params(&entry.metadata.params_schema, config)?;
        if let Some(pricing) = config.get(PRICING_KEY) {
            params.insert(PRICING_KEY.to_string(), pricing.clone());
        }
        tracing::debug!(extractor = id, "Building extractor");
        (entry.factory)(&params, context)
    }
}

/// Parses and validates the optional `pricing` entry.
fn pricing(params: &Map<String, Value>) -> Result<Option<PricingConfig>, ProviderError> {
    let Some(value) = params.get(PRICING_KEY) else {
        return Ok(None);
    };
    let pricing: PricingConfig = serde_json::from_value(value.clone())
        .map_err(|e| ProviderError::InvalidConfig(vec![format!("Invalid pricing: {e}")]))?;
    pricing
        .validate()
        .map_err(|e| ProviderError::InvalidConfig(vec![format!("Invalid pricing: {e}")]))?;
    Ok(Some(pricing))
}

fn path_param(params: &Map<String, Value>, key: &str) -> Option<PathBuf> {
    params.get(key).and_then(Value::as_str).map(PathBuf::from)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn u32_param(params: &Map<String, Value>, key: &str) -> Option<u32> {
    params.get(key).and_then(Value::as_f64).map(|v| v as u32)
}

fn tesseract_metadata() -> ExtractorMetadata {
    ExtractorMetadata {
        id: TESSERACT_ID,
        name: "Tesseract OCR",
        description: "Local OCR with the tesseract binary; PDFs are rasterized with pdftoppm",
        version: env!("CARGO_PKG_VERSION"),
        category: ExtractorCategory::Ocr,
        supported_formats: vec!["pdf", "png", "jpg", "jpeg", "gif", "webp", "bmp"],
        params_schema: vec![
            ParamSpec::string("language", "Tesseract language pack(s), e.g. eng or eng+deu")
                .with_pattern(r"^[A-Za-z_]+(\+[A-Za-z_]+)*$")
                .with_default(json!("eng")),
            ParamSpec::number("psm", "Page segmentation mode", Some(0.0), Some(13.0)),
            ParamSpec::number("dpi", "Rasterization resolution for PDFs", Some(72.0), Some(1200.0))
                .with_default(json!(DEFAULT_DPI)),
            ParamSpec::number("timeoutSecs", "Per-page timeout in seconds", Some(1.0), None),
            ParamSpec::string("binaryPath", "Explicit tesseract path"),
            ParamSpec::string("pdftoppmPath", "Explicit pdftoppm path"),
        ],
    }
}

fn build_tesseract(
    params: &Map<String, Value>,
    _context: &ExtractorContext,
) -> Result<Arc<dyn OcrEngine>, ProviderError> {
    let mut ocr = TesseractOcr::discover(path_param(params, "binaryPath"))?;
    if let Some(language) = params.get("language").and_then(Value::as_str) {
        ocr = ocr.with_language(language);
    }
    if let Some(psm) = u32_param(params, "psm") {
        ocr = ocr.with_page_segmentation_mode(psm);
    }
    if let Some(secs) = u32_param(params, "timeoutSecs") {
        ocr = ocr.with_timeout(Duration::from_secs(u64::from(secs)));
    }
    match PdftoppmRasterizer::discover(path_param(params, "pdftoppmPath")) {
        Ok(rasterizer) => {
            let dpi = u32_param(params, "dpi").unwrap_or(DEFAULT_DPI);
            ocr = ocr.with_rasterizer(rasterizer.with_dpi(dpi));
        }
        Err(e) => tracing::warn!(error = %e, "pdftoppm unavailable; tesseract will reject PDFs"),
    }
    if let Some(pricing) = pricing(params)? {
        ocr = ocr.with_pricing(pricing);
    }
    Ok(Arc::new(ocr))
}

fn vision_metadata() -> ExtractorMetadata {
    ExtractorMetadata {
        id: VISION_LLM_ID,
        name: "Vision LLM transcription",
        description: "Transcribes each page image with the configured vision model",
        version: env!("CARGO_PKG_VERSION"),
        category: ExtractorCategory::Vision,
        supported_formats: vec!["pdf", "png", "jpg", "jpeg", "gif", "webp"],
        params_schema: vec![
            ParamSpec::string("prompt", "Replaces the transcription instruction"),
            ParamSpec::number("dpi", "Rasterization resolution for PDFs", Some(72.0), Some(1200.0))
                .with_default(json!(DEFAULT_DPI)),
            ParamSpec::string("pdftoppmPath", "Explicit pdftoppm path"),
        ],
    }
}

fn build_vision(
    params: &Map<String, Value>,
    context: &ExtractorContext,
) -> Result<Arc<dyn OcrEngine>, ProviderError> {
    let llm = context
        .llm
        .clone()
        .ok_or_else(|| ProviderError::MissingDependency {
            extractor: VISION_LLM_ID.to_string(),
            requirement: "a language model client",
        })?;
    if !context.provider.supports_vision {
        return Err(ProviderError::MissingDependency {
            extractor: VISION_LLM_ID.to_string(),
            requirement: "a vision-capable model",
        });
    }
    let mut ocr = VisionLlmOcr::new(llm, context.provider.clone());
    if let Some(prompt) = params.get("prompt").and_then(Value::as_str) {
        ocr = ocr.with_prompt(prompt);
    }
    match PdftoppmRasterizer::discover(path_param(params, "pdftoppmPath")) {
        Ok(rasterizer) => {
            let dpi = u32_param(params, "dpi").unwrap_or(DEFAULT_DPI);
            ocr = ocr.with_rasterizer(Arc::new(rasterizer.with_dpi(dpi)));
        }
        Err(e) => tracing::warn!(error = %e, "pdftoppm unavailable; vision-llm will reject PDFs"),
    }
    if let Some(pricing) = pricing(params)? {
        ocr = ocr.with_pricing(pricing);
    }
    Ok(Arc::new(ocr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docflow_engine::collaborators::{ChatMessage, CompletionOptions, LlmCompletion, LlmError};

    struct NullLlm;

    #[async_trait]
    impl LlmClient for NullLlm {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
            _provider: &ProviderConfig,
        ) -> Result<LlmCompletion, LlmError> {
            Ok(LlmCompletion::default())
        }
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_lists_bundled_extractors() {
        let registry = ExtractorRegistry::with_defaults();
        let ids: Vec<&str> = registry.list().map(|m| m.id).collect();
        assert_eq!(ids, vec!["tesseract", "vision-llm"]);
        let meta = registry.metadata("tesseract").unwrap();
        assert_eq!(meta.category, ExtractorCategory::Ocr);
        assert!(meta.supported_formats.contains(&"pdf"));
    }

    #[test]
    fn test_unknown_extractor() {
        let registry = ExtractorRegistry::with_defaults();
        let err = registry
            .create("azure", &Map::new(), &ExtractorContext::default())
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::UnknownExtractor(ref id) if id == "azure"));
    }

    #[test]
    fn test_params_validated_before_build() {
        let registry = ExtractorRegistry::with_defaults();
        let err = registry
            .create(
                "tesseract",
                &config(json!({"psm": 99, "colour": true})),
                &ExtractorContext::default(),
            )
            .err()
            .unwrap();
        let ProviderError::InvalidConfig(errors) = err else {
            panic!("expected invalid config");
        };
        assert!(errors.contains(&"Unknown parameter: colour".to_string()));
        assert!(errors.contains(&"Parameter psm must be <= 13".to_string()));
    }

    #[test]
    fn test_vision_extractor_needs_llm() {
        let registry = ExtractorRegistry::with_defaults();
        let err = registry
            .create("vision-llm", &Map::new(), &ExtractorContext::default())
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::MissingDependency { .. }));
    }

    #[test]
    fn test_vision_extractor_with_pricing() {
        let registry = ExtractorRegistry::with_defaults();
        let context = ExtractorContext {
            llm: Some(Arc::new(NullLlm)),
            provider: ProviderConfig::default(),
        };
        let ocr = registry
            .create(
                "vision-llm",
                &config(json!({
                    "prompt": "Transcribe.",
                    "pricing": {"mode": "page", "currency": "EUR", "pricePerPage": "0.002"}
                })),
                &context,
            )
            .unwrap();
        assert_eq!(ocr.id(), "vision-llm");
        assert_eq!(ocr.pricing().unwrap().currency, "EUR");
    }

    #[test]
    fn test_invalid_pricing_rejected() {
        let registry = ExtractorRegistry::with_defaults();
        let context = ExtractorContext {
            llm: Some(Arc::new(NullLlm)),
            provider: ProviderConfig::default(),
        };
        let err = registry
            .create(
                "vision-llm",
                &config(json!({"pricing": {"mode": "token", "currency": "USD"}})),
                &context,
            )
            .err()
            .unwrap();
        assert!(err.to_string().contains("Invalid pricing"));
    }
}
