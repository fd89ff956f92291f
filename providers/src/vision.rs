//! Text extraction by transcribing page images with a vision model.

use std::sync::Arc;

use async_trait::async_trait;
use docflow_engine::collaborators::{
    AcquisitionError, ChatMessage, CompletionOptions, Document, LlmClient, OcrEngine, OcrOutput,
    PageImage, Rasterizer,
};
use docflow_engine::config::{ProviderConfig, DEFAULT_PAGE_SEPARATOR};
use docflow_engine::cost::PricingConfig;
use docflow_engine::state::TokenUsage;
use docflow_engine::strategy::FileType;

/// Registry id.
pub const VISION_LLM_ID: &str = "vision-llm";

/// Default transcription instruction.
pub const DEFAULT_TRANSCRIPTION_PROMPT: &str = "Transcribe all text on this page as Markdown. \
Keep the reading order, headings and tables. Do not add commentary.";

/// An OCR engine that asks a vision model to transcribe every page.
pub struct VisionLlmOcr {
    llm: Arc<dyn LlmClient>,
    provider: ProviderConfig,
    rasterizer: Option<Arc<dyn Rasterizer>>,
    prompt: String,
    pricing: Option<PricingConfig>,
}

impl VisionLlmOcr {
    /// Creates the engine. PDFs additionally need a rasterizer.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>, provider: ProviderConfig) -> Self {
        Self {
            llm,
            provider,
            rasterizer: None,
            prompt: DEFAULT_TRANSCRIPTION_PROMPT.to_string(),
            pricing: None,
        }
    }

    /// Sets the rasterizer used for PDFs.
    #[must_use]
    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    /// Replaces the transcription instruction.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Sets the pricing of this extractor.
    #[must_use]
    pub fn with_pricing(mut self, pricing: PricingConfig) -> Self {
        self.pricing = Some(pricing);
        self
    }

    async fn pages(&self, document: &Document) -> Result<Vec<PageImage>, AcquisitionError> {
        match document.file_type() {
            Some(FileType::Pdf) => {
                let rasterizer = self
                    .rasterizer
                    .as_ref()
                    .ok_or(AcquisitionError::NotConfigured("rasterizer"))?;
                let mut pages = rasterizer.rasterize(document).await?;
                pages.sort_by_key(|p| p.page_number);
                Ok(pages)
            }
            _ => Ok(vec![PageImage {
                page_number: 1,
                bytes: Arc::clone(&document.bytes),
                mime_type: document.mime_type().to_string(),
            }]),
        }
    }
}

#[async_trait]
impl OcrEngine for VisionLlmOcr {
    fn id(&self) -> &str {
        VISION_LLM_ID
    }

    fn pricing(&self) -> Option<&PricingConfig> {
        self.pricing.as_ref()
    }

    async fn process(&self, document: &Document) -> Result<OcrOutput, AcquisitionError> {
        let pages = self.pages(document).await?;
        let mut usage = TokenUsage::default();
        let mut transcripts = Vec::with_capacity(pages.len());

        for page in &pages {
            let messages = [
                ChatMessage::system(self.prompt.clone()),
                ChatMessage::user(format!("Page {}", page.page_number)).with_images([page]),
            ];
            let completion = self
                .llm
                .complete(&messages, &CompletionOptions::default(), &self.provider)
                .await
                .map_err(|e| AcquisitionError::Ocr(e.to_string()))?;
            usage += completion.usage.unwrap_or_default();
            transcripts.push(completion.content.trim().to_string());
        }

        let markdown = transcripts.join(DEFAULT_PAGE_SEPARATOR);
        Ok(OcrOutput {
            text: markdown.clone(),
            markdown,
            structural_result: None,
            pages_processed: u32::try_from(pages.len()).unwrap_or(u32::MAX),
            usage: Some(usage),
            model: Some(self.provider.model_name.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_engine::collaborators::{LlmCompletion, LlmError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PageEcho(AtomicUsize);

    #[async_trait]
    impl LlmClient for PageEcho {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _options: &CompletionOptions,
            _provider: &ProviderConfig,
        ) -> Result<LlmCompletion, LlmError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(messages[1].has_images());
            Ok(LlmCompletion {
                content: format!(" page {n} text \n"),
                usage: Some(TokenUsage::new(50, 10)),
                model: None,
            })
        }
    }

    struct TwoPages;

    #[async_trait]
    impl Rasterizer for TwoPages {
        async fn rasterize(&self, _document: &Document) -> Result<Vec<PageImage>, AcquisitionError> {
            Ok([2, 1]
                .into_iter()
                .map(|n| PageImage {
                    page_number: n,
                    bytes: Arc::from(vec![0_u8]),
                    mime_type: "image/png".into(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_transcribes_every_page() {
        let ocr = VisionLlmOcr::new(Arc::new(PageEcho(AtomicUsize::new(0))), ProviderConfig::default())
            .with_rasterizer(Arc::new(TwoPages));
        let output = ocr
            .process(&Document::new("a.pdf", b"%PDF".to_vec()))
            .await
            .unwrap();
        assert_eq!(output.text, "page 1 text\n\n---\n\npage 2 text");
        assert_eq!(output.pages_processed, 2);
        assert_eq!(output.usage, Some(TokenUsage::new(100, 20)));
        assert_eq!(output.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn test_image_is_sent_directly() {
        let llm = Arc::new(PageEcho(AtomicUsize::new(0)));
        let ocr = VisionLlmOcr::new(llm.clone(), ProviderConfig::default());
        let output = ocr.process(&Document::new("a.jpg", vec![1_u8])).await.unwrap();
        assert_eq!(output.pages_processed, 1);
        assert_eq!(llm.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pdf_needs_rasterizer() {
        let ocr = VisionLlmOcr::new(Arc::new(PageEcho(AtomicUsize::new(0))), ProviderConfig::default());
        let err = ocr
            .process(&Document::new("a.pdf", b"%PDF".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::NotConfigured("rasterizer")));
    }
}
