//! Text and image acquisition per extraction strategy.

use std::sync::Arc;

use crate::collaborators::{AcquisitionError, Document, OcrEngine, OcrOutput, PageImage, Rasterizer};
use crate::strategy::{ExtractionStrategy, FileType};

/// What acquisition produced for the extraction stage.
#[derive(Debug, Clone, Default)]
pub struct AcquiredInput {
    /// OCR output, when OCR ran and succeeded.
    pub ocr: Option<OcrOutput>,
    /// Page images, when the strategy uses vision.
    pub pages: Vec<PageImage>,
    /// Advisory OCR failure that did not end the attempt.
    pub ocr_warning: Option<String>,
}

/// Runs exactly the acquisition calls a strategy calls for.
///
/// | Strategy      | OCR                 | Page images          |
/// |---------------|---------------------|----------------------|
/// | `OcrFirst`    | required            | never                |
/// | `VisionOnly`  | never               | required             |
/// | `VisionFirst` | advisory            | required             |
/// | `TwoStage`    | required            | required             |
pub struct TextAcquisitionStage<'a> {
    ocr: Option<&'a dyn OcrEngine>,
    rasterizer: Option<&'a dyn Rasterizer>,
}

impl<'a> TextAcquisitionStage<'a> {
    /// Creates the stage over whichever collaborators are configured.
    #[must_use]
    pub const fn new(ocr: Option<&'a dyn OcrEngine>, rasterizer: Option<&'a dyn Rasterizer>) -> Self {
        Self { ocr, rasterizer }
    }

    /// Acquires input for `strategy`.
    ///
    /// `skip_ocr` suppresses the OCR call when the caller already supplies text.
    pub async fn acquire(
        &self,
        document: &Document,
        file_type: FileType,
        strategy: ExtractionStrategy,
        skip_ocr: bool,
    ) -> Result<AcquiredInput, AcquisitionError> {
        let mut input = AcquiredInput::default();

        if strategy.uses_vision() {
            input.pages = self.page_images(document, file_type).await?;
        }

        if strategy.uses_ocr() && !skip_ocr {
            match self.run_ocr(document).await {
                Ok(output) => input.ocr = Some(output),
                Err(e) if !strategy.requires_ocr() => {
                    tracing::warn!(
                        strategy = %strategy,
                        error = %e,
                        "Advisory OCR failed; continuing with page images only"
                    );
                    input.ocr_warning = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(input)
    }

    async fn run_ocr(&self, document: &Document) -> Result<OcrOutput, AcquisitionError> {
        let ocr = self.ocr.ok_or(AcquisitionError::NotConfigured("OCR"))?;
        ocr.process(document).await
    }

    async fn page_images(
        &self,
        document: &Document,
        file_type: FileType,
    ) -> Result<Vec<PageImage>, AcquisitionError> {
        match file_type {
            FileType::Image => Ok(vec![PageImage {
                page_number: 1,
                bytes: Arc::clone(&document.bytes),
                mime_type: document.mime_type().to_string(),
            }]),
            FileType::Pdf => {
                let rasterizer = self
                    .rasterizer
                    .ok_or(AcquisitionError::NotConfigured("rasterizer"))?;
                let mut pages = rasterizer.rasterize(document).await?;
                if pages.is_empty() {
                    return Err(AcquisitionError::Rasterize(format!(
                        "{} produced no pages",
                        document.file_name
                    )));
                }
                pages.sort_by_key(|p| p.page_number);
                Ok(pages)
            }
        }
    }
}
