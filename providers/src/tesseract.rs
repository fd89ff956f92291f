//! Tesseract OCR through the command-line binary.
//!
//! Images are recognized directly. PDFs are rasterized with pdftoppm first
//! and each page is recognized separately.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use docflow_engine::collaborators::{AcquisitionError, Document, OcrEngine, OcrOutput};
use docflow_engine::cost::PricingConfig;
use docflow_engine::strategy::FileType;
use tempfile::TempDir;

use crate::discovery::{discover_binary, Tool};
use crate::errors::ProviderError;
use crate::pdftoppm::PdftoppmRasterizer;
use crate::process::{run_tool, DEFAULT_TOOL_TIMEOUT};

/// Registry id.
pub const TESSERACT_ID: &str = "tesseract";

/// Separator between pages in the joined text.
const PAGE_BREAK: &str = "\x0c";

/// OCR engine backed by the `tesseract` binary.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    binary: PathBuf,
    rasterizer: Option<PdftoppmRasterizer>,
    language: String,
    page_segmentation_mode: Option<u32>,
    timeout: Duration,
    pricing: Option<PricingConfig>,
}

impl TesseractOcr {
    /// Creates an engine around an explicit binary, recognizing English.
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            rasterizer: None,
            language: "eng".to_string(),
            page_segmentation_mode: None,
            timeout: DEFAULT_TOOL_TIMEOUT,
            pricing: None,
        }
    }

    /// Discovers `tesseract` and creates an engine around it.
    pub fn discover(explicit_path: Option<PathBuf>) -> Result<Self, ProviderError> {
        discover_binary(Tool::Tesseract, explicit_path).map(Self::new)
    }

    /// Sets the rasterizer used for PDFs.
    #[must_use]
    pub fn with_rasterizer(mut self, rasterizer: PdftoppmRasterizer) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    /// Sets the tesseract language pack, e.g. `eng+deu`.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Sets tesseract's `--psm` page segmentation mode.
    #[must_use]
    pub const fn with_page_segmentation_mode(mut self, psm: u32) -> Self {
        self.page_segmentation_mode = Some(psm);
        self
    }

    /// Sets the per-page timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the pricing of this extractor.
    #[must_use]
    pub fn with_pricing(mut self, pricing: PricingConfig) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Recognizes one image file.
    pub async fn recognize(&self, image: &Path) -> Result<String, ProviderError> {
        let psm = self.page_segmentation_mode.map(|p| p.to_string());
        let mut args = vec![
            image.as_os_str(),
            OsStr::new("stdout"),
            OsStr::new("-l"),
            OsStr::new(&self.language),
        ];
        if let Some(psm) = &psm {
            args.push(OsStr::new("--psm"));
            args.push(OsStr::new(psm));
        }
        let output = run_tool(&self.binary, &args, self.timeout).await?;
        Ok(output.stdout.trim_end().to_string())
    }

    async fn process_inner(&self, document: &Document) -> Result<OcrOutput, ProviderError> {
        let dir = TempDir::new()?;
        let extension = document.extension().unwrap_or_default();
        let input = dir.path().join(format!("input.{extension}"));
        tokio::fs::write(&input, &document.bytes).await?;

        let images: Vec<PathBuf> = match document.file_type() {
            Some(FileType::Pdf) => {
                let rasterizer =
                    self.rasterizer
                        .as_ref()
                        .ok_or_else(|| ProviderError::MissingDependency {
                            extractor: TESSERACT_ID.to_string(),
                            requirement: "pdftoppm for PDF input",
                        })?;
                rasterizer
                    .render_to_dir(&input, dir.path())
                    .await?
                    .into_iter()
                    .map(|(_, path)| path)
                    .collect()
            }
            _ => vec![input],
        };

        let mut pages = Vec::with_capacity(images.len());
        for image in &images {
            pages.push(self.recognize(image).await?);
        }
        let text = pages.join(PAGE_BREAK);
        tracing::debug!(
            file = %document.file_name,
            pages = pages.len(),
            chars = text.len(),
            language = %self.language,
            "Tesseract finished"
        );

        Ok(OcrOutput {
            markdown: text.clone(),
            text,
            structural_result: None,
            pages_processed: u32::try_from(pages.len()).unwrap_or(u32::MAX),
            usage: None,
            model: None,
        })
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    fn id(&self) -> &str {
        TESSERACT_ID
    }

    fn pricing(&self) -> Option<&PricingConfig> {
        self.pricing.as_ref()
    }

    async fn process(&self, document: &Document) -> Result<OcrOutput, AcquisitionError> {
        self.process_inner(document)
            .await
            .map_err(ProviderError::into_ocr)
    }
}
