//! PDF rasterization through poppler's `pdftoppm`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docflow_engine::collaborators::{AcquisitionError, Document, PageImage, Rasterizer};
use tempfile::TempDir;

use crate::discovery::{discover_binary, Tool};
use crate::errors::ProviderError;
use crate::process::{run_tool, DEFAULT_TOOL_TIMEOUT};

/// Default rendering resolution.
pub const DEFAULT_DPI: u32 = 300;

const PAGE_PREFIX: &str = "page";

/// Renders every PDF page to a PNG image.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    binary: PathBuf,
    dpi: u32,
    timeout: Duration,
}

impl PdftoppmRasterizer {
    /// Creates a rasterizer around an explicit binary.
    #[must_use]
    pub const fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            dpi: DEFAULT_DPI,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Discovers `pdftoppm` and creates a rasterizer around it.
    pub fn discover(explicit_path: Option<PathBuf>) -> Result<Self, ProviderError> {
        discover_binary(Tool::Pdftoppm, explicit_path).map(Self::new)
    }

    /// Sets the rendering resolution.
    #[must_use]
    pub const fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    /// Sets the per-document timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Renders `pdf` into `dir` and returns the page files in page order.
    pub async fn render_to_dir(&self, pdf: &Path, dir: &Path) -> Result<Vec<(u32, PathBuf)>, ProviderError> {
        let dpi = self.dpi.to_string();
        let prefix = dir.join(PAGE_PREFIX);
        let args = [
            OsStr::new("-png"),
            OsStr::new("-r"),
            OsStr::new(&dpi),
            pdf.as_os_str(),
            prefix.as_os_str(),
        ];
        run_tool(&self.binary, &args, self.timeout).await?;

        let pages = collect_pages(dir).await?;
        if pages.is_empty() {
            return Err(ProviderError::EmptyOutput(format!(
                "pdftoppm produced no pages for {}",
                pdf.display()
            )));
        }
        Ok(pages)
    }

    async fn rasterize_inner(&self, document: &Document) -> Result<Vec<PageImage>, ProviderError> {
        let dir = TempDir::new()?;
        let input = dir.path().join("input.pdf");
        tokio::fs::write(&input, &document.bytes).await?;

        let mut images = Vec::new();
        for (page_number, path) in self.render_to_dir(&input, dir.path()).await? {
            let bytes = tokio::fs::read(&path).await?;
            images.push(PageImage {
                page_number,
                bytes: Arc::from(bytes),
                mime_type: "image/png".to_string(),
            });
        }
        tracing::debug!(
            file = %document.file_name,
            pages = images.len(),
            dpi = self.dpi,
            "Rasterized document"
        );
        Ok(images)
    }
}

#[async_trait]
impl Rasterizer for PdftoppmRasterizer {
    async fn rasterize(&self, document: &Document) -> Result<Vec<PageImage>, AcquisitionError> {
        self.rasterize_inner(document)
            .await
            .map_err(ProviderError::into_rasterize)
    }
}

/// Finds `page-N.png` files (any zero padding) sorted by page number.
async fn collect_pages(dir: &Path) -> Result<Vec<(u32, PathBuf)>, ProviderError> {
    let mut pages = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(number) = page_number(&path) {
            pages.push((number, path));
        }
    }
    pages.sort_by_key(|(n, _)| *n);
    Ok(pages)
}

fn page_number(path: &Path) -> Option<u32> {
    if path.extension().and_then(OsStr::to_str) != Some("png") {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(PAGE_PREFIX)?
        .strip_prefix('-')?
        .parse()
        .ok()
}
