//! Concrete collaborators for `docflow-engine`.
//!
//! [`TesseractOcr`] and [`PdftoppmRasterizer`] wrap the command-line tools,
//! found on `PATH` or through `DOCFLOW_TESSERACT_BIN` / `DOCFLOW_PDFTOPPM_BIN`.
//! [`VisionLlmOcr`] transcribes page images with a vision model, and
//! [`RigLlm`] adapts any Rig completion model to the engine. Extractors are
//! built by id through the [`ExtractorRegistry`].

/// Locating external tools.
pub mod discovery;
/// Error types for the provider crate.
pub mod errors;
/// Rig-backed model client.
pub mod llm;
/// Extractor parameter declarations.
pub mod params;
/// PDF rasterization.
pub mod pdftoppm;
/// Subprocess runner.
pub mod process;
/// Extractor registry.
pub mod registry;
/// Tesseract OCR.
pub mod tesseract;
/// Vision model transcription.
pub mod vision;

pub use discovery::{probe_tools, Tool, ToolStatus};
pub use errors::ProviderError;
pub use llm::RigLlm;
pub use params::{validate_params, ParamSpec, ParamType};
pub use pdftoppm::PdftoppmRasterizer;
pub use registry::{ExtractorCategory, ExtractorContext, ExtractorMetadata, ExtractorRegistry};
pub use tesseract::TesseractOcr;
pub use vision::VisionLlmOcr;
