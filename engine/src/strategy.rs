//! Extraction strategy selection.
//!
//! A strategy decides which acquisition paths run for a document: OCR,
//! page images for a vision model, or both. Resolution takes the strategy
//! declared on the schema, the document's file type, and what the provider
//! can do. The only substitution ever made is `VisionOnly` to `OcrFirst`
//! for a provider without vision support, and it is always reported.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How text and images are acquired for structured extraction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionStrategy {
    /// OCR the document and extract from its text.
    #[default]
    OcrFirst,
    /// Send page images to a vision model; no OCR.
    VisionOnly,
    /// Page images are primary; OCR text is advisory context.
    VisionFirst,
    /// Page images and OCR text are both primary inputs.
    TwoStage,
}

impl ExtractionStrategy {
    /// Whether OCR is invoked under this strategy.
    #[must_use]
    pub const fn uses_ocr(self) -> bool {
        !matches!(self, Self::VisionOnly)
    }

    /// Whether page images are produced under this strategy.
    #[must_use]
    pub const fn uses_vision(self) -> bool {
        !matches!(self, Self::OcrFirst)
    }

    /// Whether an OCR failure ends the attempt.
    ///
    /// Under `VisionFirst` OCR output is advisory only, so losing it is not fatal.
    #[must_use]
    pub const fn requires_ocr(self) -> bool {
        matches!(self, Self::OcrFirst | Self::TwoStage)
    }

    /// Stable identifier used in schemas and configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OcrFirst => "OCR_FIRST",
            Self::VisionOnly => "VISION_ONLY",
            Self::VisionFirst => "VISION_FIRST",
            Self::TwoStage => "TWO_STAGE",
        }
    }
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "OCR_FIRST" => Ok(Self::OcrFirst),
            "VISION_ONLY" => Ok(Self::VisionOnly),
            "VISION_FIRST" => Ok(Self::VisionFirst),
            "TWO_STAGE" => Ok(Self::TwoStage),
            other => Err(format!("Unknown extraction strategy: {other}")),
        }
    }
}

/// Coarse document kind used for strategy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// A PDF that must be rasterized for vision input.
    Pdf,
    /// A raster image usable directly as vision input.
    Image,
}

impl FileType {
    /// Classifies a file extension (without the dot, any case).
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => Some(Self::Image),
            _ => None,
        }
    }
}

/// What the configured model can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// Accepts image content.
    pub supports_vision: bool,
    /// Honours a JSON Schema response format.
    pub supports_structured_output: bool,
}

/// Outcome of strategy resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyResolution {
    /// Strategy that will actually run.
    pub strategy: ExtractionStrategy,
    /// Strategy declared by the caller, if any.
    pub requested: Option<ExtractionStrategy>,
    /// True when a vision-incapable provider forced `OcrFirst`.
    pub fallback: bool,
}

/// Picks the strategy for one document.
///
/// # Examples
///
/// ```
/// use docflow_engine::strategy::{resolve_strategy, ExtractionStrategy, FileType, ProviderCapabilities};
///
/// let caps = ProviderCapabilities { supports_vision: false, ..Default::default() };
/// let resolved = resolve_strategy(Some(ExtractionStrategy::VisionOnly), FileType::Pdf, caps);
/// assert_eq!(resolved.strategy, ExtractionStrategy::OcrFirst);
/// assert!(resolved.fallback);
/// ```
#[must_use]
pub fn resolve_strategy(
    requested: Option<ExtractionStrategy>,
    file_type: FileType,
    capabilities: ProviderCapabilities,
) -> StrategyResolution {
    let Some(declared) = requested else {
        let strategy = if file_type == FileType::Image && capabilities.supports_vision {
            ExtractionStrategy::VisionOnly
        } else {
            ExtractionStrategy::OcrFirst
        };
        return StrategyResolution {
            strategy,
            requested: None,
            fallback: false,
        };
    };

    if declared == ExtractionStrategy::VisionOnly && !capabilities.supports_vision {
        return StrategyResolution {
            strategy: ExtractionStrategy::OcrFirst,
            requested: Some(declared),
            fallback: true,
        };
    }

    StrategyResolution {
        strategy: declared,
        requested: Some(declared),
        fallback: false,
    }
}
