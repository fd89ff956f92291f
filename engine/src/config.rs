//! Configuration for workflow execution and LLM providers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cost::PricingConfig;

/// Default page-boundary marker used when joining per-page transcripts.
pub const DEFAULT_PAGE_SEPARATOR: &str = "\n\n---\n\n";

/// How vision strategies feed page images to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VisionMode {
    /// All page images go into the structured extraction request.
    #[default]
    SinglePass,
    /// Multi-page PDFs are transcribed page by page first; the transcript
    /// then drives a text-only structured extraction.
    PerPage,
}

/// Configuration for the extraction retry loop.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Maximum number of re-extraction attempts after the first one (default: 3).
    pub max_retries: u32,
    /// When false, the first invalid verdict is terminal (default: true).
    pub enable_extraction_retry: bool,
    /// Base pause between validation retries in milliseconds, doubled per
    /// retry (default: 0, no pause).
    pub retry_delay_base_ms: u64,
    /// Page image handling for vision strategies.
    pub vision_mode: VisionMode,
    /// Marker placed between pages of an accumulated transcript.
    pub page_separator: String,
    /// Request schema-constrained output from providers that support it (default: true).
    pub use_structured_output: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            enable_extraction_retry: true,
            retry_delay_base_ms: 0,
            vision_mode: VisionMode::SinglePass,
            page_separator: DEFAULT_PAGE_SEPARATOR.to_string(),
            use_structured_output: true,
        }
    }
}

impl WorkflowConfig {
    /// Set the maximum number of retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Enable or disable the validation retry loop.
    #[must_use]
    pub const fn with_extraction_retry(mut self, enabled: bool) -> Self {
        self.enable_extraction_retry = enabled;
        self
    }

    /// Set the base pause between retries.
    #[must_use]
    pub const fn with_retry_delay_base_ms(mut self, millis: u64) -> Self {
        self.retry_delay_base_ms = millis;
        self
    }

    /// Set the vision page handling mode.
    #[must_use]
    pub const fn with_vision_mode(mut self, mode: VisionMode) -> Self {
        self.vision_mode = mode;
        self
    }

    /// Set the transcript page-boundary marker.
    #[must_use]
    pub fn with_page_separator(mut self, separator: impl Into<String>) -> Self {
        self.page_separator = separator.into();
        self
    }

    /// Enable or disable schema-constrained output requests.
    #[must_use]
    pub const fn with_structured_output(mut self, enabled: bool) -> Self {
        self.use_structured_output = enabled;
        self
    }

    /// Pause before the given retry (1-indexed): `base * 2^(retry - 1)`.
    #[must_use]
    pub fn retry_delay(&self, retry: u32) -> std::time::Duration {
        if self.retry_delay_base_ms == 0 || retry == 0 {
            return std::time::Duration::ZERO;
        }
        let factor = 1_u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
        std::time::Duration::from_millis(self.retry_delay_base_ms.saturating_mul(factor))
    }
}

/// Settings for the language model used by a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider kind, e.g. `openai`.
    pub kind: String,
    /// Model identifier passed to the provider.
    pub model_name: String,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Output token ceiling.
    pub max_tokens: Option<u64>,
    /// Whether the model accepts image content.
    pub supports_vision: bool,
    /// Whether the model honours a JSON Schema response format.
    pub supports_structured_output: bool,
    /// How usage converts to money.
    pub pricing: Option<PricingConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "openai".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            temperature: Some(0.0),
            max_tokens: None,
            supports_vision: true,
            supports_structured_output: false,
            pricing: None,
        }
    }
}

impl ProviderConfig {
    /// Capabilities consulted by strategy resolution.
    #[must_use]
    pub const fn capabilities(&self) -> crate::strategy::ProviderCapabilities {
        crate::strategy::ProviderCapabilities {
            supports_vision: self.supports_vision,
            supports_structured_output: self.supports_structured_output,
        }
    }
}
