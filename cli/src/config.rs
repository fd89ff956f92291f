//! The `docflow` configuration file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use docflow_engine::config::{ProviderConfig, WorkflowConfig};
use docflow_providers::tesseract::TESSERACT_ID;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Contents of `config.json`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CliConfig {
    /// Retry loop and vision handling.
    pub workflow: WorkflowConfig,
    /// Language model settings. API keys come from the environment.
    pub provider: ProviderConfig,
    /// Text extractor used by OCR strategies.
    pub extractor: ExtractorSettings,
}

/// Which registered extractor to build and with what parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ExtractorSettings {
    /// Registry id, e.g. `tesseract` or `vision-llm`.
    pub id: String,
    /// Parameters validated against the extractor's declared schema.
    /// A `pricing` entry configures its cost.
    #[schemars(with = "std::collections::BTreeMap<String, Value>")]
    pub params: Map<String, Value>,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            id: TESSERACT_ID.to_string(),
            params: Map::new(),
        }
    }
}

/// `<config_dir>/docflow/config.json`.
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("docflow").join("config.json"))
}

impl CliConfig {
    /// Loads `explicit`, or the default file when present, or defaults.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_path().filter(|p| p.exists()) {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }
}
