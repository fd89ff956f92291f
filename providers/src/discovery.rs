//! Discovery of the external tools the subprocess collaborators drive.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() {
//! for status in docflow_providers::discovery::probe_tools().await {
//!     if let Some(ref path) = status.path {
//!         println!("{}: {} ({})", status.tool, path.display(),
//!             status.version.as_deref().unwrap_or("unknown"));
//!     }
//! }
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use which::which;

use crate::errors::ProviderError;

/// External tools used by the bundled collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    /// Tesseract OCR.
    Tesseract,
    /// Poppler's PDF rasterizer.
    Pdftoppm,
}

impl Tool {
    /// Every known tool.
    pub const ALL: [Self; 2] = [Self::Tesseract, Self::Pdftoppm];

    /// Executable name looked up on `$PATH`.
    #[must_use]
    pub const fn binary_name(self) -> &'static str {
        match self {
            Self::Tesseract => "tesseract",
            Self::Pdftoppm => "pdftoppm",
        }
    }

    /// Environment variable that overrides the binary path.
    #[must_use]
    pub const fn env_var(self) -> &'static str {
        match self {
            Self::Tesseract => "DOCFLOW_TESSERACT_BIN",
            Self::Pdftoppm => "DOCFLOW_PDFTOPPM_BIN",
        }
    }

    /// Flag that prints the tool's version.
    const fn version_flag(self) -> &'static str {
        match self {
            Self::Tesseract => "--version",
            Self::Pdftoppm => "-v",
        }
    }

    /// Install hint shown when the tool is missing.
    #[must_use]
    pub const fn install_hint(self) -> &'static str {
        match self {
            Self::Tesseract => "install tesseract-ocr",
            Self::Pdftoppm => "install poppler-utils",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Locates a tool's executable.
///
/// Resolution order:
/// 1. `explicit_path` if provided and the file exists.
/// 2. The path in the tool's environment variable.
/// 3. The binary name resolved via `$PATH`.
pub fn discover_binary(tool: Tool, explicit_path: Option<PathBuf>) -> Result<PathBuf, ProviderError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path);
        }
        return Err(ProviderError::ExecutableNotFound {
            tool: tool.binary_name(),
            reason: format!("Explicit path does not exist: {}", path.display()),
        });
    }

    if let Ok(path_str) = std::env::var(tool.env_var()) {
        let path = PathBuf::from(path_str);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            tool = %tool,
            path = %path.display(),
            "{} points to a missing file; falling back to PATH",
            tool.env_var()
        );
    }

    which(tool.binary_name()).map_err(|e| ProviderError::ExecutableNotFound {
        tool: tool.binary_name(),
        reason: format!("{e} ({})", tool.install_hint()),
    })
}

/// Status of a single tool after discovery.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    /// Which tool this status describes.
    pub tool: Tool,
    /// Resolved path, or `None` if not found.
    pub path: Option<PathBuf>,
    /// First line of the tool's version output, if retrievable.
    pub version: Option<String>,
}

impl ToolStatus {
    /// Returns `true` when the tool was found on this system.
    #[must_use]
    pub const fn is_installed(&self) -> bool {
        self.path.is_some()
    }
}

/// Discovers every tool and reports its installation status.
///
/// Each tool is probed independently; a missing tesseract does not prevent
/// pdftoppm from being reported.
pub async fn probe_tools() -> Vec<ToolStatus> {
    let mut statuses = Vec::new();
    for tool in Tool::ALL {
        let path = discover_binary(tool, None).ok();
        let version = match &path {
            Some(p) => get_version(tool, p).await,
            None => None,
        };
        statuses.push(ToolStatus { tool, path, version });
    }
    statuses
}

/// Runs the version flag and returns the first non-empty line.
///
/// pdftoppm prints its version on stderr, so both streams are checked.
async fn get_version(tool: Tool, binary: &Path) -> Option<String> {
    let output = tokio::process::Command::new(binary)
        .arg(tool.version_flag())
        .output()
        .await
        .ok()?;

    let version = [&output.stdout, &output.stderr]
        .into_iter()
        .filter_map(|bytes| {
            String::from_utf8_lossy(bytes)
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(ToString::to_string)
        })
        .next();
    version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("tesseract");
        std::fs::write(&present, b"").unwrap();

        assert_eq!(
            discover_binary(Tool::Tesseract, Some(present.clone())).unwrap(),
            present
        );

        let err = discover_binary(Tool::Pdftoppm, Some(dir.path().join("missing"))).unwrap_err();
        assert!(matches!(err, ProviderError::ExecutableNotFound { tool: "pdftoppm", .. }));
        assert!(err.to_string().contains("Explicit path does not exist"));
    }

    #[test]
    fn test_tool_metadata() {
        assert_eq!(Tool::Tesseract.env_var(), "DOCFLOW_TESSERACT_BIN");
        assert_eq!(Tool::Pdftoppm.to_string(), "pdftoppm");
        assert_eq!(
            serde_json::to_value(Tool::Pdftoppm).unwrap(),
            serde_json::json!("pdftoppm")
        );
    }
}
