use docflow_engine::collaborators::AcquisitionError;
use thiserror::Error;

/// Errors raised by the concrete collaborators.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A required executable could not be located.
    #[error("{tool} executable not found: {reason}")]
    ExecutableNotFound {
        /// Tool name.
        tool: &'static str,
        /// Why discovery failed.
        reason: String,
    },

    /// Spawning or talking to a child process failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The tool ran longer than allowed and was killed.
    #[error("{tool} timed out after {timeout:?}")]
    Timeout {
        /// Tool name.
        tool: String,
        /// Configured limit.
        timeout: std::time::Duration,
    },

    /// The tool exited with a non-zero status.
    #[error("{tool} exited with status {exit_code}\nSTDOUT: {stdout}\nSTDERR: {stderr}")]
    NonZeroExit {
        /// Tool name.
        tool: String,
        /// Exit code, `-1` when killed by a signal.
        exit_code: i32,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The tool succeeded but produced nothing usable.
    #[error("{0}")]
    EmptyOutput(String),

    /// No extractor is registered under this id.
    #[error("Unknown extractor: {0}")]
    UnknownExtractor(String),

    /// Extractor parameters do not match the declared schema.
    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    /// The extractor needs a collaborator that was not supplied.
    #[error("Extractor {extractor} requires {requirement}")]
    MissingDependency {
        /// Extractor id.
        extractor: String,
        /// What is missing.
        requirement: &'static str,
    },
}

impl ProviderError {
    /// Converts into the rasterization flavour of [`AcquisitionError`].
    #[must_use]
    pub fn into_rasterize(self) -> AcquisitionError {
        AcquisitionError::Rasterize(self.to_string())
    }

    /// Converts into the OCR flavour of [`AcquisitionError`].
    #[must_use]
    pub fn into_ocr(self) -> AcquisitionError {
        AcquisitionError::Ocr(self.to_string())
    }
}
