//! Result and progress sinks for terminal use.

use std::path::PathBuf;

use async_trait::async_trait;
use docflow_engine::collaborators::{ProgressSink, ResultSink};
use docflow_engine::state::WorkflowState;

/// Writes the terminal state as pretty JSON to a file, or stdout.
#[derive(Debug, Clone, Default)]
pub struct JsonSink {
    path: Option<PathBuf>,
}

impl JsonSink {
    /// Writes to `path`, or stdout when `None`.
    #[must_use]
    pub const fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ResultSink for JsonSink {
    async fn commit(
        &self,
        state: &WorkflowState,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let json = serde_json::to_string_pretty(state)?;
        match &self.path {
            Some(path) => {
                tokio::fs::write(path, json).await?;
                tracing::info!(path = %path.display(), status = %state.status, "Result written");
            }
            None => println!("{json}"),
        }
        Ok(())
    }
}

/// Logs progress at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

#[async_trait]
impl ProgressSink for LogProgress {
    async fn report(&self, percent: u8) {
        tracing::info!(percent, "Progress");
    }
}
