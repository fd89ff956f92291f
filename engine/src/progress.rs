//! Per-execution progress reporting and cancellation polling.

use std::time::Instant;

use crate::collaborators::{CancellationSource, ProgressSink};

/// Progress checkpoints of a run.
pub mod checkpoints {
    /// Execution started.
    pub const STARTED: f64 = 5.0;
    /// Schema loaded and document pre-checked.
    pub const PRECHECKED: f64 = 10.0;
    /// Text acquisition started.
    pub const ACQUISITION_STARTED: f64 = 25.0;
    /// Last value reachable during page transcription.
    pub const TRANSCRIPTION_END: f64 = 39.0;
    /// Text acquisition finished.
    pub const ACQUIRED: f64 = 40.0;
    /// All extraction attempts finished.
    pub const EXTRACTED: f64 = 80.0;
    /// Handing the result to the sink.
    pub const SAVING: f64 = 90.0;
    /// Done.
    pub const COMPLETED: f64 = 100.0;
}

/// Context threaded through one execution.
///
/// Keeps the last reported percentage so reports never go backwards, and
/// wraps the caller's cancellation source.
pub struct ExecutionContext<'a> {
    manifest_id: &'a str,
    job_id: Option<&'a str>,
    progress: &'a dyn ProgressSink,
    cancellation: &'a dyn CancellationSource,
    last_reported: Option<u8>,
    started: Instant,
}

impl<'a> ExecutionContext<'a> {
    /// Creates a context for one execution.
    #[must_use]
    pub fn new(
        manifest_id: &'a str,
        job_id: Option<&'a str>,
        progress: &'a dyn ProgressSink,
        cancellation: &'a dyn CancellationSource,
    ) -> Self {
        Self {
            manifest_id,
            job_id,
            progress,
            cancellation,
            last_reported: None,
            started: Instant::now(),
        }
    }

    /// Manifest being processed.
    #[must_use]
    pub const fn manifest_id(&self) -> &'a str {
        self.manifest_id
    }

    /// Job that triggered the execution.
    #[must_use]
    pub const fn job_id(&self) -> Option<&'a str> {
        self.job_id
    }

    /// Highest percentage reported so far.
    #[must_use]
    pub const fn last_reported(&self) -> Option<u8> {
        self.last_reported
    }

    /// Milliseconds since the execution started.
    #[must_use]
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Reports progress, rounded and clamped to `0..=100`.
    ///
    /// Values at or below the last report are dropped.
    pub async fn report(&mut self, percent: f64) {
        let value = normalize(percent);
        if self.last_reported.is_some_and(|last| value <= last) {
            return;
        }
        self.last_reported = Some(value);
        self.progress.report(value).await;
    }

    /// Polls the cancellation source.
    pub async fn is_canceled(&self) -> bool {
        let canceled = self.cancellation.is_cancellation_requested().await;
        if canceled {
            tracing::info!(
                manifest_id = %self.manifest_id,
                job_id = ?self.job_id,
                "Cancellation requested"
            );
        }
        canceled
    }
}

/// Start/end log lines around one stage.
pub(crate) struct StageLog<'a> {
    stage: &'static str,
    manifest_id: &'a str,
    job_id: Option<&'a str>,
    started: Instant,
}

impl<'a> StageLog<'a> {
    pub(crate) fn start(stage: &'static str, ctx: &ExecutionContext<'a>) -> Self {
        tracing::info!(
            event = "start",
            stage,
            manifest_id = %ctx.manifest_id(),
            job_id = ?ctx.job_id(),
        );
        Self {
            stage,
            manifest_id: ctx.manifest_id(),
            job_id: ctx.job_id(),
            started: Instant::now(),
        }
    }

    pub(crate) fn end(self, retry_count: u32, missing_fields: usize) {
        tracing::info!(
            event = "end",
            stage = self.stage,
            manifest_id = %self.manifest_id,
            job_id = ?self.job_id,
            duration_ms = self.started.elapsed().as_millis(),
            retry_count,
            missing_fields,
        );
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn normalize(percent: f64) -> u8 {
    if percent.is_nan() {
        return 0;
    }
    percent.round().clamp(0.0, 100.0) as u8
}

/// Linear interpolation between two checkpoints for `done` of `total` steps.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn interpolate(from: f64, to: f64, done: usize, total: usize) -> f64 {
    if total == 0 {
        return to;
    }
    from + (to - from) * (done.min(total) as f64 / total as f64)
}
