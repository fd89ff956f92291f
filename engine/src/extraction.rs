//! Structured extraction calls and per-page transcription.

use serde_json::Value;

use crate::collaborators::{
    ChatMessage, CompletionOptions, LlmClient, LlmCompletion, LlmError, PageImage,
};
use crate::config::ProviderConfig;
use crate::progress::{checkpoints, interpolate, ExecutionContext};
use crate::prompt::AssembledPrompt;
use crate::state::TokenUsage;

const TRANSCRIPTION_INSTRUCTION: &str = "Extract all readable text from this document page. \
Preserve reading order, headings and tables as Markdown. \
Return only the transcription, without commentary.";

/// Output of one structured extraction call.
#[derive(Debug, Clone)]
pub struct AttemptOutput {
    /// Raw model text.
    pub raw: String,
    /// Parsed candidate, or the content error.
    pub parsed: Result<Value, String>,
    /// Usage, zero when not reported.
    pub usage: TokenUsage,
    /// Model that served the call.
    pub model: Option<String>,
}

/// Accumulated per-page transcript.
#[derive(Debug, Clone, Default)]
pub struct PageTranscript {
    /// Pages joined with the page-boundary marker.
    pub markdown: String,
    /// Pages transcribed.
    pub pages: u32,
    /// Summed usage of every page call.
    pub usage: TokenUsage,
}

/// How a transcription run ended.
#[derive(Debug)]
pub enum TranscriptOutcome {
    /// Every page was transcribed.
    Completed(PageTranscript),
    /// Cancellation was observed before a page call; holds the partial transcript.
    Canceled(PageTranscript),
    /// A page call failed after `partial.pages` pages were transcribed.
    Failed {
        /// Pages transcribed before the failing call.
        partial: PageTranscript,
        /// The failing call's error.
        error: LlmError,
    },
}

impl TranscriptOutcome {
    /// Model calls made, including a failed one.
    #[must_use]
    pub const fn calls(&self) -> u32 {
        match self {
            Self::Completed(t) | Self::Canceled(t) => t.pages,
            Self::Failed { partial, .. } => partial.pages + 1,
        }
    }
}

/// Invokes the language model for structured extraction.
pub struct StructuredExtractionStage<'a> {
    llm: &'a dyn LlmClient,
    provider: &'a ProviderConfig,
    page_separator: &'a str,
}

impl<'a> StructuredExtractionStage<'a> {
    /// Creates the stage.
    #[must_use]
    pub fn new(llm: &'a dyn LlmClient, provider: &'a ProviderConfig, page_separator: &'a str) -> Self {
        Self {
            llm,
            provider,
            page_separator,
        }
    }

    /// Sends one extraction request and parses the reply.
    ///
    /// A reply that is not a JSON object is returned as a content error in
    /// [`AttemptOutput::parsed`]; only transport failures are `Err`.
    pub async fn extract(
        &self,
        prompt: &AssembledPrompt,
        images: &[PageImage],
        response_schema: Option<&Value>,
    ) -> Result<AttemptOutput, LlmError> {
        let messages = [
            ChatMessage::system(prompt.system_context.clone()),
            ChatMessage::user(prompt.user_input.clone()).with_images(images),
        ];
        let options = CompletionOptions {
            response_schema: response_schema.cloned(),
        };
        let LlmCompletion {
            content,
            usage,
            model,
        } = self.llm.complete(&messages, &options, self.provider).await?;

        Ok(AttemptOutput {
            parsed: parse_candidate(&content),
            raw: content,
            usage: usage.unwrap_or_default(),
            model,
        })
    }

    /// Transcribes pages one at a time, in ascending page order.
    ///
    /// Cancellation is polled before every page call. Progress moves from
    /// the acquisition checkpoint toward the transcription ceiling after each page.
    /// A failed page call ends the run with the pages transcribed so far.
    pub async fn transcribe_pages(
        &self,
        pages: &[PageImage],
        ctx: &mut ExecutionContext<'_>,
    ) -> TranscriptOutcome {
        let mut ordered: Vec<&PageImage> = pages.iter().collect();
        ordered.sort_by_key(|p| p.page_number);
        let total = ordered.len();

        let mut transcript = PageTranscript::default();
        for (index, page) in ordered.into_iter().enumerate() {
            if ctx.is_canceled().await {
                return TranscriptOutcome::Canceled(transcript);
            }

            let messages = [
                ChatMessage::system(TRANSCRIPTION_INSTRUCTION),
                ChatMessage::user(format!("Page {} of {total}", page.page_number))
                    .with_images([page]),
            ];
            let completion = match self
                .llm
                .complete(&messages, &CompletionOptions::default(), self.provider)
                .await
            {
                Ok(completion) => completion,
                Err(error) => {
                    return TranscriptOutcome::Failed {
                        partial: transcript,
                        error,
                    };
                }
            };

            transcript.usage += completion.usage.unwrap_or_default();
            transcript.pages += 1;
            if !transcript.markdown.is_empty() {
                transcript.markdown.push_str(self.page_separator);
            }
            transcript.markdown.push_str(completion.content.trim());

            tracing::debug!(
                manifest_id = %ctx.manifest_id(),
                page = page.page_number,
                chars = transcript.markdown.len(),
                "Page transcribed"
            );
            ctx.report(interpolate(
                checkpoints::ACQUISITION_STARTED,
                checkpoints::TRANSCRIPTION_END,
                index + 1,
                total,
            ))
            .await;
        }

        TranscriptOutcome::Completed(transcript)
    }
}

/// Parses model output into a JSON object, tolerating a Markdown code fence.
///
/// # Examples
///
/// ```
/// use docflow_engine::extraction::parse_candidate;
///
/// let value = parse_candidate("```json\n{\"total\": 5}\n```").unwrap();
/// assert_eq!(value["total"], 5);
/// assert!(parse_candidate("[1, 2]").is_err());
/// ```
pub fn parse_candidate(raw: &str) -> Result<Value, String> {
    let text = strip_code_fence(raw.trim());
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(format!(
            "Model output is not a JSON object (got {})",
            json_kind(&other)
        )),
        Err(e) => Err(format!("Model output is not valid JSON: {e}")),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        // Single line: skip an optional language tag.
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
