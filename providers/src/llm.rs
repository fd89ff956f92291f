//! [`LlmClient`] over any Rig [`CompletionModel`].
//!
//! System messages become the preamble. User messages keep their order; text
//! parts and page images are sent as Rig user content.

use async_trait::async_trait;
use base64::Engine as _;
use docflow_engine::collaborators::{
    ChatMessage, CompletionOptions, ContentPart, ImageDetail, LlmClient, LlmCompletion, LlmError,
    Role,
};
use docflow_engine::config::ProviderConfig;
use docflow_engine::state::TokenUsage;
use rig::completion::message::{
    AssistantContent, ImageDetail as RigImageDetail, ImageMediaType, Message, UserContent,
};
use rig::completion::CompletionModel;
use rig::OneOrMany;
use serde_json::{json, Value};

/// Name given to the response schema in OpenAI's `response_format`.
const RESPONSE_SCHEMA_NAME: &str = "extraction";

/// Adapts a Rig completion model to the engine's model contract.
#[derive(Clone)]
pub struct RigLlm<M> {
    model: M,
}

impl<M: CompletionModel> RigLlm<M> {
    /// Wraps `model`.
    pub const fn new(model: M) -> Self {
        Self { model }
    }
}

#[async_trait]
impl<M> LlmClient for RigLlm<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        provider: &ProviderConfig,
    ) -> Result<LlmCompletion, LlmError> {
        let (preamble, mut history) = split_messages(messages)?;
        let prompt = history
            .pop()
            .ok_or_else(|| LlmError::Provider("no user message to send".to_string()))?;

        let mut request = self.model.completion_request(prompt).messages(history);
        if let Some(preamble) = preamble {
            request = request.preamble(preamble);
        }
        if let Some(temperature) = provider.temperature {
            request = request.temperature(temperature);
        }
        if let Some(max_tokens) = provider.max_tokens {
            request = request.max_tokens(max_tokens);
        }
        if let Some(params) = response_format(provider, options.response_schema.as_ref()) {
            request = request.additional_params(params);
        }

        tracing::debug!(model = %provider.model_name, "Sending completion request");
        let response = request
            .send()
            .await
            .map_err(|e| LlmError::classify(e.to_string()))?;

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(LlmCompletion {
            content,
            usage: Some(TokenUsage::new(
                response.usage.input_tokens,
                response.usage.output_tokens,
            )),
            model: Some(provider.model_name.clone()),
        })
    }
}

/// Joins system messages into a preamble and converts the rest to Rig messages.
fn split_messages(messages: &[ChatMessage]) -> Result<(Option<String>, Vec<Message>), LlmError> {
    let mut system = Vec::new();
    let mut history = Vec::new();
    for message in messages {
        match message.role {
            Role::System => system.extend(message.content.iter().filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.clone()),
                ContentPart::Image { .. } => None,
            })),
            Role::User => {
                let parts: Vec<UserContent> = message.content.iter().map(user_content).collect();
                let content = OneOrMany::many(parts)
                    .map_err(|_| LlmError::Provider("empty user message".to_string()))?;
                history.push(Message::User { content });
            }
        }
    }
    let preamble = (!system.is_empty()).then(|| system.join("\n\n"));
    Ok((preamble, history))
}

fn user_content(part: &ContentPart) -> UserContent {
    match part {
        ContentPart::Text(text) => UserContent::text(text.clone()),
        ContentPart::Image { image, detail } => UserContent::image_base64(
            base64::engine::general_purpose::STANDARD.encode(&image.bytes),
            media_type(&image.mime_type),
            Some(rig_detail(*detail)),
        ),
    }
}

fn media_type(mime: &str) -> Option<ImageMediaType> {
    match mime {
        "image/png" => Some(ImageMediaType::PNG),
        "image/jpeg" => Some(ImageMediaType::JPEG),
        "image/gif" => Some(ImageMediaType::GIF),
        "image/webp" => Some(ImageMediaType::WEBP),
        _ => None,
    }
}

const fn rig_detail(detail: ImageDetail) -> RigImageDetail {
    match detail {
        ImageDetail::Auto => RigImageDetail::Auto,
        ImageDetail::Low => RigImageDetail::Low,
        ImageDetail::High => RigImageDetail::High,
    }
}

/// OpenAI-style structured output request, when the model honours it.
fn response_format(provider: &ProviderConfig, schema: Option<&Value>) -> Option<Value> {
    let schema = schema?;
    if !provider.supports_structured_output || provider.kind != "openai" {
        return None;
    }
    Some(json!({
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": RESPONSE_SCHEMA_NAME,
                "schema": schema,
                "strict": false
            }
        }
    }))
}
