//! Adapter for OpenAI-compatible chat-completions backends.

use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::sse::SseDecoder;
use crate::{
    BoxedTokenStream, Completion, CompletionRequest, Message, ModelConfig, ModelPricing,
    ModelProvider, ProviderBinder, ProviderError, ProviderFuture, ProviderKind, ResolvedAccess,
    Role, SecretString, StopCause, StreamingCall, UsageDelta, UsageHandle, transport_failure,
};

const KIND: ProviderKind = ProviderKind::OpenAi;

#[derive(Clone)]
pub struct OpenAiCompatBinder {
    transport: Arc<dyn OpenAiCompatTransport>,
}

impl OpenAiCompatBinder {
    pub fn new(transport: Arc<dyn OpenAiCompatTransport>) -> Self {
        Self { transport }
    }

    pub fn over_http(client: Client) -> Self {
        Self::new(Arc::new(OpenAiCompatHttpTransport::new(client)))
    }
}

impl ProviderBinder for OpenAiCompatBinder {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn bind(&self, access: ResolvedAccess, config: ModelConfig) -> Arc<dyn ModelProvider> {
        Arc::new(OpenAiCompatAdapter::bind(
            access,
            config,
            Arc::clone(&self.transport),
        ))
    }
}

pub struct OpenAiCompatAdapter {
    api_key: SecretString,
    config: ModelConfig,
    transport: Arc<dyn OpenAiCompatTransport>,
}

impl OpenAiCompatAdapter {
    /// Binds resolved credentials to a model configuration. A model name on
    /// the resolved key overrides the configured one.
    pub fn bind(
        access: ResolvedAccess,
        mut config: ModelConfig,
        transport: Arc<dyn OpenAiCompatTransport>,
    ) -> Self {
        if !access.model.trim().is_empty() {
            config.model = access.model;
        }

        Self {
            api_key: access.api_key,
            config,
            transport,
        }
    }

    fn wire_request(&self, request: &CompletionRequest, stream: bool) -> ChatWireRequest {
        ChatWireRequest {
            model: self.config.model.clone(),
            messages: request.messages.iter().map(wire_message).collect(),
            temperature: request.temperature.or(self.config.temperature),
            max_tokens: self.config.clamp_output(request.max_output_tokens),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

impl ModelProvider for OpenAiCompatAdapter {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> ProviderFuture<'static, Result<Completion, ProviderError>> {
        let prepared = request.validate().map(|_| self.wire_request(&request, false));
        let transport = Arc::clone(&self.transport);
        let api_key = self.api_key.expose().to_string();
        let model = self.config.model.clone();
        let pricing = self.config.pricing;

        Box::pin(async move {
            let wire = prepared?;
            let response = transport.complete(wire, api_key).await?;
            let choice = response.choices.into_iter().next().ok_or_else(|| {
                ProviderError::decode(KIND, "response did not include any choices")
            })?;

            let usage = response
                .usage
                .map(|usage| delta_from_usage(&pricing, &usage))
                .unwrap_or_default();

            Ok(Completion {
                provider: KIND,
                model: if response.model.is_empty() {
                    model
                } else {
                    response.model
                },
                text: choice.message.content.unwrap_or_default(),
                stop: parse_stop(choice.finish_reason.as_deref()),
                usage,
            })
        })
    }

    fn stream(
        &self,
        request: CompletionRequest,
    ) -> ProviderFuture<'static, Result<StreamingCall, ProviderError>> {
        let prepared = request.validate().map(|_| self.wire_request(&request, true));
        let transport = Arc::clone(&self.transport);
        let api_key = self.api_key.expose().to_string();
        let pricing = self.config.pricing;

        Box::pin(async move {
            let wire = prepared?;
            let (mut reporter, usage) = UsageHandle::channel();

            let tokens = stream! {
                let mut events = match transport.stream(wire, api_key).await {
                    Ok(events) => events,
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                };

                while let Some(event) = events.next().await {
                    match event {
                        Ok(ChatWireEvent::TextDelta(delta)) => yield Ok(delta),
                        Ok(ChatWireEvent::Usage(wire_usage)) => {
                            reporter.report(delta_from_usage(&pricing, &wire_usage));
                        }
                        Ok(ChatWireEvent::Finish(_)) => {}
                        Err(error) => {
                            yield Err(error);
                            return;
                        }
                    }
                }
            };

            Ok(StreamingCall {
                tokens: Box::pin(tokens) as BoxedTokenStream,
                usage,
            })
        })
    }
}

/// Wire-level seam so adapter behavior is testable without a network.
pub trait OpenAiCompatTransport: Send + Sync {
    fn complete(
        &self,
        request: ChatWireRequest,
        api_key: String,
    ) -> ProviderFuture<'static, Result<ChatWireResponse, ProviderError>>;

    fn stream(
        &self,
        request: ChatWireRequest,
        api_key: String,
    ) -> ProviderFuture<'static, Result<BoxedChatWireEvents, ProviderError>>;
}

pub type BoxedChatWireEvents =
    Pin<Box<dyn Stream<Item = Result<ChatWireEvent, ProviderError>> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatWireEvent {
    TextDelta(String),
    Finish(String),
    Usage(ChatWireUsage),
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatHttpTransport {
    client: Client,
    base_url: String,
}

impl OpenAiCompatHttpTransport {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl OpenAiCompatTransport for OpenAiCompatHttpTransport {
    fn complete(
        &self,
        request: ChatWireRequest,
        api_key: String,
    ) -> ProviderFuture<'static, Result<ChatWireResponse, ProviderError>> {
        let client = self.client.clone();
        let url = self.endpoint("chat/completions");

        Box::pin(async move {
            let response = client
                .post(url)
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await
                .map_err(|error| transport_failure(KIND, &error))?;

            if !response.status().is_success() {
                return Err(parse_error(response).await);
            }

            response
                .json::<ChatWireResponse>()
                .await
                .map_err(|error| ProviderError::decode(KIND, error.to_string()))
        })
    }

    fn stream(
        &self,
        request: ChatWireRequest,
        api_key: String,
    ) -> ProviderFuture<'static, Result<BoxedChatWireEvents, ProviderError>> {
        let client = self.client.clone();
        let url = self.endpoint("chat/completions");

        Box::pin(async move {
            let response = client
                .post(url)
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await
                .map_err(|error| transport_failure(KIND, &error))?;

            if !response.status().is_success() {
                return Err(parse_error(response).await);
            }

            let events = stream! {
                let mut decoder = SseDecoder::new();
                let mut bytes = response.bytes_stream();

                while let Some(item) = bytes.next().await {
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(error) => {
                            yield Err(transport_failure(KIND, &error));
                            return;
                        }
                    };

                    for message in decoder.push(&chunk) {
                        if message.data == "[DONE]" {
                            return;
                        }

                        match decode_stream_payload(&message.data) {
                            Ok(decoded) => {
                                for event in decoded {
                                    yield Ok(event);
                                }
                            }
                            Err(error) => {
                                yield Err(error);
                                return;
                            }
                        }
                    }
                }

                if let Some(message) = decoder.finish()
                    && message.data != "[DONE]"
                {
                    match decode_stream_payload(&message.data) {
                        Ok(decoded) => {
                            for event in decoded {
                                yield Ok(event);
                            }
                        }
                        Err(error) => yield Err(error),
                    }
                }
            };

            Ok(Box::pin(events) as BoxedChatWireEvents)
        })
    }
}

fn decode_stream_payload(data: &str) -> Result<Vec<ChatWireEvent>, ProviderError> {
    let chunk: ChatWireStreamChunk = serde_json::from_str(data)
        .map_err(|error| ProviderError::decode(KIND, error.to_string()))?;

    let mut events = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            events.push(ChatWireEvent::TextDelta(content));
        }

        if let Some(finish_reason) = choice.finish_reason {
            events.push(ChatWireEvent::Finish(finish_reason));
        }
    }

    if let Some(usage) = chunk.usage {
        events.push(ChatWireEvent::Usage(usage));
    }

    Ok(events)
}

async fn parse_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = extract_error_message(&body)
        .unwrap_or_else(|| format!("request failed with status {status}"));

    ProviderError::http(KIND, status, message)
}

fn extract_error_message(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ChatWireErrorEnvelope>(body).ok()?;
    Some(parsed.error.message)
}

fn parse_stop(finish_reason: Option<&str>) -> StopCause {
    match finish_reason {
        Some("stop") => StopCause::EndTurn,
        Some("length") => StopCause::MaxOutput,
        Some("cancelled") => StopCause::Cancelled,
        _ => StopCause::Other,
    }
}

fn delta_from_usage(pricing: &ModelPricing, usage: &ChatWireUsage) -> UsageDelta {
    let cached = usage
        .prompt_tokens_details
        .as_ref()
        .and_then(|details| details.cached_tokens)
        .unwrap_or(0);
    let billable_prompt = usage.prompt_tokens.saturating_sub(cached);

    let mut delta = UsageDelta {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cost: pricing.price(billable_prompt, usage.completion_tokens),
        image_tokens: None,
        cache_prompt_tokens: None,
        cache_cost: None,
    };

    if cached > 0 {
        delta = delta.with_cached_prompt(cached, pricing.price_cached(cached));
    }

    delta
}

fn wire_message(message: &Message) -> ChatWireMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    let content = if message.has_images() {
        let mut parts = vec![ChatWirePart::Text {
            text: message.content.clone(),
        }];
        parts.extend(message.image_urls.iter().map(|url| ChatWirePart::ImageUrl {
            image_url: ChatWireImageUrl { url: url.clone() },
        }));
        ChatWireContent::Parts(parts)
    } else {
        ChatWireContent::Text(message.content.clone())
    };

    ChatWireMessage {
        role: role.to_string(),
        content,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatWireRequest {
    pub model: String,
    pub messages: Vec<ChatWireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatWireMessage {
    pub role: String,
    pub content: ChatWireContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ChatWireContent {
    Text(String),
    Parts(Vec<ChatWirePart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatWirePart {
    Text { text: String },
    ImageUrl { image_url: ChatWireImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatWireImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatWireResponse {
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChatWireChoice>,
    pub usage: Option<ChatWireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatWireChoice {
    pub message: ChatWireAssistant,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatWireAssistant {
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatWireUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromptTokensDetails {
    pub cached_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatWireErrorEnvelope {
    error: ChatWireError,
}

#[derive(Debug, Deserialize)]
struct ChatWireError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ChatWireStreamChunk {
    #[serde(default)]
    choices: Vec<ChatWireStreamChoice>,
    #[serde(default)]
    usage: Option<ChatWireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatWireStreamChoice {
    delta: ChatWireStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatWireStreamDelta {
    content: Option<String>,
}
