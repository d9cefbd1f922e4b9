//! Adapter for the Anthropic messages backend.
//!
//! Anthropic streams event-typed SSE: usage arrives split across
//! `message_start` (input side) and `message_delta` (output side), so the
//! adapter stitches the two halves together before resolving the usage
//! promise. In-stream `error` events carry the vendor's own error type string
//! in the message text for downstream classification.

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

const KIND: ProviderKind = ProviderKind::Anthropic;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicBinder {
    transport: Arc<dyn AnthropicTransport>,
}

impl AnthropicBinder {
    pub fn new(transport: Arc<dyn AnthropicTransport>) -> Self {
        Self { transport }
    }

    pub fn over_http(client: Client) -> Self {
        Self::new(Arc::new(AnthropicHttpTransport::new(client)))
    }
}

impl ProviderBinder for AnthropicBinder {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn bind(&self, access: ResolvedAccess, config: ModelConfig) -> Arc<dyn ModelProvider> {
        Arc::new(AnthropicAdapter::bind(
            access,
            config,
            Arc::clone(&self.transport),
        ))
    }
}

pub struct AnthropicAdapter {
    api_key: SecretString,
    config: ModelConfig,
    transport: Arc<dyn AnthropicTransport>,
}

impl AnthropicAdapter {
    pub fn bind(
        access: ResolvedAccess,
        mut config: ModelConfig,
        transport: Arc<dyn AnthropicTransport>,
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

    fn wire_request(&self, request: &CompletionRequest, stream: bool) -> MessagesWireRequest {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(message.content.clone()),
                role => messages.push(wire_message(role, message)),
            }
        }

        MessagesWireRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.clamp_output(request.max_output_tokens),
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            messages,
            temperature: request.temperature.or(self.config.temperature),
            stream,
        }
    }
}

impl ModelProvider for AnthropicAdapter {
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

            let text = response
                .content
                .iter()
                .filter_map(|block| block.text.as_deref())
                .collect::<Vec<_>>()
                .join("");

            let cache_read = response.usage.cache_read_input_tokens.unwrap_or(0);

            Ok(Completion {
                provider: KIND,
                model: if response.model.is_empty() {
                    model
                } else {
                    response.model
                },
                text,
                stop: parse_stop(response.stop_reason.as_deref()),
                usage: build_delta(
                    &pricing,
                    response.usage.input_tokens,
                    cache_read,
                    response.usage.output_tokens,
                ),
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

                let mut input_tokens = 0_u64;
                let mut cache_read_tokens = 0_u64;

                while let Some(event) = events.next().await {
                    match event {
                        Ok(MessagesWireEvent::Start {
                            input_tokens: input,
                            cache_read_tokens: cache_read,
                        }) => {
                            input_tokens = input;
                            cache_read_tokens = cache_read;
                        }
                        Ok(MessagesWireEvent::TextDelta(delta)) => yield Ok(delta),
                        Ok(MessagesWireEvent::Delta { output_tokens, .. }) => {
                            reporter.report(build_delta(
                                &pricing,
                                input_tokens,
                                cache_read_tokens,
                                output_tokens,
                            ));
                        }
                        Ok(MessagesWireEvent::Stop) => {}
                        Err(error) => {
                            // The input side is already billed by the vendor
                            // even when generation fails part-way.
                            if input_tokens > 0 {
                                reporter.report(build_delta(
                                    &pricing,
                                    input_tokens,
                                    cache_read_tokens,
                                    0,
                                ));
                            }

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

pub trait AnthropicTransport: Send + Sync {
    fn complete(
        &self,
        request: MessagesWireRequest,
        api_key: String,
    ) -> ProviderFuture<'static, Result<MessagesWireResponse, ProviderError>>;

    fn stream(
        &self,
        request: MessagesWireRequest,
        api_key: String,
    ) -> ProviderFuture<'static, Result<BoxedMessagesWireEvents, ProviderError>>;
}

pub type BoxedMessagesWireEvents =
    Pin<Box<dyn Stream<Item = Result<MessagesWireEvent, ProviderError>> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagesWireEvent {
    Start {
        input_tokens: u64,
        cache_read_tokens: u64,
    },
    TextDelta(String),
    Delta {
        output_tokens: u64,
        stop_reason: Option<String>,
    },
    Stop,
}

#[derive(Debug, Clone)]
pub struct AnthropicHttpTransport {
    client: Client,
    base_url: String,
}

impl AnthropicHttpTransport {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: ANTHROPIC_BASE_URL.to_string(),
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

impl AnthropicTransport for AnthropicHttpTransport {
    fn complete(
        &self,
        request: MessagesWireRequest,
        api_key: String,
    ) -> ProviderFuture<'static, Result<MessagesWireResponse, ProviderError>> {
        let client = self.client.clone();
        let url = self.endpoint("messages");

        Box::pin(async move {
            let response = client
                .post(url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&request)
                .send()
                .await
                .map_err(|error| transport_failure(KIND, &error))?;

            if !response.status().is_success() {
                return Err(parse_error(response).await);
            }

            response
                .json::<MessagesWireResponse>()
                .await
                .map_err(|error| ProviderError::decode(KIND, error.to_string()))
        })
    }

    fn stream(
        &self,
        request: MessagesWireRequest,
        api_key: String,
    ) -> ProviderFuture<'static, Result<BoxedMessagesWireEvents, ProviderError>> {
        let client = self.client.clone();
        let url = self.endpoint("messages");

        Box::pin(async move {
            let response = client
                .post(url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
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
                        match decode_stream_event(message.event.as_deref(), &message.data) {
                            Ok(Some(event)) => yield Ok(event),
                            Ok(None) => {}
                            Err(error) => {
                                yield Err(error);
                                return;
                            }
                        }
                    }
                }
            };

            Ok(Box::pin(events) as BoxedMessagesWireEvents)
        })
    }
}

/// Maps one SSE message to a wire event. Unknown and housekeeping event
/// types (`ping`, `content_block_start`, ...) decode to `None`.
fn decode_stream_event(
    event: Option<&str>,
    data: &str,
) -> Result<Option<MessagesWireEvent>, ProviderError> {
    match event {
        Some("message_start") => {
            let parsed: MessageStartPayload = decode_json(data)?;
            Ok(Some(MessagesWireEvent::Start {
                input_tokens: parsed.message.usage.input_tokens,
                cache_read_tokens: parsed.message.usage.cache_read_input_tokens.unwrap_or(0),
            }))
        }
        Some("content_block_delta") => {
            let parsed: ContentBlockDeltaPayload = decode_json(data)?;
            match parsed.delta.text {
                Some(text) if !text.is_empty() => Ok(Some(MessagesWireEvent::TextDelta(text))),
                _ => Ok(None),
            }
        }
        Some("message_delta") => {
            let parsed: MessageDeltaPayload = decode_json(data)?;
            Ok(Some(MessagesWireEvent::Delta {
                output_tokens: parsed.usage.map(|usage| usage.output_tokens).unwrap_or(0),
                stop_reason: parsed.delta.and_then(|delta| delta.stop_reason),
            }))
        }
        Some("message_stop") => Ok(Some(MessagesWireEvent::Stop)),
        Some("error") => {
            let parsed: ErrorEventPayload = decode_json(data)?;
            Err(ProviderError::new(
                Some(KIND),
                crate::ProviderFault::Http,
                None,
                format!("{}: {}", parsed.error.kind, parsed.error.message),
            ))
        }
        _ => Ok(None),
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(data: &str) -> Result<T, ProviderError> {
    serde_json::from_str(data).map_err(|error| ProviderError::decode(KIND, error.to_string()))
}

async fn parse_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = extract_error_message(&body)
        .unwrap_or_else(|| format!("request failed with status {status}"));

    ProviderError::http(KIND, status, message)
}

fn extract_error_message(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ErrorEventPayload>(body).ok()?;
    Some(format!("{}: {}", parsed.error.kind, parsed.error.message))
}

fn parse_stop(stop_reason: Option<&str>) -> StopCause {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => StopCause::EndTurn,
        Some("max_tokens") => StopCause::MaxOutput,
        _ => StopCause::Other,
    }
}

fn build_delta(
    pricing: &ModelPricing,
    input_tokens: u64,
    cache_read_tokens: u64,
    output_tokens: u64,
) -> UsageDelta {
    let prompt_tokens = input_tokens + cache_read_tokens;
    let mut delta = UsageDelta {
        prompt_tokens,
        completion_tokens: output_tokens,
        total_tokens: prompt_tokens + output_tokens,
        cost: pricing.price(input_tokens, output_tokens),
        image_tokens: None,
        cache_prompt_tokens: None,
        cache_cost: None,
    };

    if cache_read_tokens > 0 {
        delta = delta.with_cached_prompt(cache_read_tokens, pricing.price_cached(cache_read_tokens));
    }

    delta
}

fn wire_message(role: Role, message: &Message) -> MessagesWireMessage {
    let role = match role {
        Role::Assistant => "assistant",
        _ => "user",
    };

    let mut content = vec![MessagesWireBlock::Text {
        text: message.content.clone(),
    }];
    content.extend(message.image_urls.iter().map(|url| MessagesWireBlock::Image {
        source: MessagesWireImageSource {
            kind: "url".to_string(),
            url: url.clone(),
        },
    }));

    MessagesWireMessage {
        role: role.to_string(),
        content,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesWireRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<MessagesWireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesWireMessage {
    pub role: String,
    pub content: Vec<MessagesWireBlock>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagesWireBlock {
    Text { text: String },
    Image { source: MessagesWireImageSource },
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesWireImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesWireResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub content: Vec<MessagesWireContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: MessagesWireUsage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesWireContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MessagesWireUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessageStartPayload {
    message: MessageStartMessage,
}

#[derive(Debug, Deserialize)]
struct MessageStartMessage {
    #[serde(default)]
    usage: MessagesWireUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaPayload {
    delta: ContentBlockDelta,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaPayload {
    delta: Option<MessageDelta>,
    usage: Option<MessagesWireUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEventPayload {
    error: ErrorEventBody,
}

#[derive(Debug, Deserialize)]
struct ErrorEventBody {
    #[serde(rename = "type", default)]
    kind: String,
    message: String,
}
