//! Uniform adapter layer over concrete LLM backends.
//!
//! Every backend is reached through the [`ModelProvider`] trait: one
//! non-streaming call and one streaming call that hands back a lazy token
//! source plus a usage promise. Vendor-specific failure details are carried
//! verbatim on [`ProviderError`]; collapsing them into the stable outward
//! taxonomy happens downstream, not here.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use gcommon::{Registry, UsdMicros};

mod keys;
mod pricing;
mod sse;
mod stream;

pub mod adapters;

pub use keys::{
    KeyFlag, KeyResolver, KeyStatusSink, NoopKeyStatusSink, ProviderKeyId, ResolvedAccess,
    SecretString, StaticKeyResolver,
};
pub use pricing::{ModelConfig, ModelPricing};
pub use stream::{BoxedTokenStream, StreamingCall, UsageHandle, UsageReporter, VecTokenStream};

pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" | "claude" => Some(Self::Anthropic),
            _ => None,
        }
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        };

        f.write_str(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image_urls: Vec::new(),
        }
    }

    pub fn with_image_urls(mut self, image_urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.image_urls = image_urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_images(&self) -> bool {
        !self.image_urls.is_empty()
    }
}

/// A single model invocation. The model identity itself is fixed at bind
/// time via [`ModelConfig`], so requests carry only conversation content and
/// per-call overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            temperature: None,
            max_output_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.messages.is_empty() {
            return Err(ProviderError::invalid_request(
                "at least one message is required",
            ));
        }

        if let Some(max_output_tokens) = self.max_output_tokens
            && max_output_tokens == 0
        {
            return Err(ProviderError::invalid_request(
                "max_output_tokens must be greater than zero",
            ));
        }

        if let Some(temperature) = self.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            return Err(ProviderError::invalid_request(
                "temperature must be in the inclusive range 0.0..=2.0",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    EndTurn,
    MaxOutput,
    Cancelled,
    Other,
}

/// Token counts and priced cost for one adapter call, immutable once emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageDelta {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: UsdMicros,
    pub image_tokens: Option<u64>,
    pub cache_prompt_tokens: Option<u64>,
    pub cache_cost: Option<UsdMicros>,
}

impl UsageDelta {
    pub fn tokens(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            ..Self::default()
        }
    }

    pub fn with_cost(mut self, cost: UsdMicros) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_image_tokens(mut self, image_tokens: u64) -> Self {
        self.image_tokens = Some(image_tokens);
        self
    }

    pub fn with_cached_prompt(mut self, cache_prompt_tokens: u64, cache_cost: UsdMicros) -> Self {
        self.cache_prompt_tokens = Some(cache_prompt_tokens);
        self.cache_cost = Some(cache_cost);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub provider: ProviderKind,
    pub model: String,
    pub text: String,
    pub stop: StopCause,
    pub usage: UsageDelta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFault {
    Connect,
    Timeout,
    Http,
    Decode,
    InvalidRequest,
    Auth,
}

/// A raw backend failure. Carries the vendor's own message text and status
/// code untranslated so the error normalizer has everything it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub provider: Option<ProviderKind>,
    pub fault: ProviderFault,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        provider: Option<ProviderKind>,
        fault: ProviderFault,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            fault,
            status,
            message: message.into(),
        }
    }

    pub fn connect(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::new(Some(provider), ProviderFault::Connect, None, message)
    }

    pub fn timeout(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::new(Some(provider), ProviderFault::Timeout, None, message)
    }

    pub fn http(provider: ProviderKind, status: u16, message: impl Into<String>) -> Self {
        Self::new(Some(provider), ProviderFault::Http, Some(status), message)
    }

    pub fn decode(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::new(Some(provider), ProviderFault::Decode, None, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(None, ProviderFault::InvalidRequest, None, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(None, ProviderFault::Auth, None, message)
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn platform(&self) -> &'static str {
        match self.provider {
            Some(ProviderKind::OpenAi) => "openai",
            Some(ProviderKind::Anthropic) => "anthropic",
            None => "gateway",
        }
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "{} {:?} (status {status}): {}",
                self.platform(),
                self.fault,
                self.message
            ),
            None => write!(f, "{} {:?}: {}", self.platform(), self.fault, self.message),
        }
    }
}

impl Error for ProviderError {}

/// Uniform interface over one bound backend/model pair.
///
/// `stream` must return without doing network work: the token source is lazy
/// (nothing happens before its first poll) and cancellable (dropping it
/// abandons the transfer), and the attached usage promise resolves only after
/// the underlying call finishes or fails.
pub trait ModelProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// The bound model identity, as recorded on the conversation thread.
    fn model(&self) -> &str;

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> ProviderFuture<'static, Result<Completion, ProviderError>>;

    fn stream(
        &self,
        request: CompletionRequest,
    ) -> ProviderFuture<'static, Result<StreamingCall, ProviderError>>;
}

/// Constructs a bound provider from resolved credentials and model settings.
pub trait ProviderBinder: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn bind(&self, access: ResolvedAccess, config: ModelConfig) -> Arc<dyn ModelProvider>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    binders: Registry<ProviderKind, Arc<dyn ProviderBinder>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<B>(&mut self, binder: B)
    where
        B: ProviderBinder + 'static,
    {
        self.binders.insert(binder.kind(), Arc::new(binder));
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderBinder>> {
        self.binders.get(&kind).map(Arc::clone)
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.binders.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.binders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.binders.is_empty()
    }
}

pub(crate) fn transport_failure(provider: ProviderKind, error: &reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::timeout(provider, error.to_string())
    } else {
        ProviderError::connect(provider, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    struct FakeProvider {
        model: String,
    }

    impl ModelProvider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        fn model(&self) -> &str {
            &self.model
        }

        fn complete(
            &self,
            request: CompletionRequest,
        ) -> ProviderFuture<'static, Result<Completion, ProviderError>> {
            let model = self.model.clone();
            Box::pin(async move {
                request.validate()?;
                Ok(Completion {
                    provider: ProviderKind::OpenAi,
                    model,
                    text: "hello from provider".to_string(),
                    stop: StopCause::EndTurn,
                    usage: UsageDelta::tokens(5, 4),
                })
            })
        }

        fn stream(
            &self,
            request: CompletionRequest,
        ) -> ProviderFuture<'static, Result<StreamingCall, ProviderError>> {
            Box::pin(async move {
                request.validate()?;
                let (mut reporter, usage) = UsageHandle::channel();
                reporter.report(UsageDelta::tokens(5, 2));
                let tokens = VecTokenStream::new(vec![
                    Ok("hello".to_string()),
                    Ok(" world".to_string()),
                ]);

                Ok(StreamingCall {
                    tokens: Box::pin(tokens),
                    usage,
                })
            })
        }
    }

    struct FakeBinder;

    impl ProviderBinder for FakeBinder {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        fn bind(&self, access: ResolvedAccess, config: ModelConfig) -> Arc<dyn ModelProvider> {
            let model = if access.model.is_empty() {
                config.model
            } else {
                access.model
            };
            Arc::new(FakeProvider { model })
        }
    }

    #[test]
    fn provider_kind_display_round_trips_through_parse() {
        assert_eq!(ProviderKind::OpenAi.to_string(), "openai");
        assert_eq!(ProviderKind::Anthropic.to_string(), "anthropic");
        assert_eq!(ProviderKind::parse("openai"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::parse("Claude"), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::parse("grok"), None);
    }

    #[test]
    fn completion_request_validate_enforces_contract() {
        let empty_messages = CompletionRequest::new(Vec::new());
        let error = empty_messages
            .validate()
            .expect_err("empty messages must fail");
        assert_eq!(error.fault, ProviderFault::InvalidRequest);

        let bad_temperature =
            CompletionRequest::new(vec![Message::new(Role::User, "hi")]).with_temperature(2.5);
        let error = bad_temperature
            .validate()
            .expect_err("temperature outside range must fail");
        assert_eq!(error.fault, ProviderFault::InvalidRequest);

        let zero_ceiling =
            CompletionRequest::new(vec![Message::new(Role::User, "hi")]).with_max_output_tokens(0);
        let error = zero_ceiling
            .validate()
            .expect_err("max_output_tokens=0 must fail");
        assert_eq!(error.fault, ProviderFault::InvalidRequest);

        let valid = CompletionRequest::new(vec![Message::new(Role::User, "hi")])
            .with_temperature(0.4)
            .with_max_output_tokens(128);
        assert!(valid.validate().is_ok());
    }

    #[test]
    fn provider_error_display_includes_platform_and_status() {
        let error = ProviderError::http(ProviderKind::OpenAi, 429, "slow down");
        assert_eq!(error.platform(), "openai");
        assert!(error.to_string().contains("status 429"));

        let unbound = ProviderError::invalid_request("bad input");
        assert_eq!(unbound.platform(), "gateway");
        assert_eq!(unbound.status, None);
    }

    #[test]
    fn message_serde_round_trips_with_images() {
        let message =
            Message::new(Role::User, "look at this").with_image_urls(["https://img.example/a.png"]);
        let json = serde_json::to_string(&message).expect("message should serialize");
        let parsed: Message = serde_json::from_str(&json).expect("message should deserialize");
        assert_eq!(parsed, message);

        let plain = Message::new(Role::Assistant, "no images");
        let json = serde_json::to_string(&plain).expect("message should serialize");
        assert!(!json.contains("image_urls"));
    }

    #[tokio::test]
    async fn registry_binds_and_streams_through_fake_provider() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.is_empty());

        registry.register(FakeBinder);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(ProviderKind::OpenAi));

        let binder = registry
            .get(ProviderKind::OpenAi)
            .expect("binder should exist");
        let provider = binder.bind(
            ResolvedAccess::new("gpt-4o-mini", "sk-test"),
            ModelConfig::new("fallback-model", 1024),
        );
        assert_eq!(provider.model(), "gpt-4o-mini");

        let request = CompletionRequest::new(vec![Message::new(Role::User, "stream please")]);
        let call = provider.stream(request).await.expect("stream should open");

        let collected: Vec<_> = call.tokens.collect().await;
        let texts: Vec<_> = collected
            .into_iter()
            .map(|item| item.expect("token should be ok"))
            .collect();
        assert_eq!(texts, vec!["hello".to_string(), " world".to_string()]);

        let usage = call.usage.resolve().await.expect("usage should resolve");
        assert_eq!(usage.total_tokens, 7);
    }
}
