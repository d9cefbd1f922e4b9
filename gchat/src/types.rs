//! Turn requests, session bindings, and lifecycle types.

use std::time::Duration;

use gcommon::{BoxFuture, ErrorCode, MetadataMap, ThreadId, TraceId, TurnId};
use gprovider::{ModelConfig, ProviderKeyId, ProviderKind, UsageDelta};

use crate::ChatError;

/// Presentation pacing for the outbound stream. Chunk size re-segments the
/// provider's own token boundaries and is purely cosmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPacing {
    pub inter_chunk_delay: Option<Duration>,
    pub chunk_chars: usize,
}

impl DeliveryPacing {
    pub const DEFAULT_CHUNK_CHARS: usize = 5;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inter_chunk_delay(mut self, delay: Duration) -> Self {
        self.inter_chunk_delay = Some(delay);
        self
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }
}

impl Default for DeliveryPacing {
    fn default() -> Self {
        Self {
            inter_chunk_delay: None,
            chunk_chars: Self::DEFAULT_CHUNK_CHARS,
        }
    }
}

/// One user request. Created per turn and discarded when the turn closes.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub turn_id: TurnId,
    pub user_input: String,
    pub attachments: Vec<String>,
    pub regenerate: bool,
    pub pacing: DeliveryPacing,
    pub credit_price: u64,
    pub paid_tier: bool,
    pub trace_id: Option<TraceId>,
}

impl TurnRequest {
    pub fn new(turn_id: impl Into<TurnId>, user_input: impl Into<String>) -> Self {
        Self {
            turn_id: turn_id.into(),
            user_input: user_input.into(),
            attachments: Vec::new(),
            regenerate: false,
            pacing: DeliveryPacing::default(),
            credit_price: 0,
            paid_tier: false,
            trace_id: None,
        }
    }

    pub fn with_attachments(
        mut self,
        attachments: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.attachments = attachments.into_iter().map(Into::into).collect();
        self
    }

    pub fn regenerate(mut self) -> Self {
        self.regenerate = true;
        self
    }

    pub fn with_pacing(mut self, pacing: DeliveryPacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_credit_price(mut self, credit_price: u64) -> Self {
        self.credit_price = credit_price;
        self
    }

    pub fn paid_tier(mut self) -> Self {
        self.paid_tier = true;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<TraceId>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// The backend identity one session runs against: which thread, which
/// provider family, which key, and the bound model settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadBinding {
    pub thread_id: ThreadId,
    pub provider: ProviderKind,
    pub key_id: ProviderKeyId,
    pub config: ModelConfig,
    pub scope: MetadataMap,
}

impl ThreadBinding {
    pub fn new(
        thread_id: impl Into<ThreadId>,
        provider: ProviderKind,
        key_id: impl Into<ProviderKeyId>,
        config: ModelConfig,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            provider,
            key_id: key_id.into(),
            config,
            scope: MetadataMap::new(),
        }
    }

    pub fn with_scope_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.scope.insert(key.into(), value.into());
        self
    }
}

/// Session lifecycle. `Erroring` is a transient detour that always drains
/// into `Finalizing`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Initializing,
    Streaming,
    Erroring,
    Finalizing,
    Closed,
}

/// How a turn ended, as reported to observability hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDisposition {
    Completed,
    Failed(ErrorCode),
    /// The caller stopped consuming; cleanup still ran.
    Disconnected,
}

/// Supplies the system prompt injected ahead of the conversation context.
pub trait PromptSource: Send + Sync {
    fn system_prompt<'a>(
        &'a self,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, Result<Option<String>, ChatError>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticPromptSource {
    prompt: Option<String>,
}

impl StaticPromptSource {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl PromptSource for StaticPromptSource {
    fn system_prompt<'a>(
        &'a self,
        _thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, Result<Option<String>, ChatError>> {
        Box::pin(async move { Ok(self.prompt.clone()) })
    }
}

/// Lifecycle observation points. Default impls make every hook optional.
pub trait GatewayHooks: Send + Sync {
    fn on_turn_start(&self, _thread_id: &ThreadId, _turn_id: &TurnId) {}

    fn on_turn_finalized(
        &self,
        _thread_id: &ThreadId,
        _turn_id: &TurnId,
        _disposition: &TurnDisposition,
        _usage: Option<&UsageDelta>,
    ) {
    }

    fn on_error_normalized(&self, _thread_id: &ThreadId, _record: &gcommon::ErrorRecord) {}

    /// Fired when a backend failure matched no classification rule.
    fn on_unknown_provider_error(&self, _platform: &str, _message: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGatewayHooks;

impl GatewayHooks for NoopGatewayHooks {}
