//! Unified facade over the gantry workspace crates.
//!
//! This crate is designed to be the single dependency for most applications.
//! It re-exports the core gateway crates and provides convenience utilities
//! for common wiring and request-building flows.

pub mod prelude;
pub mod runtime;
pub mod util;

pub use gchat;
pub use gcommon;
pub use gledger;
pub use gmemory;
pub use gobserve;
pub use gprovider;

pub use gchat::{
    CONTENT_POLICY_MESSAGE, ChatError, ChatErrorKind, ChatGateway, ConversationSession,
    DeliveryPacing, FALLBACK_MESSAGE, Frame, FrameStream, GatewayBuilder, GatewayHooks,
    NoopGatewayHooks, NormalizedError, PromptSource, SessionPhase, StaticPromptSource,
    ThreadBinding, TurnDisposition, TurnRequest, key_flag_for, normalize_provider_error,
};
pub use gcommon::{
    BoxFuture, ErrorCode, ErrorRecord, MetadataMap, ThreadId, TraceId, TurnId, UsdMicros,
};
pub use gledger::{LedgerError, LedgerScope, UsageLedger};
pub use gmemory::{
    DEFAULT_CONTEXT_BUDGET_TOKENS, InMemoryThreadStore, MemoryError, MemoryManager, PruneOutcome,
    SqliteThreadStore, StoredContext, ThreadPatch, ThreadRecord, ThreadStore, ThreadStoreConfig,
    UsageAggregate, UsageIncrement, create_thread_store,
};
pub use gobserve::{MetricsGatewayHooks, SafeGatewayHooks, TracingGatewayHooks, TracingKeyStatusSink};
pub use gprovider::{
    Completion, CompletionRequest, KeyFlag, KeyResolver, KeyStatusSink, Message, ModelConfig,
    ModelPricing, ModelProvider, NoopKeyStatusSink, ProviderBinder, ProviderError, ProviderKeyId,
    ProviderKind, ProviderRegistry, ResolvedAccess, SecretString, StaticKeyResolver, StopCause,
    StreamingCall, UsageDelta, UsageHandle,
    adapters::{AnthropicBinder, OpenAiCompatBinder},
};

pub use runtime::{
    RuntimeBundle, build_runtime, build_runtime_with, default_registry, in_memory_store,
};
pub use util::{
    assistant_message, parse_provider_kind, system_message, turn, user_message,
};
