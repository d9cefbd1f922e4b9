//! One-stop imports for gateway applications.

pub use gchat::prelude::*;
pub use gmemory::prelude::*;
pub use gobserve::prelude::*;

pub use gcommon::{BoxFuture, UsdMicros};
pub use gledger::{LedgerError, LedgerScope, UsageLedger, increment_from};
pub use gprovider::adapters::{AnthropicBinder, OpenAiCompatBinder};
pub use gprovider::{
    Completion, CompletionRequest, KeyFlag, KeyResolver, KeyStatusSink, Message, ModelConfig,
    ModelPricing, ModelProvider, ProviderBinder, ProviderError, ProviderKeyId, ProviderKind,
    ProviderRegistry, ResolvedAccess, StaticKeyResolver, StopCause, UsageDelta,
};

pub use crate::runtime::{RuntimeBundle, build_runtime, build_runtime_with, default_registry};
pub use crate::util::{assistant_message, parse_provider_kind, system_message, turn, user_message};
