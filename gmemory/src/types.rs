//! Durable conversation-thread records and their update shapes.

use gcommon::{ErrorRecord, ThreadId, UsdMicros};
use gprovider::{Message, ProviderKind};

/// Lifetime token/cost totals for one thread. Fields only ever grow; the
/// store applies [`UsageIncrement`]s as per-field atomic additions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageAggregate {
    pub total_used: u64,
    pub prompt: u64,
    pub completion: u64,
    pub total_cost: UsdMicros,
    pub image: u64,
    pub cache_prompt: u64,
    pub cache_cost: UsdMicros,
}

impl UsageAggregate {
    pub fn apply(&mut self, increment: &UsageIncrement) {
        self.total_used = self.total_used.saturating_add(increment.total_used);
        self.prompt = self.prompt.saturating_add(increment.prompt);
        self.completion = self.completion.saturating_add(increment.completion);
        self.total_cost = self.total_cost.saturating_add(increment.cost);
        self.image = self.image.saturating_add(increment.image);
        self.cache_prompt = self.cache_prompt.saturating_add(increment.cache_prompt);
        self.cache_cost = self.cache_cost.saturating_add(increment.cache_cost);
    }
}

/// One additive usage update, expressed field-by-field so backends can apply
/// it as atomic increments instead of read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageIncrement {
    pub total_used: u64,
    pub prompt: u64,
    pub completion: u64,
    pub cost: UsdMicros,
    pub image: u64,
    pub cache_prompt: u64,
    pub cache_cost: UsdMicros,
    pub credits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: ThreadId,
    pub provider: ProviderKind,
    pub model: String,
    pub usage: UsageAggregate,
    pub credits_used: u64,
    pub last_response_model: Option<String>,
    pub last_error: Option<ErrorRecord>,
}

impl ThreadRecord {
    pub fn new(id: impl Into<ThreadId>, provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider,
            model: model.into(),
            usage: UsageAggregate::default(),
            credits_used: 0,
            last_response_model: None,
            last_error: None,
        }
    }
}

/// Atomic field sets. `None` leaves the field untouched; the core never
/// clears a previously recorded value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadPatch {
    pub last_response_model: Option<String>,
    pub last_error: Option<ErrorRecord>,
}

impl ThreadPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_last_response_model(mut self, model: impl Into<String>) -> Self {
        self.last_response_model = Some(model.into());
        self
    }

    pub fn with_last_error(mut self, error: ErrorRecord) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.last_response_model.is_none() && self.last_error.is_none()
    }
}

/// The persisted conversation context: the bounded recent-message window and
/// the rolling summary that stands in for everything evicted from it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredContext {
    pub messages: Vec<Message>,
    pub summary: Option<String>,
}

impl StoredContext {
    pub fn new(messages: Vec<Message>, summary: Option<String>) -> Self {
        Self { messages, summary }
    }
}
