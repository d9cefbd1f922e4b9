//! Conversation-thread persistence and bounded context memory.

mod backends;
mod error;
mod store;
mod types;
mod window;

pub mod prelude {
    pub use crate::{
        DEFAULT_CONTEXT_BUDGET_TOKENS, InMemoryThreadStore, MemoryError, MemoryErrorKind,
        MemoryManager, PruneOutcome, SqliteThreadStore, StoredContext, ThreadPatch, ThreadRecord,
        ThreadStore, ThreadStoreConfig, UsageAggregate, UsageIncrement, create_default_thread_store,
        create_thread_store, estimate_tokens,
    };
}

pub use error::{MemoryError, MemoryErrorKind};
pub use store::{
    InMemoryThreadStore, SqliteThreadStore, ThreadStore, ThreadStoreConfig,
    create_default_thread_store, create_thread_store,
};
pub use types::{StoredContext, ThreadPatch, ThreadRecord, UsageAggregate, UsageIncrement};
pub use window::{
    DEFAULT_CONTEXT_BUDGET_TOKENS, MemoryManager, PruneOutcome, estimate_tokens,
};
