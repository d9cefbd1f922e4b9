//! Thread store trait and backend selection.

use std::path::PathBuf;
use std::sync::Arc;

use gcommon::{BoxFuture, ThreadId};

use crate::backends::sqlite::default_sqlite_path;
use crate::error::MemoryError;
use crate::types::{StoredContext, ThreadPatch, ThreadRecord, UsageIncrement};

pub use crate::backends::memory::InMemoryThreadStore;
pub use crate::backends::sqlite::SqliteThreadStore;

/// Per-document atomic persistence for conversation threads.
///
/// This is the only mutable resource shared between sessions, so every write
/// is expressed as an atomic increment ([`ThreadStore::apply_usage`]) or an
/// atomic set ([`ThreadStore::set_fields`]) against one document; backends
/// must not implement them as read-modify-write.
pub trait ThreadStore: Send + Sync {
    fn get<'a>(
        &'a self,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, Result<Option<ThreadRecord>, MemoryError>>;

    /// Creates the thread record unless it already exists. Returns whether a
    /// record was created; an existing record is never overwritten.
    fn create_if_missing<'a>(
        &'a self,
        record: ThreadRecord,
    ) -> BoxFuture<'a, Result<bool, MemoryError>>;

    fn apply_usage<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        increment: UsageIncrement,
    ) -> BoxFuture<'a, Result<(), MemoryError>>;

    fn set_fields<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        patch: ThreadPatch,
    ) -> BoxFuture<'a, Result<(), MemoryError>>;

    fn load_context<'a>(
        &'a self,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, Result<StoredContext, MemoryError>>;

    fn save_context<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        context: StoredContext,
    ) -> BoxFuture<'a, Result<(), MemoryError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadStoreConfig {
    Sqlite { path: PathBuf },
    InMemory,
}

impl Default for ThreadStoreConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

pub fn create_thread_store(
    config: ThreadStoreConfig,
) -> Result<Arc<dyn ThreadStore>, MemoryError> {
    match config {
        ThreadStoreConfig::Sqlite { path } => Ok(Arc::new(SqliteThreadStore::new(path)?)),
        ThreadStoreConfig::InMemory => Ok(Arc::new(InMemoryThreadStore::new())),
    }
}

pub fn create_default_thread_store() -> Result<Arc<dyn ThreadStore>, MemoryError> {
    create_thread_store(ThreadStoreConfig::default())
}
