//! Mutex-guarded in-memory thread store for tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use gcommon::{BoxFuture, ThreadId};

use crate::error::MemoryError;
use crate::store::ThreadStore;
use crate::types::{StoredContext, ThreadPatch, ThreadRecord, UsageIncrement};

#[derive(Debug, Default)]
pub struct InMemoryThreadStore {
    threads: Mutex<HashMap<ThreadId, ThreadState>>,
}

#[derive(Debug, Default, Clone)]
struct ThreadState {
    record: Option<ThreadRecord>,
    context: StoredContext,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn threads(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<ThreadId, ThreadState>>, MemoryError> {
        self.threads
            .lock()
            .map_err(|_| MemoryError::storage("thread store lock poisoned"))
    }
}

impl ThreadStore for InMemoryThreadStore {
    fn get<'a>(
        &'a self,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, Result<Option<ThreadRecord>, MemoryError>> {
        Box::pin(async move {
            let threads = self.threads()?;
            Ok(threads
                .get(thread_id)
                .and_then(|state| state.record.clone()))
        })
    }

    fn create_if_missing<'a>(
        &'a self,
        record: ThreadRecord,
    ) -> BoxFuture<'a, Result<bool, MemoryError>> {
        Box::pin(async move {
            let mut threads = self.threads()?;
            let state = threads.entry(record.id.clone()).or_default();
            if state.record.is_some() {
                return Ok(false);
            }

            state.record = Some(record);
            Ok(true)
        })
    }

    fn apply_usage<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        increment: UsageIncrement,
    ) -> BoxFuture<'a, Result<(), MemoryError>> {
        Box::pin(async move {
            let mut threads = self.threads()?;
            let record = threads
                .get_mut(thread_id)
                .and_then(|state| state.record.as_mut())
                .ok_or_else(|| {
                    MemoryError::not_found(format!("thread '{thread_id}' does not exist"))
                })?;

            record.usage.apply(&increment);
            record.credits_used = record.credits_used.saturating_add(increment.credits);
            Ok(())
        })
    }

    fn set_fields<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        patch: ThreadPatch,
    ) -> BoxFuture<'a, Result<(), MemoryError>> {
        Box::pin(async move {
            let mut threads = self.threads()?;
            let record = threads
                .get_mut(thread_id)
                .and_then(|state| state.record.as_mut())
                .ok_or_else(|| {
                    MemoryError::not_found(format!("thread '{thread_id}' does not exist"))
                })?;

            if let Some(model) = patch.last_response_model {
                record.last_response_model = Some(model);
            }

            if let Some(error) = patch.last_error {
                record.last_error = Some(error);
            }

            Ok(())
        })
    }

    fn load_context<'a>(
        &'a self,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, Result<StoredContext, MemoryError>> {
        Box::pin(async move {
            let threads = self.threads()?;
            Ok(threads
                .get(thread_id)
                .map(|state| state.context.clone())
                .unwrap_or_default())
        })
    }

    fn save_context<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        context: StoredContext,
    ) -> BoxFuture<'a, Result<(), MemoryError>> {
        Box::pin(async move {
            let mut threads = self.threads()?;
            threads.entry(thread_id.clone()).or_default().context = context;
            Ok(())
        })
    }
}
