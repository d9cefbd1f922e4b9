//! Scoped usage metering over the thread store.
//!
//! One [`LedgerScope`] is opened per turn and must be closed on every exit
//! path, through exactly one of two mutually exclusive writes: the additive
//! usage update for normal turns, or the model-reference-only update for
//! regenerate turns. Closing consumes the scope, so a double close is
//! unrepresentable; a scope that is dropped without being closed is a bug in
//! the calling lifecycle and is logged as such.

mod error;

pub use error::{LedgerError, LedgerErrorKind};

use std::sync::Arc;

use gcommon::{ThreadId, UsdMicros};
use gmemory::{ThreadPatch, ThreadStore, UsageIncrement};
use gprovider::UsageDelta;

pub struct UsageLedger {
    store: Arc<dyn ThreadStore>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn ThreadStore>) -> Self {
        Self { store }
    }

    pub fn open(&self, thread_id: ThreadId) -> LedgerScope {
        LedgerScope {
            store: Arc::clone(&self.store),
            thread_id,
            closed: false,
        }
    }
}

/// Translates an adapter usage delta into the store's additive update shape.
pub fn increment_from(delta: &UsageDelta, credits: u64) -> UsageIncrement {
    UsageIncrement {
        total_used: delta.total_tokens,
        prompt: delta.prompt_tokens,
        completion: delta.completion_tokens,
        cost: delta.cost,
        image: delta.image_tokens.unwrap_or(0),
        cache_prompt: delta.cache_prompt_tokens.unwrap_or(0),
        cache_cost: delta.cache_cost.unwrap_or(UsdMicros::ZERO),
        credits,
    }
}

pub struct LedgerScope {
    store: Arc<dyn ThreadStore>,
    thread_id: ThreadId,
    closed: bool,
}

impl LedgerScope {
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Closes a normal turn: one atomic additive aggregate update (when the
    /// call produced a usage delta) plus the model-reference set.
    ///
    /// A `None` delta means the producer went away before usage was known;
    /// the aggregate and credit balance are left untouched.
    pub async fn close(
        mut self,
        delta: Option<UsageDelta>,
        credit_charge: u64,
        response_model: impl Into<String>,
    ) -> Result<(), LedgerError> {
        self.closed = true;

        if let Some(delta) = delta {
            self.store
                .apply_usage(&self.thread_id, increment_from(&delta, credit_charge))
                .await?;
        }

        self.store
            .set_fields(
                &self.thread_id,
                ThreadPatch::new().with_last_response_model(response_model),
            )
            .await?;

        Ok(())
    }

    /// Closes a regenerate turn: no accumulation, no credit charge, only the
    /// model reference is updated.
    pub async fn close_regenerate(
        mut self,
        response_model: impl Into<String>,
    ) -> Result<(), LedgerError> {
        self.closed = true;

        self.store
            .set_fields(
                &self.thread_id,
                ThreadPatch::new().with_last_response_model(response_model),
            )
            .await?;

        Ok(())
    }
}

impl Drop for LedgerScope {
    fn drop(&mut self) {
        if !self.closed {
            tracing::error!(
                thread_id = %self.thread_id,
                "ledger scope dropped without being closed; usage for this turn was not flushed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gmemory::{InMemoryThreadStore, ThreadRecord, ThreadStore};
    use gprovider::ProviderKind;

    use super::*;

    async fn seeded_store() -> (Arc<dyn ThreadStore>, ThreadId) {
        let store: Arc<dyn ThreadStore> = Arc::new(InMemoryThreadStore::new());
        let thread_id = ThreadId::from("thread-1");
        store
            .create_if_missing(ThreadRecord::new(
                thread_id.clone(),
                ProviderKind::OpenAi,
                "gpt-4o-mini",
            ))
            .await
            .expect("thread should create");

        store
            .apply_usage(
                &thread_id,
                UsageIncrement {
                    total_used: 100,
                    prompt: 60,
                    completion: 40,
                    cost: UsdMicros::parse("$0.010").expect("seed cost"),
                    ..UsageIncrement::default()
                },
            )
            .await
            .expect("seed usage should apply");

        (store, thread_id)
    }

    #[tokio::test]
    async fn close_applies_one_additive_update_and_sets_model() {
        let (store, thread_id) = seeded_store().await;
        let ledger = UsageLedger::new(Arc::clone(&store));

        let delta = UsageDelta::tokens(30, 20).with_cost(UsdMicros::parse("$0.005").expect("cost"));
        ledger
            .open(thread_id.clone())
            .close(Some(delta), 0, "gpt-4o-mini-2024")
            .await
            .expect("close should succeed");

        let record = store
            .get(&thread_id)
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(record.usage.total_used, 150);
        assert_eq!(record.usage.prompt, 90);
        assert_eq!(record.usage.completion, 60);
        assert_eq!(record.usage.total_cost.to_string(), "$0.015");
        assert_eq!(record.credits_used, 0);
        assert_eq!(record.last_response_model.as_deref(), Some("gpt-4o-mini-2024"));
    }

    #[tokio::test]
    async fn close_charges_credits_alongside_usage() {
        let (store, thread_id) = seeded_store().await;
        let ledger = UsageLedger::new(Arc::clone(&store));

        let delta = UsageDelta::tokens(10, 10);
        ledger
            .open(thread_id.clone())
            .close(Some(delta), 3, "gpt-4o-mini")
            .await
            .expect("close should succeed");

        let record = store
            .get(&thread_id)
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(record.credits_used, 3);
    }

    #[tokio::test]
    async fn close_without_delta_leaves_aggregate_untouched() {
        let (store, thread_id) = seeded_store().await;
        let ledger = UsageLedger::new(Arc::clone(&store));

        ledger
            .open(thread_id.clone())
            .close(None, 5, "gpt-4o-mini")
            .await
            .expect("close should succeed");

        let record = store
            .get(&thread_id)
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(record.usage.total_used, 100);
        assert_eq!(record.usage.total_cost.to_string(), "$0.010");
        // No usage, no charge.
        assert_eq!(record.credits_used, 0);
        assert_eq!(record.last_response_model.as_deref(), Some("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn close_regenerate_only_updates_the_model_reference() {
        let (store, thread_id) = seeded_store().await;
        let ledger = UsageLedger::new(Arc::clone(&store));

        ledger
            .open(thread_id.clone())
            .close_regenerate("gpt-4.1")
            .await
            .expect("close should succeed");

        let record = store
            .get(&thread_id)
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(record.usage.total_used, 100);
        assert_eq!(record.usage.total_cost.to_string(), "$0.010");
        assert_eq!(record.credits_used, 0);
        assert_eq!(record.last_response_model.as_deref(), Some("gpt-4.1"));
    }

    #[tokio::test]
    async fn increment_from_carries_optional_fields() {
        let delta = UsageDelta::tokens(100, 50)
            .with_cost(UsdMicros::from_micros(1_000))
            .with_image_tokens(7)
            .with_cached_prompt(40, UsdMicros::from_micros(25));

        let increment = increment_from(&delta, 2);
        assert_eq!(increment.total_used, 150);
        assert_eq!(increment.image, 7);
        assert_eq!(increment.cache_prompt, 40);
        assert_eq!(increment.cache_cost.as_micros(), 25);
        assert_eq!(increment.credits, 2);
    }

    #[tokio::test]
    async fn dropping_an_unclosed_scope_does_not_panic() {
        let (store, thread_id) = seeded_store().await;
        let ledger = UsageLedger::new(Arc::clone(&store));

        // Leak-detection only logs; the aggregate must stay untouched.
        drop(ledger.open(thread_id.clone()));

        let record = store
            .get(&thread_id)
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(record.usage.total_used, 100);
    }
}
