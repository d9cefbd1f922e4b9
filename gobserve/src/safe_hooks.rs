use std::panic::{AssertUnwindSafe, catch_unwind};

use gchat::{GatewayHooks, TurnDisposition};
use gcommon::{ErrorRecord, ThreadId, TurnId};
use gprovider::UsageDelta;

/// Wraps another hook implementation so that a panicking hook can never take
/// a session down with it.
pub struct SafeGatewayHooks<H> {
    inner: H,
}

impl<H> SafeGatewayHooks<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

impl<H> GatewayHooks for SafeGatewayHooks<H>
where
    H: GatewayHooks,
{
    fn on_turn_start(&self, thread_id: &ThreadId, turn_id: &TurnId) {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            self.inner.on_turn_start(thread_id, turn_id)
        }));
    }

    fn on_turn_finalized(
        &self,
        thread_id: &ThreadId,
        turn_id: &TurnId,
        disposition: &TurnDisposition,
        usage: Option<&UsageDelta>,
    ) {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            self.inner
                .on_turn_finalized(thread_id, turn_id, disposition, usage)
        }));
    }

    fn on_error_normalized(&self, thread_id: &ThreadId, record: &ErrorRecord) {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            self.inner.on_error_normalized(thread_id, record)
        }));
    }

    fn on_unknown_provider_error(&self, platform: &str, message: &str) {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            self.inner.on_unknown_provider_error(platform, message)
        }));
    }
}
