//! Tracing-based observability hooks for the session lifecycle.
//!
//! ```rust
//! use gchat::GatewayHooks;
//! use gobserve::TracingGatewayHooks;
//!
//! fn accepts_hooks(_hooks: &dyn GatewayHooks) {}
//!
//! let hooks = TracingGatewayHooks;
//! accepts_hooks(&hooks);
//! ```

use gchat::{GatewayHooks, TurnDisposition};
use gcommon::{ErrorRecord, ThreadId, TurnId};
use gprovider::{KeyFlag, KeyStatusSink, ProviderKeyId, UsageDelta};

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingGatewayHooks;

impl GatewayHooks for TracingGatewayHooks {
    fn on_turn_start(&self, thread_id: &ThreadId, turn_id: &TurnId) {
        tracing::info!(
            phase = "session",
            event = "turn_start",
            thread_id = %thread_id,
            turn_id = %turn_id
        );
    }

    fn on_turn_finalized(
        &self,
        thread_id: &ThreadId,
        turn_id: &TurnId,
        disposition: &TurnDisposition,
        usage: Option<&UsageDelta>,
    ) {
        tracing::info!(
            phase = "session",
            event = "turn_finalized",
            thread_id = %thread_id,
            turn_id = %turn_id,
            disposition = ?disposition,
            total_tokens = usage.map(|delta| delta.total_tokens),
            cost = usage.map(|delta| delta.cost.to_string())
        );
    }

    fn on_error_normalized(&self, thread_id: &ThreadId, record: &ErrorRecord) {
        tracing::warn!(
            phase = "session",
            event = "error_normalized",
            thread_id = %thread_id,
            error_code = record.code.as_str(),
            platform = %record.platform,
            status = record.status,
            message = %record.message
        );
    }

    fn on_unknown_provider_error(&self, platform: &str, message: &str) {
        tracing::warn!(
            phase = "session",
            event = "unknown_provider_error",
            platform,
            message
        );
    }
}

/// Logs key-health flags as they are reported by sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingKeyStatusSink;

impl KeyStatusSink for TracingKeyStatusSink {
    fn flag(&self, key_id: &ProviderKeyId, flag: KeyFlag) {
        tracing::warn!(
            phase = "keys",
            event = "key_flagged",
            key_id = %key_id,
            flag = %flag
        );
    }
}
