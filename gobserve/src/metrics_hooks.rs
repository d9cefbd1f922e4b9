//! Metrics-based observability hooks for the session lifecycle.
//!
//! ```rust
//! use gchat::GatewayHooks;
//! use gobserve::MetricsGatewayHooks;
//!
//! fn accepts_hooks(_hooks: &dyn GatewayHooks) {}
//!
//! let hooks = MetricsGatewayHooks;
//! accepts_hooks(&hooks);
//! ```

use gchat::{GatewayHooks, TurnDisposition};
use gcommon::{ErrorRecord, ThreadId, TurnId};
use gprovider::UsageDelta;

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsGatewayHooks;

fn disposition_label(disposition: &TurnDisposition) -> String {
    match disposition {
        TurnDisposition::Completed => "completed".to_string(),
        TurnDisposition::Failed(code) => format!("failed_{}", code.as_str()),
        TurnDisposition::Disconnected => "disconnected".to_string(),
    }
}

impl GatewayHooks for MetricsGatewayHooks {
    fn on_turn_start(&self, _thread_id: &ThreadId, _turn_id: &TurnId) {
        metrics::counter!("gantry_turns_started_total").increment(1);
    }

    fn on_turn_finalized(
        &self,
        _thread_id: &ThreadId,
        _turn_id: &TurnId,
        disposition: &TurnDisposition,
        usage: Option<&UsageDelta>,
    ) {
        metrics::counter!(
            "gantry_turns_finalized_total",
            "disposition" => disposition_label(disposition)
        )
        .increment(1);

        if let Some(delta) = usage {
            metrics::counter!("gantry_prompt_tokens_total").increment(delta.prompt_tokens);
            metrics::counter!("gantry_completion_tokens_total").increment(delta.completion_tokens);
            metrics::counter!("gantry_cost_micros_total").increment(delta.cost.as_micros());
            metrics::histogram!("gantry_turn_total_tokens").record(delta.total_tokens as f64);
        }
    }

    fn on_error_normalized(&self, _thread_id: &ThreadId, record: &ErrorRecord) {
        metrics::counter!(
            "gantry_errors_total",
            "error_code" => record.code.as_str(),
            "platform" => record.platform.clone()
        )
        .increment(1);
    }

    fn on_unknown_provider_error(&self, platform: &str, _message: &str) {
        metrics::counter!(
            "gantry_unknown_errors_total",
            "platform" => platform.to_string()
        )
        .increment(1);
    }
}
