//! Production-friendly observability hooks for the gateway lifecycle.
//!
//! ```rust
//! use gobserve::{MetricsGatewayHooks, SafeGatewayHooks, TracingGatewayHooks};
//!
//! let _hooks = SafeGatewayHooks::new(TracingGatewayHooks);
//! let _metrics = MetricsGatewayHooks;
//! ```

mod metrics_hooks;
mod safe_hooks;
mod tracing_hooks;

pub use metrics_hooks::MetricsGatewayHooks;
pub use safe_hooks::SafeGatewayHooks;
pub use tracing_hooks::{TracingGatewayHooks, TracingKeyStatusSink};

pub mod prelude {
    pub use crate::{
        MetricsGatewayHooks, SafeGatewayHooks, TracingGatewayHooks, TracingKeyStatusSink,
    };
}
