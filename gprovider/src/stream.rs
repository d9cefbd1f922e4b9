//! Streaming call contracts: lazy token sources and the usage promise.
//!
//! ```rust
//! use gprovider::{StreamingCall, UsageHandle, VecTokenStream};
//!
//! let (_reporter, usage) = UsageHandle::channel();
//! let _call = StreamingCall {
//!     tokens: Box::pin(VecTokenStream::new(vec![Ok("hi".to_string())])),
//!     usage,
//! };
//! ```

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::oneshot;

use crate::{ProviderError, UsageDelta};

/// Ordered text deltas from one streaming backend call.
///
/// Invariants for consumers:
/// - Deltas arrive in source order.
/// - An `Err` item is terminal; no further items follow it.
/// - Dropping the stream abandons the underlying transfer.
pub type BoxedTokenStream =
    Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send + 'static>>;

/// The two halves of a streaming invocation: the token source the caller
/// drains and the usage promise that becomes resolvable once the call has
/// finished or failed.
pub struct StreamingCall {
    pub tokens: BoxedTokenStream,
    pub usage: UsageHandle,
}

pub struct UsageHandle {
    receiver: oneshot::Receiver<UsageDelta>,
}

impl UsageHandle {
    pub fn channel() -> (UsageReporter, UsageHandle) {
        let (sender, receiver) = oneshot::channel();
        (
            UsageReporter {
                sender: Some(sender),
            },
            UsageHandle { receiver },
        )
    }

    /// Waits for the producer to report usage. Resolves to `None` when the
    /// producer went away without reporting (cancellation, early failure).
    pub async fn resolve(self) -> Option<UsageDelta> {
        self.receiver.await.ok()
    }
}

pub struct UsageReporter {
    sender: Option<oneshot::Sender<UsageDelta>>,
}

impl UsageReporter {
    /// Delivers the delta to the waiting handle. Only the first report wins.
    pub fn report(&mut self, delta: UsageDelta) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(delta);
        }
    }

    pub fn has_reported(&self) -> bool {
        self.sender.is_none()
    }
}

#[derive(Debug)]
pub struct VecTokenStream {
    items: VecDeque<Result<String, ProviderError>>,
}

impl VecTokenStream {
    pub fn new(items: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

impl Stream for VecTokenStream {
    type Item = Result<String, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.items.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::{ProviderKind, UsageDelta};

    #[tokio::test]
    async fn usage_handle_resolves_reported_delta() {
        let (mut reporter, handle) = UsageHandle::channel();
        assert!(!reporter.has_reported());

        reporter.report(UsageDelta::tokens(30, 20));
        assert!(reporter.has_reported());

        // A second report is ignored rather than panicking.
        reporter.report(UsageDelta::tokens(999, 999));

        let delta = handle.resolve().await.expect("usage should resolve");
        assert_eq!(delta.prompt_tokens, 30);
        assert_eq!(delta.completion_tokens, 20);
        assert_eq!(delta.total_tokens, 50);
    }

    #[tokio::test]
    async fn usage_handle_resolves_none_when_reporter_dropped() {
        let (reporter, handle) = UsageHandle::channel();
        drop(reporter);

        assert_eq!(handle.resolve().await, None);
    }

    #[tokio::test]
    async fn vec_token_stream_yields_items_in_order() {
        let stream = VecTokenStream::new(vec![
            Ok("one".to_string()),
            Ok("two".to_string()),
            Err(crate::ProviderError::timeout(
                ProviderKind::OpenAi,
                "too slow",
            )),
        ]);

        let items: Vec<_> = Box::pin(stream).collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_deref().expect("first token"), "one");
        assert_eq!(items[1].as_deref().expect("second token"), "two");
        assert!(items[2].is_err());
    }
}
