//! Bridges a provider's push-style token source to the session's pull loop.
//!
//! A spawned producer task drains the adapter stream into a bounded channel;
//! the session consumes at its own pace (optionally delayed per chunk). The
//! producer's terminal result travels in-band after the last token, so the
//! pipeline ends exactly when the producer is done and the queue is drained.
//! Dropping the pipeline aborts the producer, so an abandoned transfer is
//! cancelled, never leaked.

use gprovider::{BoxedTokenStream, ProviderError};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum PipelineEvent {
    Token(String),
    /// Terminal event: how the producer ended.
    Closed(Result<(), ProviderError>),
}

pub struct TokenPipeline {
    receiver: mpsc::Receiver<PipelineEvent>,
    producer: JoinHandle<()>,
}

impl TokenPipeline {
    /// Queue bound between producer and consumer; backpressure suspends the
    /// producer when the consumer is pacing itself.
    pub const QUEUE_DEPTH: usize = 32;

    pub fn spawn(tokens: BoxedTokenStream) -> Self {
        let (sender, receiver) = mpsc::channel(Self::QUEUE_DEPTH);

        let producer = tokio::spawn(async move {
            let mut tokens = tokens;
            while let Some(item) = tokens.next().await {
                match item {
                    Ok(token) => {
                        if sender.send(PipelineEvent::Token(token)).await.is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = sender.send(PipelineEvent::Closed(Err(error))).await;
                        return;
                    }
                }
            }

            let _ = sender.send(PipelineEvent::Closed(Ok(()))).await;
        });

        Self { receiver, producer }
    }

    /// Next event, in provider emission order. `None` only after the channel
    /// is closed without a terminal event (producer aborted).
    pub async fn next(&mut self) -> Option<PipelineEvent> {
        self.receiver.recv().await
    }
}

impl Drop for TokenPipeline {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

/// Re-segments streamed text into fixed-size character chunks, independent
/// of the provider's token boundaries.
#[derive(Debug)]
pub struct Rechunker {
    buffer: Vec<char>,
    chunk_chars: usize,
}

impl Rechunker {
    pub fn new(chunk_chars: usize) -> Self {
        Self {
            buffer: Vec::new(),
            chunk_chars: chunk_chars.max(1),
        }
    }

    /// Buffers `text` and returns every complete chunk it produced.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.extend(text.chars());

        let mut chunks = Vec::new();
        while self.buffer.len() >= self.chunk_chars {
            chunks.push(self.buffer.drain(..self.chunk_chars).collect());
        }

        chunks
    }

    /// Returns the trailing partial chunk, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }

        Some(self.buffer.drain(..).collect())
    }
}
