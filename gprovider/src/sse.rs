//! Incremental server-sent-event decoding shared by the HTTP transports.

/// One dispatched SSE message: the optional `event:` name and the joined
/// `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseMessage {
    pub event: Option<String>,
    pub data: String,
}

/// Byte-oriented SSE decoder. Network chunks may split lines (and UTF-8
/// sequences) arbitrarily; lines are only interpreted once a `\n` arrives.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes in and returns every message completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(bytes);

        let mut messages = Vec::new();
        while let Some(newline_index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline_index).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(message) = self.consume_line(&line) {
                messages.push(message);
            }
        }

        messages
    }

    /// Flushes a trailing message that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseMessage> {
        self.dispatch()
    }

    fn consume_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }

        if let Some(event) = line.strip_prefix("event:") {
            self.event = Some(event.trim().to_string());
            return None;
        }

        if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(data.trim_start().to_string());
        }

        // Comment lines (":") and unknown fields are ignored.
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        if self.data_lines.is_empty() {
            self.event = None;
            return None;
        }

        Some(SseMessage {
            event: self.event.take(),
            data: self.data_lines.drain(..).collect::<Vec<_>>().join("\n"),
        })
    }
}
