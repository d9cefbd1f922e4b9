//! Outbound stream frame encoding.
//!
//! Every emitted chunk is wrapped as `data: <chunk>\n\n` with an out-of-band
//! status: 200 while content is flowing, the error's HTTP-equivalent on the
//! terminal frame. The terminal frame body is a JSON envelope carrying the
//! stable error code.

use gcommon::ErrorRecord;
use serde::Serialize;

pub const STREAMING_STATUS: u16 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub status: u16,
    pub body: String,
}

impl Frame {
    pub fn content(chunk: &str) -> Self {
        Self {
            status: STREAMING_STATUS,
            body: encode_chunk(chunk),
        }
    }

    pub fn terminal_error(record: &ErrorRecord) -> Self {
        Self {
            status: record.status,
            body: encode_chunk(&encode_error_payload(record)),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status != STREAMING_STATUS
    }
}

pub fn encode_chunk(chunk: &str) -> String {
    format!("data: {chunk}\n\n")
}

#[derive(Serialize)]
struct ErrorFramePayload<'a> {
    status: u16,
    message: &'a str,
    data: ErrorFrameData<'a>,
}

#[derive(Serialize)]
struct ErrorFrameData<'a> {
    content: &'a str,
    error_code: &'a str,
}

fn encode_error_payload(record: &ErrorRecord) -> String {
    let payload = ErrorFramePayload {
        status: record.status,
        message: &record.message,
        data: ErrorFrameData {
            content: &record.message,
            error_code: record.code.as_str(),
        },
    };

    serde_json::to_string(&payload).unwrap_or_else(|_| {
        format!(
            "{{\"status\":{},\"message\":\"error frame encoding failed\",\"data\":{{\"content\":\"\",\"error_code\":\"{}\"}}}}",
            record.status,
            record.code.as_str()
        )
    })
}
