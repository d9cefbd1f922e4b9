//! Vendor adapter implementations.

pub mod anthropic;
pub mod openai_compat;

pub use anthropic::{AnthropicAdapter, AnthropicBinder, AnthropicHttpTransport, AnthropicTransport};
pub use openai_compat::{
    OpenAiCompatAdapter, OpenAiCompatBinder, OpenAiCompatHttpTransport, OpenAiCompatTransport,
};
