//! Chat-layer errors and classification.

use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatErrorKind {
    InvalidRequest,
    /// A session method was invoked outside its lifecycle, e.g. after close.
    InvalidState,
    Provider,
    Memory,
    Ledger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatError {
    pub kind: ChatErrorKind,
    pub message: String,
}

impl ChatError {
    pub fn new(kind: ChatErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::InvalidRequest, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::InvalidState, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::Provider, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::Memory, message)
    }

    pub fn ledger(message: impl Into<String>) -> Self {
        Self::new(ChatErrorKind::Ledger, message)
    }
}

impl Display for ChatError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for ChatError {}

impl From<gprovider::ProviderError> for ChatError {
    fn from(value: gprovider::ProviderError) -> Self {
        ChatError::provider(value.to_string())
    }
}

impl From<gmemory::MemoryError> for ChatError {
    fn from(value: gmemory::MemoryError) -> Self {
        ChatError::memory(value.to_string())
    }
}

impl From<gledger::LedgerError> for ChatError {
    fn from(value: gledger::LedgerError) -> Self {
        ChatError::ledger(value.to_string())
    }
}
