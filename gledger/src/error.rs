//! Ledger-layer errors.

use std::error::Error;
use std::fmt::{Display, Formatter};

use gmemory::MemoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorKind {
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
}

impl LedgerError {
    pub fn new(kind: LedgerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::Store, message)
    }
}

impl Display for LedgerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for LedgerError {}

impl From<MemoryError> for LedgerError {
    fn from(value: MemoryError) -> Self {
        LedgerError::store(value.to_string())
    }
}
