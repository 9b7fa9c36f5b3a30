//! Engine error type.

use crate::process::ProcessError;
use maxq_store::StoreError;
use std::fmt;

/// Errors from scheduler and reconciler internals.
#[derive(Debug)]
pub enum EngineError {
    /// Store error.
    Store(StoreError),
    /// Process supervision error.
    Process(ProcessError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Process(e) => write!(f, "process error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ProcessError> for EngineError {
    fn from(e: ProcessError) -> Self {
        Self::Process(e)
    }
}
