//! Store error type.
//!
//! Every repository operation surfaces failures as a [`StoreError`] carrying
//! the underlying driver message; callers decide whether to retry.

use std::fmt;

/// Errors from store operations.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The underlying database driver reported an error.
    Database { message: String },
    /// A stored value could not be decoded into its domain representation.
    Decode { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database { message } => write!(f, "store database error: {message}"),
            Self::Decode { message } => write!(f, "store decode error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database {
            message: e.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Database {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode {
            message: e.to_string(),
        }
    }
}
