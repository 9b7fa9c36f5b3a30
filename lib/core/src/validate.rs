//! Validation of author-supplied identifiers.
//!
//! Flow names, stage names, step ids and step names all share the same
//! charset (`[A-Za-z0-9_-]+`). Environment variable keys handed to child
//! processes follow the stricter POSIX-style `[A-Z_][A-Z0-9_]*` rule.

use std::fmt;

/// Error describing a rejected identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// What kind of identifier was being validated ("step id", "env key", ...).
    pub what: &'static str,
    /// The offending value.
    pub value: String,
    /// The reason it was rejected.
    pub reason: &'static str,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} '{}': {}", self.what, self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

/// Validates a flow/stage/step identifier against `[A-Za-z0-9_-]+`.
///
/// # Errors
///
/// Returns an error when the value is empty or contains a character outside
/// the allowed set.
pub fn validate_name(what: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError {
            what,
            value: value.to_string(),
            reason: "must not be empty",
        });
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(ValidationError {
            what,
            value: value.to_string(),
            reason: "must match [A-Za-z0-9_-]+",
        });
    }
    Ok(())
}

/// Validates an environment variable key against `[A-Z_][A-Z0-9_]*`.
///
/// # Errors
///
/// Returns an error when the key is empty, starts with a digit, or contains
/// a character outside the allowed set.
pub fn validate_env_key(key: &str) -> Result<(), ValidationError> {
    let mut bytes = key.bytes();
    let valid_head = bytes
        .next()
        .is_some_and(|b| b.is_ascii_uppercase() || b == b'_');
    let valid_tail = key
        .bytes()
        .skip(1)
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_');

    if valid_head && valid_tail {
        Ok(())
    } else {
        Err(ValidationError {
            what: "env key",
            value: key.to_string(),
            reason: "must match [A-Z_][A-Z0-9_]*",
        })
    }
}
