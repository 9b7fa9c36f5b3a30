//! Core domain types and utilities for the MaxQ orchestration engine.
//!
//! This crate provides the strongly-typed identifiers and the identifier
//! validation rules shared by every other MaxQ crate.

pub mod id;
pub mod validate;

pub use id::{ParseIdError, RunId, RunLogId, StageId, WorkerId};
pub use validate::{validate_env_key, validate_name, ValidationError};
