//! HTTP surface for the MaxQ orchestration engine.
//!
//! Everything under `/api/v1` speaks JSON. Flow scripts call back into
//! this surface (via `MAXQ_API`) to schedule stages; operators use it to
//! create and steer runs.

pub mod api;
pub mod config;
pub mod error;
pub mod state;
