//! The MaxQ execution engine.
//!
//! This crate owns everything between the HTTP surface and the store: the
//! DAG resolver that validates stage batches, the process supervisor that
//! spawns and reaps flow/step scripts, the scheduler loop that claims ready
//! steps, the run controller behind the run actions, and the startup
//! reconciler that clears phantom state after a crash.

pub mod controller;
pub mod dag;
pub mod error;
pub mod flow;
pub mod process;
pub mod reconcile;
pub mod registry;
pub mod scheduler;

pub use controller::{ControllerError, RunController};
pub use dag::{resolve_levels, DagError};
pub use error::EngineError;
pub use flow::{read_flow_title, FlowExecutor, FlowInvocation, FlowRunner};
pub use process::{spawn_script, ProcessError, ProcessOutput, SpawnSpec};
pub use reconcile::{reconcile_on_startup, ReconcileSummary};
pub use registry::{ProcessKey, ProcessRegistry, ProcessRole};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
