//! Shared application state for HTTP handlers.

use maxq_engine::RunController;
use maxq_store::Store;
use std::sync::Arc;

/// State threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    /// The database handle.
    pub store: Store,
    /// The run controller behind the action endpoints.
    pub controller: Arc<RunController>,
}

impl AppState {
    /// Creates the shared state.
    #[must_use]
    pub fn new(store: Store, controller: Arc<RunController>) -> Self {
        Self { store, controller }
    }
}
