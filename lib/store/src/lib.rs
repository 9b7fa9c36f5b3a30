//! Durable state for MaxQ runs, stages, steps and run logs.
//!
//! The store is a single SQLite database under the configured data
//! directory. All cross-worker coordination happens through three
//! primitives exposed by the repositories:
//!
//! - [`StepRepository::claim`]: a single conditional UPDATE that moves a
//!   step from `pending` to `running`; at most one worker wins.
//! - [`StageRepository::schedule`]: one transaction that upserts a stage by
//!   `(run_id, name)` and its steps by `(run_id, step_id)`, resetting
//!   execution fields on reuse. Replaying the same flow output reuses rows
//!   instead of duplicating them.
//! - The bulk `terminate_by_run` operations, which fail every non-terminal
//!   stage/step of a run with a termination reason.

pub mod error;
pub mod run;
pub mod run_log;
pub mod stage;
pub mod step;

pub use error::StoreError;
pub use run::{RunPatch, RunRecord, RunRepository, RunStatus, TerminationReason};
pub use run_log::{LogEntityType, LogLevel, RunLogFilter, RunLogRecord, RunLogRepository};
pub use stage::{StageRecord, StageRepository, StageStatus};
pub use step::{StepDef, StepOutcome, StepRecord, StepRepository, StepStatus};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

/// Sort order for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Sort key for run listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunSortBy {
    #[default]
    CreatedAt,
    CompletedAt,
}

impl RunSortBy {
    fn as_sql(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::CompletedAt => "completed_at",
        }
    }
}

/// Filter and pagination parameters for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub flow_name: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort_by: RunSortBy,
    pub sort_order: SortOrder,
}

/// A page of results with the total row count before pagination.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Handle to the MaxQ database.
///
/// Cheap to clone; each repository borrows the shared pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if necessary) the database at `{data_dir}/maxq.db`
    /// and applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be created or the
    /// database cannot be opened or migrated.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Database {
            message: format!("failed to create data dir: {e}"),
        })?;

        let options = SqliteConnectOptions::new()
            .filename(data_dir.join("maxq.db"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens a fresh in-memory database with the schema applied.
    ///
    /// Intended for tests; the single connection keeps the in-memory
    /// database alive for the pool's lifetime.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Run repository over this store.
    #[must_use]
    pub fn runs(&self) -> RunRepository {
        RunRepository::new(self.pool.clone())
    }

    /// Stage repository over this store.
    #[must_use]
    pub fn stages(&self) -> StageRepository {
        StageRepository::new(self.pool.clone())
    }

    /// Step repository over this store.
    #[must_use]
    pub fn steps(&self) -> StepRepository {
        StepRepository::new(self.pool.clone())
    }

    /// Run-log repository over this store.
    #[must_use]
    pub fn run_logs(&self) -> RunLogRepository {
        RunLogRepository::new(self.pool.clone())
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns an error when the database is unreachable.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Closes the pool, waiting for in-flight connections to drain.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
