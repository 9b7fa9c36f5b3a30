//! Stage records and the transactional stage-schedule primitive.

use crate::error::StoreError;
use crate::run::TerminationReason;
use crate::step::{StepDef, StepRepository, StepRecord};
use chrono::{DateTime, Utc};
use maxq_core::{RunId, StageId};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Steps scheduled, none finished yet.
    Pending,
    /// At least one step is executing.
    Running,
    /// Every step completed.
    Completed,
    /// Every step is terminal and at least one failed.
    Failed,
}

impl StageStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn from_str_value(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A stage record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    /// Stage ID.
    pub id: StageId,
    /// Owning run.
    pub run_id: RunId,
    /// Stage name, unique within the run.
    pub name: String,
    /// Whether completing this stage completes the run.
    #[serde(rename = "final")]
    pub is_final: bool,
    /// Current status.
    pub status: StageStatus,
    /// Non-natural termination marker.
    pub termination_reason: Option<TerminationReason>,
    /// When first scheduled.
    pub created_at: DateTime<Utc>,
    /// When the first step was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

const STAGE_COLUMNS: &str =
    "id, run_id, name, is_final, status, termination_reason, created_at, started_at, completed_at";

/// Row type for stage queries.
#[derive(FromRow)]
struct StageRow {
    id: String,
    run_id: String,
    name: String,
    is_final: bool,
    status: String,
    termination_reason: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl StageRow {
    fn try_into_record(self) -> Result<StageRecord, StoreError> {
        let id = StageId::from_str(&self.id).map_err(|e| StoreError::Decode {
            message: format!("invalid stage id '{}': {e}", self.id),
        })?;
        let run_id = RunId::from_str(&self.run_id).map_err(|e| StoreError::Decode {
            message: format!("invalid run id '{}': {e}", self.run_id),
        })?;

        Ok(StageRecord {
            id,
            run_id,
            name: self.name,
            is_final: self.is_final,
            status: StageStatus::from_str_value(&self.status),
            termination_reason: self
                .termination_reason
                .as_deref()
                .and_then(TerminationReason::from_str_value),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Repository for stage operations.
pub struct StageRepository {
    pool: SqlitePool,
}

impl StageRepository {
    /// Creates a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Finds a stage by ID.
    pub async fn find_by_id(&self, id: StageId) -> Result<Option<StageRecord>, StoreError> {
        let row: Option<StageRow> =
            sqlx::query_as(&format!("SELECT {STAGE_COLUMNS} FROM stages WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(StageRow::try_into_record).transpose()
    }

    /// Finds a stage by run and name.
    pub async fn find_by_name(
        &self,
        run_id: RunId,
        name: &str,
    ) -> Result<Option<StageRecord>, StoreError> {
        let row: Option<StageRow> = sqlx::query_as(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages WHERE run_id = ? AND name = ?"
        ))
        .bind(run_id.to_string())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StageRow::try_into_record).transpose()
    }

    /// Lists a run's stages in creation order.
    pub async fn list_by_run(&self, run_id: RunId) -> Result<Vec<StageRecord>, StoreError> {
        let rows: Vec<StageRow> = sqlx::query_as(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages WHERE run_id = ? ORDER BY created_at ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StageRow::try_into_record).collect()
    }

    /// Counts a run's stages that have not reached a terminal state.
    pub async fn count_live_by_run(&self, run_id: RunId) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM stages \
             WHERE run_id = ? AND status IN ('pending', 'running')",
        )
        .bind(run_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Schedules (or re-initialises) a stage and its steps in one
    /// transaction.
    ///
    /// The stage is upserted by `(run_id, name)`: on reuse its timestamps
    /// and termination reason are cleared and `is_final` refreshed. Each
    /// step is upserted by `(run_id, step_id)` with every execution field
    /// cleared and `queued_at` set to now. Rolls back entirely on any
    /// failure, which makes replaying the same flow output idempotent.
    pub async fn schedule(
        &self,
        run_id: RunId,
        name: &str,
        is_final: bool,
        steps: &[StepDef],
    ) -> Result<(StageRecord, Vec<StepRecord>), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM stages WHERE run_id = ? AND name = ?")
                .bind(run_id.to_string())
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;

        let stage_id = match existing {
            Some((id,)) => {
                let stage_id = StageId::from_str(&id).map_err(|e| StoreError::Decode {
                    message: format!("invalid stage id '{id}': {e}"),
                })?;
                sqlx::query(
                    "UPDATE stages \
                     SET is_final = ?, status = 'pending', termination_reason = NULL, \
                         started_at = NULL, completed_at = NULL \
                     WHERE id = ?",
                )
                .bind(is_final)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                stage_id
            }
            None => {
                let stage_id = StageId::new();
                sqlx::query(
                    "INSERT INTO stages (id, run_id, name, is_final, status, created_at) \
                     VALUES (?, ?, ?, ?, 'pending', ?)",
                )
                .bind(stage_id.to_string())
                .bind(run_id.to_string())
                .bind(name)
                .bind(is_final)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                stage_id
            }
        };

        for def in steps {
            StepRepository::upsert_in_tx(&mut tx, run_id, stage_id, def, now).await?;
        }

        tx.commit().await?;

        let stage = self
            .find_by_id(stage_id)
            .await?
            .ok_or_else(|| StoreError::Database {
                message: "scheduled stage vanished".to_string(),
            })?;
        let step_ids: Vec<&str> = steps.iter().map(|d| d.id.as_str()).collect();
        let mut records = Vec::with_capacity(step_ids.len());
        let step_repo = StepRepository::new(self.pool.clone());
        for step_id in step_ids {
            if let Some(record) = step_repo.find(run_id, step_id).await? {
                records.push(record);
            }
        }

        Ok((stage, records))
    }

    /// Transitions a pending stage to running when its first step starts.
    pub async fn mark_running(&self, id: StageId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE stages SET status = 'running', started_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finalizes a stage once every step is terminal.
    ///
    /// Conditional on the stage still being live, so exactly one worker
    /// wins the completion and fires the flow callback.
    pub async fn finish(
        &self,
        id: StageId,
        status: StageStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE stages SET status = ?, completed_at = ? \
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Reopens a terminal stage whose step is being retried.
    pub async fn reopen(&self, id: StageId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE stages \
             SET status = 'running', termination_reason = NULL, completed_at = NULL \
             WHERE id = ?",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Resets every non-completed stage of a run to pending (resume, retry).
    pub async fn reset_non_completed_by_run(
        &self,
        run_id: RunId,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE stages \
             SET status = 'pending', termination_reason = NULL, \
                 started_at = NULL, completed_at = NULL \
             WHERE run_id = ? AND status != 'completed'",
        )
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Fails every non-terminal stage of a run with a termination reason.
    pub async fn terminate_by_run(
        &self,
        run_id: RunId,
        reason: TerminationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE stages \
             SET status = 'failed', termination_reason = ?, completed_at = ? \
             WHERE run_id = ? AND status IN ('pending', 'running')",
        )
        .bind(reason.as_str())
        .bind(now)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
