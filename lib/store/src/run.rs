//! Run records and their repository.

use crate::error::StoreError;
use crate::{Page, RunFilter};
use chrono::{DateTime, Utc};
use maxq_core::RunId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, waiting for the initial flow invocation.
    Pending,
    /// The flow is executing.
    Running,
    /// Suspended by an operator; no new claims.
    Paused,
    /// A final stage completed.
    Completed,
    /// A stage failed or the run was terminated.
    Failed,
}

impl RunStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn from_str_value(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Parses a user-supplied status string.
    ///
    /// # Errors
    ///
    /// Returns the offending value when it names no known status.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(other.to_string()),
        }
    }

    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a run was terminated by something other than its own scripts.
///
/// A `None` termination reason on a failed run denotes a natural failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// An operator aborted the run.
    Aborted,
    /// The engine restarted while the run was live.
    ServerRestart,
}

impl TerminationReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::ServerRestart => "server_restart",
        }
    }

    pub(crate) fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "aborted" => Some(Self::Aborted),
            "server_restart" => Some(Self::ServerRestart),
            _ => None,
        }
    }
}

/// A run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Run ID.
    pub id: RunId,
    /// Flow directory name under the flows root.
    pub flow_name: String,
    /// Optional title from `flow.yaml`.
    pub flow_title: Option<String>,
    /// Current status.
    pub status: RunStatus,
    /// Input supplied at creation.
    pub input: Option<JsonValue>,
    /// Output attached by the flow.
    pub output: Option<JsonValue>,
    /// Error message for failed runs.
    pub error: Option<String>,
    /// Caller-supplied metadata.
    pub metadata: Option<JsonValue>,
    /// Operator-assigned name.
    pub name: Option<String>,
    /// Operator-assigned description.
    pub description: Option<String>,
    /// Non-natural termination marker; blocks new scheduling while set.
    pub termination_reason: Option<TerminationReason>,
    /// Captured stdout of the initial flow invocation.
    pub stdout: Option<String>,
    /// Captured stderr of the initial flow invocation.
    pub stderr: Option<String>,
    /// When created.
    pub created_at: DateTime<Utc>,
    /// When the initial flow started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Creates a new pending run.
    #[must_use]
    pub fn new(flow_name: String, input: Option<JsonValue>, metadata: Option<JsonValue>) -> Self {
        Self {
            id: RunId::new(),
            flow_name,
            flow_title: None,
            status: RunStatus::Pending,
            input,
            output: None,
            error: None,
            metadata,
            name: None,
            description: None,
            termination_reason: None,
            stdout: None,
            stderr: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// A partial update applied through the PATCH surface.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

const RUN_COLUMNS: &str = "id, flow_name, flow_title, status, input, output, error, metadata, \
     name, description, termination_reason, stdout, stderr, created_at, started_at, completed_at";

/// Row type for run queries.
#[derive(FromRow)]
struct RunRow {
    id: String,
    flow_name: String,
    flow_title: Option<String>,
    status: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    metadata: Option<String>,
    name: Option<String>,
    description: Option<String>,
    termination_reason: Option<String>,
    stdout: Option<String>,
    stderr: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

fn parse_json(column: &str, value: Option<String>) -> Result<Option<JsonValue>, StoreError> {
    value
        .map(|v| {
            serde_json::from_str(&v).map_err(|e| StoreError::Decode {
                message: format!("invalid JSON in {column}: {e}"),
            })
        })
        .transpose()
}

fn encode_json(value: &Option<JsonValue>) -> Option<String> {
    value.as_ref().map(std::string::ToString::to_string)
}

impl RunRow {
    fn try_into_record(self) -> Result<RunRecord, StoreError> {
        let id = RunId::from_str(&self.id).map_err(|e| StoreError::Decode {
            message: format!("invalid run id '{}': {e}", self.id),
        })?;

        Ok(RunRecord {
            id,
            flow_name: self.flow_name,
            flow_title: self.flow_title,
            status: RunStatus::from_str_value(&self.status),
            input: parse_json("input", self.input)?,
            output: parse_json("output", self.output)?,
            error: self.error,
            metadata: parse_json("metadata", self.metadata)?,
            name: self.name,
            description: self.description,
            termination_reason: self
                .termination_reason
                .as_deref()
                .and_then(TerminationReason::from_str_value),
            stdout: self.stdout,
            stderr: self.stderr,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Repository for run operations.
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    /// Creates a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new run.
    pub async fn create(&self, run: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO runs \
                 (id, flow_name, flow_title, status, input, output, error, metadata, \
                  name, description, termination_reason, stdout, stderr, \
                  created_at, started_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(&run.flow_name)
        .bind(&run.flow_title)
        .bind(run.status.as_str())
        .bind(encode_json(&run.input))
        .bind(encode_json(&run.output))
        .bind(&run.error)
        .bind(encode_json(&run.metadata))
        .bind(&run.name)
        .bind(&run.description)
        .bind(run.termination_reason.map(TerminationReason::as_str))
        .bind(&run.stdout)
        .bind(&run.stderr)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Finds a run by ID.
    pub async fn find_by_id(&self, id: RunId) -> Result<Option<RunRecord>, StoreError> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(RunRow::try_into_record).transpose()
    }

    /// Lists runs with optional filtering, pagination and sorting.
    pub async fn list(&self, filter: &RunFilter) -> Result<Page<RunRecord>, StoreError> {
        let mut clauses: Vec<&str> = Vec::new();
        if filter.flow_name.is_some() {
            clauses.push("flow_name = ?");
        }
        if filter.status.is_some() {
            clauses.push("status = ?");
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let limit = filter.limit.unwrap_or(50).clamp(1, 500);
        let offset = filter.offset.unwrap_or(0).max(0);
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs{where_sql} \
             ORDER BY {} {} LIMIT ? OFFSET ?",
            filter.sort_by.as_sql(),
            filter.sort_order.as_sql()
        );

        let mut query = sqlx::query_as::<_, RunRow>(&sql);
        if let Some(flow_name) = &filter.flow_name {
            query = query.bind(flow_name);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        let rows = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;

        let count_sql = format!("SELECT COUNT(*) FROM runs{where_sql}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(flow_name) = &filter.flow_name {
            count_query = count_query.bind(flow_name);
        }
        if let Some(status) = filter.status {
            count_query = count_query.bind(status.as_str());
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let data = rows
            .into_iter()
            .map(RunRow::try_into_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            data,
            total,
            limit,
            offset,
        })
    }

    /// Lists all runs that have not reached a terminal state.
    pub async fn list_non_terminal(&self) -> Result<Vec<RunRecord>, StoreError> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status NOT IN ('completed', 'failed')"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRow::try_into_record).collect()
    }

    /// Transitions a pending run to running.
    ///
    /// Returns false if the run was not pending.
    pub async fn mark_running(&self, id: RunId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'running', started_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves a run into a terminal state, if it is not already terminal.
    ///
    /// Returns false if another path finalized the run first.
    pub async fn finish(
        &self,
        id: RunId,
        status: RunStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE runs \
             SET status = ?, error = COALESCE(?, error), completed_at = ? \
             WHERE id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fails a non-terminal run with a termination reason (abort, restart).
    ///
    /// Returns false if the run was already terminal.
    pub async fn terminate(
        &self,
        id: RunId,
        reason: TerminationReason,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE runs \
             SET status = 'failed', termination_reason = ?, completed_at = ? \
             WHERE id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(reason.as_str())
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Pauses a non-terminal run.
    pub async fn pause(&self, id: RunId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'paused' \
             WHERE id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Resumes a paused run back to pending, clearing termination state.
    pub async fn resume(&self, id: RunId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE runs \
             SET status = 'pending', termination_reason = NULL, completed_at = NULL \
             WHERE id = ? AND status = 'paused'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Resets a failed run to pending ahead of a retry.
    pub async fn reset_for_retry(&self, id: RunId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE runs \
             SET status = 'pending', termination_reason = NULL, \
                 completed_at = NULL, error = NULL \
             WHERE id = ? AND status = 'failed'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Flips a non-completed run back to running after a step retry.
    pub async fn reopen_for_step_retry(&self, id: RunId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE runs \
             SET status = 'running', termination_reason = NULL, completed_at = NULL \
             WHERE id = ? AND status != 'completed'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Applies a PATCH-style partial update and returns the updated run.
    pub async fn apply_patch(
        &self,
        id: RunId,
        patch: &RunPatch,
    ) -> Result<Option<RunRecord>, StoreError> {
        let result = sqlx::query(
            "UPDATE runs SET \
                 status = COALESCE(?, status), \
                 output = COALESCE(?, output), \
                 error = COALESCE(?, error), \
                 name = COALESCE(?, name), \
                 description = COALESCE(?, description) \
             WHERE id = ?",
        )
        .bind(patch.status.map(RunStatus::as_str))
        .bind(encode_json(&patch.output))
        .bind(&patch.error)
        .bind(&patch.name)
        .bind(&patch.description)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    /// Stores the captured output of a flow invocation.
    pub async fn set_output_streams(
        &self,
        id: RunId,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE runs SET stdout = ?, stderr = ? WHERE id = ?")
            .bind(stdout)
            .bind(stderr)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
